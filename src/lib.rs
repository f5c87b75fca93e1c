//! Near-duplicate photo detection.
//!
//! Photos are fingerprinted and described at three levels (hashes, colour and
//! texture, optional deep features), indexed in per-level KD-trees, and
//! grouped by a staged filter. The best-quality photo of each group is its
//! representative.

pub mod config;
pub mod core;
pub mod index;
pub mod services;

pub use config::{ConfigError, IndexOptions};
pub use index::{IncrementalIndex, IndexError, IndexState, IndexTuning};
pub use services::grouping::{GroupingPipeline, PhotoInput, SimilarityGroup};
