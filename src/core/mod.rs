// Per-photo analysis: fingerprints, feature levels, quality, fusion and
// vector compression. Nothing in here holds state across photos.

pub mod compress;
pub mod extractor;
pub mod features;
pub mod fusion;
pub mod hash;
pub mod quality;

pub use compress::VectorCompressor;
pub use extractor::{ExtractionError, FeatureExtractor, PixelEmbeddingExtractor};
pub use features::{EnabledLevels, FeatureBuilder, FeatureLevel, MidLevelFeatures, MultiLevelFeature};
pub use fusion::{FeatureFusion, FusionMethod, FusionResult, HashWeights, LevelWeights, MidWeights, Redistribution};
pub use hash::{Fingerprint, FingerprintSet, HashAlgorithm, HashEngine, HashError};
pub use quality::{QualityScore, QualityScorer};
