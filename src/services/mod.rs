pub mod cache;
pub mod grouping;
pub mod lsh;
pub mod memory;
pub mod tasks;

pub use cache::{CacheError, CacheKey, CacheKind, CacheLayer, CacheOptions, CachePayload, EvictionPolicy, JsonFileStore};
pub use grouping::{
    BatchReport, FailureKind, GroupingPipeline, IndexProgress, PhotoInput, PhotoRecord, PhotoSource,
    PipelineBuilder, PipelineError, PipelineState, SimilarityGroup,
};
pub use memory::{MemoryMonitor, MemoryProbe, MemoryThresholds, PressureLevel, ProcessMemoryProbe};
pub use tasks::{CancellationToken, TaskError, TaskHandle, TaskQueue};
