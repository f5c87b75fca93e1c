use crate::core::features::EnabledLevels;
use crate::core::fusion::{HashWeights, LevelWeights, MidWeights, Redistribution};
use crate::services::cache::CacheOptions;
use crate::services::memory::MemoryThresholds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every tunable of the indexing and grouping engine. Any field missing from
/// a config file keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Inserts between rebuild-counter bumps.
    pub incremental_threshold: usize,
    /// Counter bumps between full tree rebuilds.
    pub rebuild_threshold: usize,
    pub max_height_skew: usize,
    /// Steepness of the distance-to-similarity curve.
    pub distance_decay: f64,
    /// Fraction of each vector kept by the compressor, in `[0, 1]`.
    pub compression_ratio: f64,

    /// Stage 1 cut-off, weighted multi-hash similarity on a 0..=100 scale.
    pub similarity_threshold: f64,
    /// Stage 2 cut-off, histogram cosine.
    pub histogram_threshold: f64,
    /// Stage 3 cut-off, deep-feature cosine.
    pub deep_threshold: f64,
    /// Deep comparisons allowed per grouping run.
    pub deep_budget: usize,

    pub enabled_levels: EnabledLevels,
    pub level_weights: LevelWeights,
    pub mid_weights: MidWeights,
    pub hash_weights: HashWeights,
    pub redistribution: Redistribution,

    pub lsh_bands: usize,
    /// Mid-level neighbours fetched per seed in addition to LSH candidates.
    pub knn_candidates: usize,

    pub batch_size: usize,
    pub max_concurrent_tasks: usize,

    pub memory_budget_bytes: u64,
    pub memory: MemoryThresholds,

    /// Slots (f32) in the shared transfer buffer.
    pub buffer_pool_slots: usize,
    /// Vectors shorter than this travel inline instead of through the pool.
    pub pooled_min_len: usize,

    pub cache: CacheOptions,
    pub supported_formats: Vec<String>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            incremental_threshold: 100,
            rebuild_threshold: 5,
            max_height_skew: 2,
            distance_decay: 5.0,
            compression_ratio: 0.5,
            similarity_threshold: 85.0,
            histogram_threshold: 0.85,
            deep_threshold: 0.9,
            deep_budget: 10_000,
            enabled_levels: EnabledLevels::default(),
            level_weights: LevelWeights::default(),
            mid_weights: MidWeights::default(),
            hash_weights: HashWeights::default(),
            redistribution: Redistribution::default(),
            lsh_bands: 8,
            knn_candidates: 16,
            batch_size: 32,
            max_concurrent_tasks: num_cpus::get(),
            memory_budget_bytes: 2 * 1024 * 1024 * 1024,
            memory: MemoryThresholds::default(),
            buffer_pool_slots: 1 << 20,
            pooled_min_len: 256,
            cache: CacheOptions::default(),
            supported_formats: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "tiff".to_string(),
                "tif".to_string(),
                "webp".to_string(),
                "bmp".to_string(),
            ],
        }
    }
}

impl IndexOptions {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.into(),
            })
        }

        if !(0.0..=1.0).contains(&self.compression_ratio) {
            return invalid("compression_ratio", "must be within [0, 1]");
        }
        if !(0.0..=100.0).contains(&self.similarity_threshold) {
            return invalid("similarity_threshold", "must be within [0, 100]");
        }
        for (field, value) in [
            ("histogram_threshold", self.histogram_threshold),
            ("deep_threshold", self.deep_threshold),
            ("memory.high", self.memory.high),
            ("memory.critical", self.memory.critical),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(field, "must be within [0, 1]");
            }
        }
        if self.memory.high > self.memory.critical {
            return invalid("memory.high", "must not exceed memory.critical");
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be at least 1");
        }
        if self.lsh_bands == 0 || self.lsh_bands > 64 {
            return invalid("lsh_bands", "must be within 1..=64");
        }
        if self.distance_decay <= 0.0 {
            return invalid("distance_decay", "must be positive");
        }
        if self.level_weights.sum() <= 0.0 {
            return invalid("level_weights", "at least one weight must be positive");
        }
        Ok(())
    }

    /// Lowercase extension check against `supported_formats`.
    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .is_some_and(|e| self.supported_formats.iter().any(|f| *f == e))
    }
}
