//! Batch indexing and staged similarity grouping.
//!
//! `index_photos` runs extraction on the task queue in `batch_size` chunks and
//! applies the results to the index from the calling thread, so the index
//! only ever sees one writer. `group` walks the indexed photos in insertion
//! order, gathers candidates from LSH buckets and mid-level kNN, and keeps
//! the ones that pass every enabled stage.

use crate::config::IndexOptions;
use crate::core::compress::VectorCompressor;
use crate::core::extractor::FeatureExtractor;
use crate::core::features::{FeatureBuilder, FeatureLevel, MultiLevelFeature};
use crate::core::fusion::{cosine_similarity, weighted_hash_similarity, FeatureFusion};
use crate::core::hash::{content_hash, FingerprintSet, HashEngine};
use crate::core::quality::{QualityScore, QualityScorer};
use crate::index::arena::{SharedBufferPool, VectorPayload};
use crate::index::point::FeaturePoint;
use crate::index::{IncrementalIndex, IndexError, IndexTuning};
use crate::services::cache::{CacheKey, CacheKind, CacheLayer, CachePayload};
use crate::services::lsh::LshIndex;
use crate::services::memory::{
    MemoryMonitor, MemoryProbe, PressureLevel, ProcessMemoryProbe, ReliefOutcome,
};
use crate::services::tasks::{CancellationToken, TaskError, TaskHandle, TaskQueue};
use crossbeam_channel::Sender;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

/// Share of cache entries dropped each time memory pressure is relieved.
const IDLE_CACHE_FRACTION: f64 = 0.25;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Indexing,
    Grouping,
    /// Indexing held back until memory pressure drops.
    Paused,
    Done,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum PhotoSource {
    /// Read from disk by the worker that extracts it.
    Path(PathBuf),
    Encoded(Vec<u8>),
    Decoded(DynamicImage),
}

#[derive(Debug, Clone)]
pub struct PhotoInput {
    pub id: String,
    pub source: PhotoSource,
    /// Modification time, Unix millis. Part of the cache key.
    pub last_modified: i64,
    pub size: u64,
}

impl PhotoInput {
    pub fn encoded(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            id: id.into(),
            source: PhotoSource::Encoded(bytes),
            last_modified: 0,
            size,
        }
    }

    pub fn decoded(id: impl Into<String>, image: DynamicImage) -> Self {
        let size = image.as_bytes().len() as u64;
        Self {
            id: id.into(),
            source: PhotoSource::Decoded(image),
            last_modified: 0,
            size,
        }
    }

    /// A photo on disk, keyed by its path. Only metadata is read here.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Ok(Self {
            id: path.to_string_lossy().to_string(),
            source: PhotoSource::Path(path.to_path_buf()),
            last_modified,
            size: metadata.len(),
        })
    }

    fn cache_key(&self, kind: CacheKind) -> CacheKey {
        CacheKey::new(self.id.clone(), self.last_modified, self.size, kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    Io,
    Decode,
    Extraction,
    Rejected,
    Worker,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Io => "io",
            FailureKind::Decode => "decode",
            FailureKind::Extraction => "extraction",
            FailureKind::Rejected => "rejected",
            FailureKind::Worker => "worker",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoFailure {
    pub photo_id: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub indexed: usize,
    pub from_cache: usize,
    pub failures: Vec<PhotoFailure>,
    /// Chunks that started under high or critical memory pressure.
    pub pressure_events: usize,
    /// Critical-pressure pauses that gave up waiting.
    pub pause_timeouts: usize,
}

impl BatchReport {
    pub fn failure_counts(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn summarize(failures: &[PhotoFailure]) -> String {
        let mut counts: BTreeMap<FailureKind, usize> = BTreeMap::new();
        for failure in failures {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
            .iter()
            .map(|(kind, count)| format!("{} {}", count, kind))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexProgress {
    pub processed: usize,
    pub total: usize,
    pub current_photo: String,
}

/// What the pipeline keeps per indexed photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoRecord {
    pub feature: MultiLevelFeature,
    pub quality: QualityScore,
    pub last_modified: i64,
    pub size: u64,
}

impl PhotoRecord {
    pub fn fingerprints(&self) -> Option<&FingerprintSet> {
        self.feature.low.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGroup {
    pub id: String,
    /// Seed first, then the other members in indexing order.
    pub members: Vec<String>,
    pub representative: String,
    /// Mean fused similarity (0..=100) between the seed and the other members.
    pub average_similarity: f64,
}

#[derive(Debug, Default)]
struct Catalog {
    records: HashMap<String, PhotoRecord>,
    order: Vec<String>,
}

impl Catalog {
    fn upsert(&mut self, id: String, record: PhotoRecord) {
        if self.records.insert(id.clone(), record).is_none() {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.records.remove(id).is_some() {
            self.order.retain(|o| o != id);
            true
        } else {
            false
        }
    }
}

/// Output of one extraction task, before it is applied to the index.
struct Extracted {
    id: String,
    feature: MultiLevelFeature,
    high: Option<VectorPayload>,
    quality: QualityScore,
    last_modified: i64,
    size: u64,
    from_cache: bool,
    cache_keys: Option<(CacheKey, CacheKey, CacheKey)>,
}

/// Everything a worker needs to process one photo.
struct ExtractionJob {
    input: PhotoInput,
    known_low: Option<FingerprintSet>,
    hash_engine: Arc<HashEngine>,
    scorer: Arc<QualityScorer>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    options: Arc<IndexOptions>,
    buffers: SharedBufferPool,
}

impl ExtractionJob {
    fn run(self, token: &CancellationToken) -> Result<Extracted, PhotoFailure> {
        let id = self.input.id.clone();
        let failure = |kind: FailureKind, message: String| PhotoFailure {
            photo_id: id.clone(),
            kind,
            message,
        };
        if token.is_cancelled() {
            return Err(failure(FailureKind::Worker, "cancelled before start".to_string()));
        }

        let decode = |bytes: &[u8]| {
            image::load_from_memory(bytes)
                .map(|image| (image, content_hash(bytes)))
                .map_err(|e| failure(FailureKind::Decode, e.to_string()))
        };
        let (image, digest) = match &self.input.source {
            PhotoSource::Path(path) => {
                let bytes =
                    std::fs::read(path).map_err(|e| failure(FailureKind::Io, e.to_string()))?;
                decode(bytes.as_slice())?
            }
            PhotoSource::Encoded(bytes) => decode(bytes.as_slice())?,
            PhotoSource::Decoded(image) => (image.clone(), content_hash(image.as_bytes())),
        };

        let mut feature = FeatureBuilder::new(&self.hash_engine, self.options.enabled_levels)
            .with_extractor(self.extractor.as_deref())
            .build(&self.input.id, &image, digest, self.known_low)
            .map_err(|e| failure(FailureKind::Extraction, e.to_string()))?;
        let quality = self.scorer.score(&image);
        let high = feature.high.take().map(|v| self.buffers.stage(v));
        let features_key = self.input.cache_key(CacheKind::Features);

        Ok(Extracted {
            id: self.input.id.clone(),
            feature,
            high,
            quality,
            last_modified: self.input.last_modified,
            size: self.input.size,
            from_cache: false,
            cache_keys: Some((
                features_key.with_kind(CacheKind::Fingerprints),
                features_key.clone(),
                features_key.with_kind(CacheKind::Quality),
            )),
        })
    }
}

enum Pending {
    Ready(Box<Extracted>),
    Running(String, TaskHandle<Result<Extracted, PhotoFailure>>),
}

pub struct PipelineBuilder {
    options: IndexOptions,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    index: Option<Arc<IncrementalIndex>>,
    cache: Option<Arc<CacheLayer>>,
    probe: Option<Box<dyn MemoryProbe>>,
    progress_sender: Option<Sender<IndexProgress>>,
}

impl PipelineBuilder {
    pub fn new(options: IndexOptions) -> Self {
        Self {
            options,
            extractor: None,
            index: None,
            cache: None,
            probe: None,
            progress_sender: None,
        }
    }

    pub fn extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Uses an existing index instead of creating a configured one.
    pub fn index(mut self, index: Arc<IncrementalIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_progress_sender(mut self, sender: Sender<IndexProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn build(self) -> Result<GroupingPipeline, PipelineError> {
        let options = Arc::new(self.options);
        let index = self.index.unwrap_or_else(|| {
            Arc::new(IncrementalIndex::with_compressor(
                IndexTuning::from(options.as_ref()),
                VectorCompressor::new(options.compression_ratio),
            ))
        });
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(CacheLayer::new(options.cache.clone())));
        let buffers = SharedBufferPool::new(options.buffer_pool_slots, options.pooled_min_len);

        let probe: Box<dyn MemoryProbe> = match self.probe {
            Some(probe) => probe,
            // Whichever is larger: process RSS, or what the pipeline itself holds
            None => {
                let (index, cache, buffers) = (index.clone(), cache.clone(), buffers.clone());
                Box::new(move || {
                    let held =
                        index.approx_bytes() + cache.approx_bytes() + buffers.resident_bytes();
                    (held as u64).max(ProcessMemoryProbe.used_bytes())
                })
            }
        };
        let monitor = MemoryMonitor::new(probe, options.memory_budget_bytes, options.memory);

        let cancellation_token = CancellationToken::new();
        let queue = TaskQueue::new(options.max_concurrent_tasks, cancellation_token.clone())?;

        let fusion = FeatureFusion::new(options.level_weights, options.enabled_levels)
            .with_mid_weights(options.mid_weights)
            .with_redistribution(options.redistribution);

        Ok(GroupingPipeline {
            lsh: Mutex::new(LshIndex::new(options.lsh_bands)),
            options,
            index,
            cache,
            extractor: self.extractor,
            hash_engine: Arc::new(HashEngine::new()),
            scorer: Arc::new(QualityScorer::new()),
            fusion,
            queue,
            buffers,
            monitor,
            cancellation_token,
            state: Mutex::new(PipelineState::Idle),
            catalog: RwLock::new(Catalog::default()),
            progress_sender: self.progress_sender,
        })
    }
}

pub struct GroupingPipeline {
    options: Arc<IndexOptions>,
    index: Arc<IncrementalIndex>,
    cache: Arc<CacheLayer>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    hash_engine: Arc<HashEngine>,
    scorer: Arc<QualityScorer>,
    fusion: FeatureFusion,
    queue: TaskQueue,
    buffers: SharedBufferPool,
    monitor: MemoryMonitor,
    cancellation_token: CancellationToken,
    state: Mutex<PipelineState>,
    catalog: RwLock<Catalog>,
    lsh: Mutex<LshIndex>,
    progress_sender: Option<Sender<IndexProgress>>,
}

impl GroupingPipeline {
    pub fn builder(options: IndexOptions) -> PipelineBuilder {
        PipelineBuilder::new(options)
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub fn index(&self) -> &Arc<IncrementalIndex> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    /// Transfer pool the workers stage high-level vectors into.
    pub fn buffers(&self) -> &SharedBufferPool {
        &self.buffers
    }

    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stops the current operation at its next check. Work already applied
    /// to the index stays.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
        self.set_state(PipelineState::Cancelled);
    }

    /// Clears a previous cancellation so the pipeline can run again.
    pub fn reset(&self) {
        self.cancellation_token.reset();
        self.set_state(PipelineState::Idle);
    }

    pub fn len(&self) -> usize {
        self.read_catalog().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn photo(&self, id: &str) -> Option<PhotoRecord> {
        self.read_catalog().records.get(id).cloned()
    }

    pub fn index_photos(&self, inputs: Vec<PhotoInput>) -> Result<BatchReport, PipelineError> {
        self.index.compressor()?;
        self.check_cancelled()?;
        self.set_state(PipelineState::Indexing);

        let mut report = BatchReport {
            total: inputs.len(),
            ..BatchReport::default()
        };
        let batch_size = self.options.batch_size.max(1);
        let mut remaining = inputs.into_iter();
        let mut batch_number = 0;
        let mut processed = 0;

        loop {
            let chunk: Vec<PhotoInput> = remaining.by_ref().take(batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            batch_number += 1;
            self.check_cancelled()?;
            self.relieve_pressure(&mut report)?;

            let chunk_len = chunk.len();
            let pending: Vec<Pending> = chunk.into_iter().map(|input| self.dispatch(input)).collect();

            let mut extracted = Vec::with_capacity(chunk_len);
            let mut failures = Vec::new();
            for job in pending {
                let (id, result) = match job {
                    Pending::Ready(done) => (done.id.clone(), Ok(*done)),
                    Pending::Running(id, handle) => match handle.wait() {
                        Ok(result) => (id, result),
                        Err(TaskError::Cancelled) => {
                            self.set_state(PipelineState::Cancelled);
                            return Err(PipelineError::Cancelled);
                        }
                        Err(e) => {
                            let failure = PhotoFailure {
                                photo_id: id.clone(),
                                kind: FailureKind::Worker,
                                message: e.to_string(),
                            };
                            (id, Err(failure))
                        }
                    },
                };
                match result {
                    Ok(done) => extracted.push(done),
                    Err(failure) => failures.push(failure),
                }
                processed += 1;
                self.send_progress(processed, report.total, &id);
            }

            let (indexed, from_cache) = self.apply(extracted, &mut failures)?;
            report.indexed += indexed;
            report.from_cache += from_cache;

            log::info!(
                "Batch {}: indexed {} of {} photos ({} from cache)",
                batch_number,
                indexed,
                chunk_len,
                from_cache
            );
            if !failures.is_empty() {
                log::warn!(
                    "Batch {}: {} photos failed ({})",
                    batch_number,
                    failures.len(),
                    BatchReport::summarize(&failures)
                );
            }
            report.failures.extend(failures);
        }

        self.set_state(PipelineState::Idle);
        Ok(report)
    }

    /// Groups every indexed photo. Each photo lands in at most one group.
    pub fn group(&self) -> Result<Vec<SimilarityGroup>, PipelineError> {
        self.index.compressor()?;
        self.check_cancelled()?;
        self.set_state(PipelineState::Grouping);

        let catalog = self.read_catalog();
        let position: HashMap<&str, usize> = catalog
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let lsh = self.lock_lsh();

        let mut grouped: HashSet<String> = HashSet::new();
        let mut deep_budget = self.options.deep_budget;
        let mut groups = Vec::new();

        for seed_id in &catalog.order {
            if self.cancellation_token.is_cancelled() {
                self.set_state(PipelineState::Cancelled);
                return Err(PipelineError::Cancelled);
            }
            if grouped.contains(seed_id) {
                continue;
            }
            let Some(seed) = catalog.records.get(seed_id) else {
                continue;
            };

            let mut candidates: BTreeSet<(usize, &str)> = BTreeSet::new();
            for id in lsh.candidates(seed_id) {
                if let Some((&key, &at)) = position.get_key_value(id.as_str()) {
                    candidates.insert((at, key));
                }
            }
            for id in self.knn_candidates(seed)? {
                if let Some((&key, &at)) = position.get_key_value(id.as_str()) {
                    candidates.insert((at, key));
                }
            }

            let mut members = vec![seed_id.clone()];
            let mut similarities = Vec::new();
            for (_, candidate_id) in candidates {
                if candidate_id == seed_id.as_str() || grouped.contains(candidate_id) {
                    continue;
                }
                let Some(candidate) = catalog.records.get(candidate_id) else {
                    continue;
                };
                if let Some(similarity) = self.passes_stages(seed, candidate, &mut deep_budget) {
                    members.push(candidate_id.to_string());
                    similarities.push(similarity);
                }
            }

            if members.len() < 2 {
                continue;
            }
            grouped.extend(members.iter().cloned());
            groups.push(self.make_group(&catalog, members, &similarities));
        }

        log::info!(
            "Grouped {} of {} photos into {} groups",
            grouped.len(),
            catalog.order.len(),
            groups.len()
        );
        self.set_state(PipelineState::Done);
        Ok(groups)
    }

    /// Forgets a photo everywhere: index, LSH buckets, catalog and cache.
    pub fn remove_photo(&self, id: &str) -> Result<bool, PipelineError> {
        let removed_points = self.index.remove_photo(id)?;
        self.lock_lsh().remove(id);
        let known = self.write_catalog().remove(id);
        self.cache.remove_photo(id);
        Ok(known || removed_points > 0)
    }

    /// Cached results are reused when both features and quality are present;
    /// cached fingerprints alone still save the hashing step.
    fn dispatch(&self, input: PhotoInput) -> Pending {
        let features_key = input.cache_key(CacheKind::Features);
        let quality_key = features_key.with_kind(CacheKind::Quality);
        let cached = match (self.cache.get(&features_key), self.cache.get(&quality_key)) {
            (Some(CachePayload::Features(feature)), Some(CachePayload::Quality(quality))) => {
                Some((feature, quality))
            }
            _ => None,
        };
        if let Some((mut feature, quality)) = cached {
            let high = feature.high.take().map(VectorPayload::Inline);
            return Pending::Ready(Box::new(Extracted {
                id: input.id.clone(),
                feature,
                high,
                quality,
                last_modified: input.last_modified,
                size: input.size,
                from_cache: true,
                cache_keys: None,
            }));
        }

        let known_low = match self.cache.get(&features_key.with_kind(CacheKind::Fingerprints)) {
            Some(CachePayload::Fingerprints(set)) => Some(set),
            _ => None,
        };
        let id = input.id.clone();
        let job = ExtractionJob {
            input,
            known_low,
            hash_engine: self.hash_engine.clone(),
            scorer: self.scorer.clone(),
            extractor: self.extractor.clone(),
            options: self.options.clone(),
            buffers: self.buffers.clone(),
        };
        Pending::Running(id, self.queue.submit(move |token| job.run(token)))
    }

    /// Single-writer step: caches fresh results, then inserts every level of
    /// every photo in one index batch.
    fn apply(
        &self,
        extracted: Vec<Extracted>,
        failures: &mut Vec<PhotoFailure>,
    ) -> Result<(usize, usize), PipelineError> {
        let mut points = Vec::new();
        let mut records = Vec::with_capacity(extracted.len());
        let mut from_cache = 0;

        for mut done in extracted {
            done.feature.high = match done.high.take().map(|p| self.buffers.materialize(p)) {
                Some(Ok(vector)) => Some(vector),
                Some(Err(e)) => {
                    log::warn!("Dropping high-level vector of {}: {}", done.id, e);
                    None
                }
                None => None,
            };

            if done.from_cache {
                from_cache += 1;
            } else if let Some((fingerprints, features, quality)) = done.cache_keys.take() {
                if let Some(low) = &done.feature.low {
                    self.cache
                        .insert(fingerprints, CachePayload::Fingerprints(low.clone()));
                }
                self.cache
                    .insert(features, CachePayload::Features(done.feature.clone()));
                self.cache
                    .insert(quality, CachePayload::Quality(done.quality.clone()));
            }

            for level in FeatureLevel::ALL {
                if !self.options.enabled_levels.contains(level) {
                    continue;
                }
                if let Some(vector) = done.feature.level_vector(level) {
                    points.push(FeaturePoint::new(done.id.clone(), level, vector));
                }
            }
            records.push(done);
        }

        let outcome = self.index.add_or_update(points)?;
        for rejected in outcome.rejected {
            failures.push(PhotoFailure {
                photo_id: rejected.photo_id,
                kind: FailureKind::Rejected,
                message: rejected.error.to_string(),
            });
        }

        let indexed = records.len();
        let mut catalog = self.write_catalog();
        let mut lsh = self.lock_lsh();
        for done in records {
            if let Some(perceptual) = done.feature.low.as_ref().and_then(|l| l.perceptual.as_ref()) {
                lsh.insert(&done.id, perceptual);
            }
            catalog.upsert(
                done.id,
                PhotoRecord {
                    feature: done.feature,
                    quality: done.quality,
                    last_modified: done.last_modified,
                    size: done.size,
                },
            );
        }
        Ok((indexed, from_cache))
    }

    /// Samples memory before a chunk. High pressure evicts idle cache entries
    /// and runs index GC; critical pressure also pauses until relieved.
    fn relieve_pressure(&self, report: &mut BatchReport) -> Result<(), PipelineError> {
        let level = self.monitor.sample();
        if level == PressureLevel::Normal {
            return Ok(());
        }
        report.pressure_events += 1;
        self.evict_for(level)?;

        if level == PressureLevel::Critical {
            self.set_state(PipelineState::Paused);
            let outcome = self
                .monitor
                .wait_for_relief(&self.cancellation_token, |level| {
                    if let Err(e) = self.evict_for(level) {
                        log::warn!("Eviction failed while paused: {}", e);
                    }
                });
            match outcome {
                ReliefOutcome::Relieved => {}
                ReliefOutcome::TimedOut => report.pause_timeouts += 1,
                ReliefOutcome::Cancelled => {
                    self.set_state(PipelineState::Cancelled);
                    return Err(PipelineError::Cancelled);
                }
            }
            self.set_state(PipelineState::Indexing);
        }
        Ok(())
    }

    fn evict_for(&self, level: PressureLevel) -> Result<(), PipelineError> {
        let cache_evicted = self.cache.evict_idle(IDLE_CACHE_FRACTION);
        let index_evicted = self.index.collect_garbage(level)?;
        self.buffers.compact();
        log::debug!(
            "Memory relief under {:?}: {} cache entries, {} index points",
            level,
            cache_evicted,
            index_evicted
        );
        Ok(())
    }

    fn knn_candidates(&self, seed: &PhotoRecord) -> Result<Vec<String>, PipelineError> {
        if self.options.knn_candidates == 0 {
            return Ok(Vec::new());
        }
        let Some(query) = seed.feature.level_vector(FeatureLevel::Mid) else {
            return Ok(Vec::new());
        };
        match self
            .index
            .k_nearest(&query, self.options.knn_candidates + 1, FeatureLevel::Mid)
        {
            Ok(neighbors) => Ok(neighbors.iter().map(|n| n.photo_id().to_string()).collect()),
            Err(IndexError::NotConfigured) => Err(IndexError::NotConfigured.into()),
            Err(e) => {
                log::debug!("No kNN candidates for {}: {}", seed.feature.id, e);
                Ok(Vec::new())
            }
        }
    }

    /// Runs the AND-ed filter stages. Returns the fused score when all pass.
    fn passes_stages(&self, a: &PhotoRecord, b: &PhotoRecord, deep_budget: &mut usize) -> Option<f64> {
        let options = &self.options;
        let fused = self.fusion.calculate_similarity(&a.feature, &b.feature);

        // Stage 1: multi-hash; photos without fingerprints fall back to the fused score
        let hash_score = match (a.fingerprints(), b.fingerprints()) {
            (Some(x), Some(y)) if options.enabled_levels.low => {
                weighted_hash_similarity(x, y, &options.hash_weights)
            }
            _ => Some(fused.score),
        };
        if hash_score? < options.similarity_threshold {
            return None;
        }

        // Stage 2: colour histogram, skipped when either side lacks one
        if options.enabled_levels.mid {
            let histograms = a
                .feature
                .mid
                .as_ref()
                .and_then(|m| m.color_histogram.as_deref())
                .zip(b.feature.mid.as_ref().and_then(|m| m.color_histogram.as_deref()));
            if let Some((x, y)) = histograms {
                if cosine_similarity(x, y) < options.histogram_threshold {
                    return None;
                }
            }
        }

        // Stage 3: deep features, while the comparison budget lasts
        if options.enabled_levels.high && *deep_budget > 0 {
            if let (Some(x), Some(y)) = (a.feature.high.as_deref(), b.feature.high.as_deref()) {
                *deep_budget -= 1;
                if cosine_similarity(x, y) < options.deep_threshold {
                    return None;
                }
            }
        }

        Some(fused.score)
    }

    fn make_group(&self, catalog: &Catalog, members: Vec<String>, similarities: &[f64]) -> SimilarityGroup {
        let mut representative: Option<(&str, f64)> = None;
        for id in &members {
            let overall = catalog
                .records
                .get(id)
                .map_or(f64::MIN, |r| r.quality.overall);
            if representative.is_none_or(|(_, best)| overall > best) {
                representative = Some((id.as_str(), overall));
            }
        }
        let representative = representative.map(|(id, _)| id.to_string()).unwrap_or_default();

        let average_similarity = if similarities.is_empty() {
            0.0
        } else {
            similarities.iter().sum::<f64>() / similarities.len() as f64
        };

        SimilarityGroup {
            id: group_id(&members),
            members,
            representative,
            average_similarity,
        }
    }

    fn send_progress(&self, processed: usize, total: usize, current: &str) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(IndexProgress {
                processed,
                total,
                current_photo: current.to_string(),
            });
        }
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancellation_token.is_cancelled() {
            self.set_state(PipelineState::Cancelled);
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    fn set_state(&self, state: PipelineState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lsh(&self) -> MutexGuard<'_, LshIndex> {
        self.lsh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_catalog(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_catalog(&self) -> std::sync::RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stable id derived from the member list.
fn group_id(members: &[String]) -> String {
    let digest = blake3::hash(members.join("\n").as_bytes()).to_hex();
    format!("grp_{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn options() -> IndexOptions {
        IndexOptions {
            max_concurrent_tasks: 2,
            batch_size: 4,
            ..IndexOptions::default()
        }
    }

    fn blocks(seed: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            let on = ((x / 16) * 7 + (y / 16) * 3 + seed) % 5 < 2;
            let v = if on { 210 } else { 40 };
            Rgb([v, v, (v / 2) as u8])
        }))
    }

    #[test]
    fn test_unconfigured_index_aborts() {
        let pipeline = GroupingPipeline::builder(options())
            .index(Arc::new(IncrementalIndex::new(IndexTuning::default())))
            .build()
            .unwrap();
        let result = pipeline.index_photos(vec![PhotoInput::decoded("a", blocks(0))]);
        assert!(matches!(
            result,
            Err(PipelineError::Index(IndexError::NotConfigured))
        ));
        assert!(matches!(
            pipeline.group(),
            Err(PipelineError::Index(IndexError::NotConfigured))
        ));
    }

    #[test]
    fn test_corrupt_input_is_reported_not_fatal() {
        let pipeline = GroupingPipeline::builder(options()).build().unwrap();
        let report = pipeline
            .index_photos(vec![
                PhotoInput::encoded("broken", vec![0, 1, 2, 3]),
                PhotoInput::decoded("ok", blocks(1)),
            ])
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.failure_counts().get(&FailureKind::Decode), Some(&1));
        assert!(pipeline.photo("ok").is_some());
        assert!(pipeline.photo("broken").is_none());
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_duplicates_group_with_best_representative() {
        let pipeline = GroupingPipeline::builder(options()).build().unwrap();
        let sharp = blocks(2);
        let soft = sharp.blur(1.5);
        pipeline
            .index_photos(vec![
                PhotoInput::decoded("soft", soft),
                PhotoInput::decoded("sharp", sharp.clone()),
                PhotoInput::decoded("copy", sharp),
            ])
            .unwrap();

        let groups = pipeline.group().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.members.len(), 3);
        assert_eq!(group.members[0], "soft");
        // "sharp" and "copy" score the same; the first one wins
        assert_eq!(group.representative, "sharp");
        assert!(group.id.starts_with("grp_"));
    }

    #[test]
    fn test_cache_short_circuits_second_run() {
        let pipeline = GroupingPipeline::builder(options()).build().unwrap();
        let inputs = vec![PhotoInput::decoded("a", blocks(3)), PhotoInput::decoded("b", blocks(4))];
        let first = pipeline.index_photos(inputs.clone()).unwrap();
        assert_eq!(first.from_cache, 0);
        let second = pipeline.index_photos(inputs).unwrap();
        assert_eq!(second.from_cache, 2);
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.index().len(), first.indexed * 2);
    }

    #[test]
    fn test_remove_photo_forgets_everything() {
        let pipeline = GroupingPipeline::builder(options()).build().unwrap();
        let image = blocks(5);
        pipeline
            .index_photos(vec![
                PhotoInput::decoded("a", image.clone()),
                PhotoInput::decoded("b", image),
            ])
            .unwrap();
        assert!(pipeline.remove_photo("a").unwrap());
        assert!(!pipeline.remove_photo("a").unwrap());
        assert!(pipeline.photo("a").is_none());
        for level in FeatureLevel::ALL {
            assert!(!pipeline.index().contains("a", level));
        }
        assert!(pipeline.group().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_stops_and_reset_recovers() {
        let pipeline = GroupingPipeline::builder(options()).build().unwrap();
        pipeline.cancel();
        assert!(matches!(
            pipeline.index_photos(vec![PhotoInput::decoded("a", blocks(6))]),
            Err(PipelineError::Cancelled)
        ));
        assert_eq!(pipeline.state(), PipelineState::Cancelled);
        assert!(pipeline.is_empty());

        pipeline.reset();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline
            .index_photos(vec![PhotoInput::decoded("a", blocks(6))])
            .unwrap();
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn test_paths_are_read_by_the_worker() {
        let dir = tempfile::TempDir::new().unwrap();
        let kept = dir.path().join("kept.png");
        let gone = dir.path().join("gone.png");
        blocks(7).save(&kept).unwrap();
        blocks(8).save(&gone).unwrap();

        let inputs = vec![
            PhotoInput::from_path(&kept).unwrap(),
            PhotoInput::from_path(&gone).unwrap(),
        ];
        assert!(matches!(&inputs[0].source, PhotoSource::Path(p) if p == &kept));
        assert_eq!(inputs[0].size, std::fs::metadata(&kept).unwrap().len());
        // Listed but never read until its batch runs
        std::fs::remove_file(&gone).unwrap();

        let pipeline = GroupingPipeline::builder(options()).build().unwrap();
        let report = pipeline.index_photos(inputs).unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.failure_counts().get(&FailureKind::Io), Some(&1));

        let record = pipeline.photo(&kept.to_string_lossy()).unwrap();
        let bytes = std::fs::read(&kept).unwrap();
        assert_eq!(record.feature.metadata.content_hash, content_hash(&bytes));
    }

    #[test]
    fn test_group_id_is_stable() {
        let members = vec!["a".to_string(), "b".to_string()];
        assert_eq!(group_id(&members), group_id(&members.clone()));
        assert_ne!(group_id(&members), group_id(&["b".to_string(), "a".to_string()]));
    }
}
