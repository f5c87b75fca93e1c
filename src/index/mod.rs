//! Incremental nearest-neighbour index over photo feature vectors.
//!
//! One KD-tree per feature level. Writers are serialised behind a mutex and
//! work on a private copy of the affected trees, publishing immutable
//! snapshots when a batch is done. Queries only clone the current snapshot
//! `Arc`, so they never wait for a batch to finish and may see slightly
//! stale results.
//!
//! Tree quality is maintained three ways:
//! - every `incremental_threshold` inserts bump a rebuild counter, and every
//!   `rebuild_threshold` bumps trigger a full median-split rebuild;
//! - after each batch, any level whose subtree heights differ by more than
//!   `max_height_skew` is rebuilt from its points;
//! - a level whose tree disagrees with the lookup map is rebuilt.

pub mod arena;
pub mod kdtree;
pub mod point;

use crate::config::IndexOptions;
use crate::core::compress::VectorCompressor;
use crate::core::features::FeatureLevel;
use crate::services::memory::PressureLevel;
use kdtree::KdTree;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use thiserror::Error;

pub use arena::{BufferHandle, BufferPool, PoolError, PooledVector, SharedBufferPool, VectorPayload};
pub use point::{FeaturePoint, PinGuard, PointKey};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("Index has no similarity backend configured")]
    NotConfigured,

    #[error("Compression ratio is fixed at {current}; cannot switch to {requested}")]
    CompressionLocked { current: f64, requested: f64 },

    #[error("Vector for {photo_id} ({level}) has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        photo_id: String,
        level: FeatureLevel,
        expected: usize,
        actual: usize,
    },

    #[error("Empty vector for {photo_id} ({level})")]
    EmptyVector { photo_id: String, level: FeatureLevel },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexState {
    Empty,
    Building,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexTuning {
    pub incremental_threshold: usize,
    pub rebuild_threshold: usize,
    pub max_height_skew: usize,
    pub distance_decay: f64,
}

impl Default for IndexTuning {
    fn default() -> Self {
        Self {
            incremental_threshold: 100,
            rebuild_threshold: 5,
            max_height_skew: 2,
            distance_decay: 5.0,
        }
    }
}

impl From<&IndexOptions> for IndexTuning {
    fn from(options: &IndexOptions) -> Self {
        Self {
            incremental_threshold: options.incremental_threshold,
            rebuild_threshold: options.rebuild_threshold,
            max_height_skew: options.max_height_skew,
            distance_decay: options.distance_decay,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedPoint {
    pub photo_id: String,
    pub level: FeatureLevel,
    pub error: IndexError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddOutcome {
    pub added: usize,
    pub updated: usize,
    pub rejected: Vec<RejectedPoint>,
    /// Whether any tree was rebuilt while applying the batch.
    pub rebuilt: bool,
}

/// A kNN hit. Holds a pin on the point, so it cannot be evicted while the
/// caller still looks at it.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pin: PinGuard,
    pub distance: f32,
    pub similarity: f64,
}

impl Neighbor {
    pub fn point(&self) -> &Arc<FeaturePoint> {
        self.pin.point()
    }

    pub fn photo_id(&self) -> &str {
        self.pin.point().id()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub state: IndexState,
    pub size: usize,
    pub low_points: usize,
    pub mid_points: usize,
    pub high_points: usize,
    pub full_rebuilds: u64,
    pub rebalances: u64,
    pub evictions: u64,
    pub incremental_counter: usize,
    pub rebuild_counter: usize,
}

/// Published, immutable view of one level.
#[derive(Debug)]
struct LevelSnapshot {
    tree: KdTree,
    raw_dimension: usize,
}

#[derive(Debug, Default)]
struct LevelPoints {
    points: HashMap<String, Arc<FeaturePoint>>,
    raw_dimension: Option<usize>,
}

#[derive(Debug, Default)]
struct Writer {
    levels: [LevelPoints; 3],
    incremental_counter: usize,
    rebuild_counter: usize,
    full_rebuilds: u64,
    rebalances: u64,
    evictions: u64,
}

impl Writer {
    fn level(&self, level: FeatureLevel) -> &LevelPoints {
        &self.levels[level.index()]
    }

    fn level_mut(&mut self, level: FeatureLevel) -> &mut LevelPoints {
        &mut self.levels[level.index()]
    }

    fn len(&self) -> usize {
        self.levels.iter().map(|l| l.points.len()).sum()
    }

    /// Counts one insert; returns true when a full rebuild is due.
    fn register_insert(&mut self, tuning: &IndexTuning) -> bool {
        self.incremental_counter += 1;
        if self.incremental_counter < tuning.incremental_threshold.max(1) {
            return false;
        }
        self.incremental_counter = 0;
        self.rebuild_counter += 1;
        if self.rebuild_counter < tuning.rebuild_threshold.max(1) {
            return false;
        }
        self.rebuild_counter = 0;
        true
    }

    fn build_level(&self, level: FeatureLevel) -> KdTree {
        let points: Vec<Arc<FeaturePoint>> = self.level(level).points.values().cloned().collect();
        let dimension = points.first().map(|p| p.vector().len()).unwrap_or(0);
        KdTree::build(points, dimension)
    }
}

pub struct IncrementalIndex {
    tuning: IndexTuning,
    compressor: OnceLock<VectorCompressor>,
    writer: Mutex<Writer>,
    snapshots: RwLock<HashMap<FeatureLevel, Arc<LevelSnapshot>>>,
    state: Mutex<IndexState>,
    max_observed_distance: AtomicU32,
    approx_bytes: AtomicUsize,
}

impl IncrementalIndex {
    /// An index with no compression backend; every operation fails with
    /// `NotConfigured` until `configure` is called.
    pub fn new(tuning: IndexTuning) -> Self {
        Self {
            tuning,
            compressor: OnceLock::new(),
            writer: Mutex::new(Writer::default()),
            snapshots: RwLock::new(HashMap::new()),
            state: Mutex::new(IndexState::Empty),
            max_observed_distance: AtomicU32::new(0f32.to_bits()),
            approx_bytes: AtomicUsize::new(0),
        }
    }

    pub fn with_compressor(tuning: IndexTuning, compressor: VectorCompressor) -> Self {
        let index = Self::new(tuning);
        let _ = index.compressor.set(compressor);
        index
    }

    /// Attaches the compression backend. The ratio cannot change afterwards,
    /// since vectors compressed at different ratios are not comparable.
    pub fn configure(&self, compressor: VectorCompressor) -> Result<(), IndexError> {
        let current = self.compressor.get_or_init(|| compressor);
        if current.ratio() == compressor.ratio() {
            Ok(())
        } else {
            Err(IndexError::CompressionLocked {
                current: current.ratio(),
                requested: compressor.ratio(),
            })
        }
    }

    pub fn compressor(&self) -> Result<&VectorCompressor, IndexError> {
        self.compressor.get().ok_or(IndexError::NotConfigured)
    }

    pub fn tuning(&self) -> &IndexTuning {
        &self.tuning
    }

    pub fn state(&self) -> IndexState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_or_update(&self, points: Vec<FeaturePoint>) -> Result<AddOutcome, IndexError> {
        let compressor = *self.compressor()?;
        let mut writer = self.lock_writer();
        self.set_state(IndexState::Building);

        let mut trees: HashMap<FeatureLevel, KdTree> = self
            .read_snapshots()
            .iter()
            .map(|(level, snapshot)| (*level, snapshot.tree.clone()))
            .collect();
        let mut dirty: HashSet<FeatureLevel> = HashSet::new();
        let mut outcome = AddOutcome::default();

        for point in points {
            let level = point.level();
            let raw_len = point.vector().len();

            if raw_len == 0 {
                outcome.rejected.push(RejectedPoint {
                    photo_id: point.id().to_string(),
                    level,
                    error: IndexError::EmptyVector {
                        photo_id: point.id().to_string(),
                        level,
                    },
                });
                continue;
            }

            let slot = writer.level_mut(level);
            match slot.raw_dimension {
                Some(expected) if expected != raw_len => {
                    outcome.rejected.push(RejectedPoint {
                        photo_id: point.id().to_string(),
                        level,
                        error: IndexError::DimensionMismatch {
                            photo_id: point.id().to_string(),
                            level,
                            expected,
                            actual: raw_len,
                        },
                    });
                    continue;
                }
                Some(_) => {}
                None => slot.raw_dimension = Some(raw_len),
            }

            let compressed = compressor.compress(point.vector());

            if let Some(existing) = slot.points.get(point.id()) {
                if existing.vector() == compressed.as_slice() {
                    existing.refresh();
                } else {
                    let replacement = Arc::new(existing.successor(compressed));
                    slot.points.insert(point.id().to_string(), replacement);
                    // The old position may sit on the wrong side of a split plane
                    dirty.insert(level);
                }
                outcome.updated += 1;
                continue;
            }

            let stored = Arc::new(FeaturePoint::new(point.id(), level, compressed));
            slot.points.insert(point.id().to_string(), stored.clone());
            let tree = trees
                .entry(level)
                .or_insert_with(|| KdTree::new(stored.vector().len()));
            if tree.dimension() == stored.vector().len() {
                tree.insert(stored);
            } else {
                dirty.insert(level);
            }
            outcome.added += 1;

            if writer.register_insert(&self.tuning) {
                for level in FeatureLevel::ALL {
                    trees.insert(level, writer.build_level(level));
                }
                dirty.clear();
                writer.full_rebuilds += 1;
                outcome.rebuilt = true;
                log::debug!(
                    "Full index rebuild #{} at {} points",
                    writer.full_rebuilds,
                    writer.len()
                );
            }
        }

        for level in FeatureLevel::ALL {
            let expected = writer.level(level).points.len();
            let needs_rebuild = match trees.get(&level) {
                Some(tree) => {
                    dirty.contains(&level)
                        || tree.len() != expected
                        || !tree.is_balanced(self.tuning.max_height_skew)
                }
                None => expected > 0,
            };
            if needs_rebuild {
                trees.insert(level, writer.build_level(level));
                writer.rebalances += 1;
                outcome.rebuilt = true;
                log::debug!("Rebuilt {} tree ({} points)", level, expected);
            }
        }

        self.publish(&writer, trees);
        Ok(outcome)
    }

    /// The `k` nearest points of `level` to `query` (raw, uncompressed).
    pub fn k_nearest(
        &self,
        query: &[f32],
        k: usize,
        level: FeatureLevel,
    ) -> Result<Vec<Neighbor>, IndexError> {
        let compressor = self.compressor()?;
        let Some(snapshot) = self.read_snapshots().get(&level).cloned() else {
            return Ok(Vec::new());
        };
        if query.len() != snapshot.raw_dimension {
            return Err(IndexError::DimensionMismatch {
                photo_id: "<query>".to_string(),
                level,
                expected: snapshot.raw_dimension,
                actual: query.len(),
            });
        }

        let query = compressor.compress(query);
        let mut visiting = Vec::new();
        let hits = snapshot.tree.nearest(&query, k, |point| {
            visiting.push(PinGuard::new(point.clone()));
            point.touch();
        });

        if let Some((_, farthest)) = hits.last() {
            self.max_observed_distance
                .fetch_max(farthest.to_bits(), Ordering::Relaxed);
        }

        let neighbors = hits
            .into_iter()
            .map(|(point, distance)| Neighbor {
                pin: PinGuard::new(point),
                distance,
                similarity: self.similarity_for(distance),
            })
            .collect();
        drop(visiting);
        Ok(neighbors)
    }

    /// Maps a distance to `[0, 1]` with `exp(-decay * (d / max_observed)^2)`.
    pub fn similarity_for(&self, distance: f32) -> f64 {
        let max = f32::from_bits(self.max_observed_distance.load(Ordering::Relaxed)) as f64;
        if max <= f64::EPSILON {
            return if distance <= 0.0 { 1.0 } else { 0.0 };
        }
        let scaled = distance as f64 / max;
        (-self.tuning.distance_decay * scaled * scaled)
            .exp()
            .clamp(0.0, 1.0)
    }

    /// Removes every level of `photo_id`. Returns how many points went.
    pub fn remove_photo(&self, photo_id: &str) -> Result<usize, IndexError> {
        self.compressor()?;
        let mut writer = self.lock_writer();
        let mut removed = 0;
        let mut trees = self.current_trees();
        for level in FeatureLevel::ALL {
            if writer.level_mut(level).points.remove(photo_id).is_some() {
                removed += 1;
                trees.insert(level, writer.build_level(level));
            }
        }
        if removed > 0 {
            self.publish(&writer, trees);
        }
        Ok(removed)
    }

    /// Pins the stored point for (`photo_id`, `level`) if present.
    pub fn pin(&self, photo_id: &str, level: FeatureLevel) -> Option<PinGuard> {
        let writer = self.lock_writer();
        writer
            .level(level)
            .points
            .get(photo_id)
            .map(|p| PinGuard::new(p.clone()))
    }

    pub fn contains(&self, photo_id: &str, level: FeatureLevel) -> bool {
        self.read_snapshots()
            .get(&level)
            .is_some_and(|s| s.tree.points().iter().any(|p| p.id() == photo_id))
    }

    /// Evicts the least used, stalest unpinned points. Returns the count.
    pub fn collect_garbage(&self, pressure: PressureLevel) -> Result<usize, IndexError> {
        self.compressor()?;
        let mut writer = self.lock_writer();
        let size = writer.len();
        let quota = (size as f64 * cleanup_ratio(size, pressure)).floor() as usize;
        if quota == 0 {
            return Ok(0);
        }

        let mut candidates: Vec<Arc<FeaturePoint>> = writer
            .levels
            .iter()
            .flat_map(|l| l.points.values())
            .filter(|p| !p.is_pinned())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.access_count(), a.last_updated_millis(), a.key())
                .cmp(&(b.access_count(), b.last_updated_millis(), b.key()))
        });
        candidates.truncate(quota);

        let mut touched = HashSet::new();
        for victim in &candidates {
            let PointKey { photo_id, level } = victim.key();
            let slot = writer.level_mut(level);
            if slot.points.remove(&photo_id).is_some() {
                touched.insert(level);
            }
        }

        let mut trees = self.current_trees();
        for level in touched {
            trees.insert(level, writer.build_level(level));
        }
        writer.evictions += candidates.len() as u64;
        self.publish(&writer, trees);

        log::debug!(
            "Index GC evicted {} of {} points under {:?} pressure",
            candidates.len(),
            size,
            pressure
        );
        Ok(candidates.len())
    }

    pub fn clear(&self) {
        let mut writer = self.lock_writer();
        *writer = Writer::default();
        self.write_snapshots().clear();
        self.approx_bytes.store(0, Ordering::Relaxed);
        self.max_observed_distance
            .store(0f32.to_bits(), Ordering::Relaxed);
        self.set_state(IndexState::Empty);
    }

    pub fn len(&self) -> usize {
        self.read_snapshots().values().map(|s| s.tree.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn level_len(&self, level: FeatureLevel) -> usize {
        self.read_snapshots()
            .get(&level)
            .map_or(0, |s| s.tree.len())
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> IndexStats {
        let writer = self.lock_writer();
        IndexStats {
            state: self.state(),
            size: writer.len(),
            low_points: writer.level(FeatureLevel::Low).points.len(),
            mid_points: writer.level(FeatureLevel::Mid).points.len(),
            high_points: writer.level(FeatureLevel::High).points.len(),
            full_rebuilds: writer.full_rebuilds,
            rebalances: writer.rebalances,
            evictions: writer.evictions,
            incremental_counter: writer.incremental_counter,
            rebuild_counter: writer.rebuild_counter,
        }
    }

    fn current_trees(&self) -> HashMap<FeatureLevel, KdTree> {
        self.read_snapshots()
            .iter()
            .map(|(level, snapshot)| (*level, snapshot.tree.clone()))
            .collect()
    }

    fn publish(&self, writer: &Writer, trees: HashMap<FeatureLevel, KdTree>) {
        let mut snapshots = HashMap::new();
        let mut bytes = 0;
        for (level, tree) in trees {
            let slot = writer.level(level);
            let Some(raw_dimension) = slot.raw_dimension else {
                continue;
            };
            if tree.is_empty() {
                continue;
            }
            bytes += slot.points.values().map(|p| p.approx_bytes()).sum::<usize>();
            snapshots.insert(level, Arc::new(LevelSnapshot { tree, raw_dimension }));
        }
        *self.write_snapshots() = snapshots;
        self.approx_bytes.store(bytes, Ordering::Relaxed);
        self.set_state(if writer.len() == 0 {
            IndexState::Empty
        } else {
            IndexState::Ready
        });
    }

    fn set_state(&self, state: IndexState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn lock_writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_snapshots(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<FeatureLevel, Arc<LevelSnapshot>>> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_snapshots(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<FeatureLevel, Arc<LevelSnapshot>>> {
        self.snapshots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fraction of the index evicted by one GC pass.
pub fn cleanup_ratio(size: usize, pressure: PressureLevel) -> f64 {
    let base: f64 = if size > 10_000 {
        0.20
    } else if size < 1_000 {
        0.05
    } else {
        0.10
    };
    let scale = match pressure {
        PressureLevel::Normal => 1.0,
        PressureLevel::High => 1.5,
        PressureLevel::Critical => 2.0,
    };
    (base * scale).min(0.5)
}
