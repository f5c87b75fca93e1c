use crate::core::features::FeatureLevel;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointKey {
    pub photo_id: String,
    pub level: FeatureLevel,
}

/// One indexed vector: a single feature level of a single photo.
///
/// The vector is immutable once the point exists. Query bookkeeping
/// (access count, last access, pins) goes through atomics so readers never
/// need the index writer lock.
#[derive(Debug)]
pub struct FeaturePoint {
    id: String,
    level: FeatureLevel,
    vector: Vec<f32>,
    last_updated: AtomicI64,
    access_count: AtomicU64,
    pins: AtomicUsize,
}

impl FeaturePoint {
    pub fn new(id: impl Into<String>, level: FeatureLevel, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            level,
            vector,
            last_updated: AtomicI64::new(Utc::now().timestamp_millis()),
            access_count: AtomicU64::new(0),
            pins: AtomicUsize::new(0),
        }
    }

    /// Replacement point for an update: new vector, carried-over access history.
    pub(crate) fn successor(&self, vector: Vec<f32>) -> Self {
        let point = Self::new(self.id.clone(), self.level, vector);
        point
            .access_count
            .store(self.access_count(), Ordering::Relaxed);
        point
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn level(&self) -> FeatureLevel {
        self.level
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn key(&self) -> PointKey {
        PointKey {
            photo_id: self.id.clone(),
            level: self.level,
        }
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_updated_millis(&self) -> i64 {
        self.last_updated.load(Ordering::Relaxed)
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_updated_millis())
            .single()
            .unwrap_or_default()
    }

    /// Records a query visit.
    pub fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.refresh();
    }

    pub(crate) fn refresh(&self) {
        self.last_updated
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub(crate) fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.id.len() + self.vector.len() * std::mem::size_of::<f32>()
    }
}

/// Keeps a point out of garbage collection while held.
#[derive(Debug)]
pub struct PinGuard {
    point: Arc<FeaturePoint>,
}

impl PinGuard {
    pub fn new(point: Arc<FeaturePoint>) -> Self {
        point.pins.fetch_add(1, Ordering::AcqRel);
        Self { point }
    }

    pub fn point(&self) -> &Arc<FeaturePoint> {
        &self.point
    }
}

impl Clone for PinGuard {
    fn clone(&self) -> Self {
        Self::new(self.point.clone())
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.point.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_counts_accesses() {
        let point = FeaturePoint::new("a", FeatureLevel::Low, vec![1.0]);
        assert_eq!(point.access_count(), 0);
        point.touch();
        point.touch();
        assert_eq!(point.access_count(), 2);
    }

    #[test]
    fn test_pins_are_released_on_drop() {
        let point = Arc::new(FeaturePoint::new("a", FeatureLevel::Mid, vec![1.0]));
        let guard = PinGuard::new(point.clone());
        let second = guard.clone();
        assert!(point.is_pinned());
        drop(guard);
        assert!(point.is_pinned());
        drop(second);
        assert!(!point.is_pinned());
    }

    #[test]
    fn test_successor_keeps_history() {
        let point = FeaturePoint::new("a", FeatureLevel::High, vec![1.0, 2.0]);
        point.touch();
        let next = point.successor(vec![3.0, 4.0]);
        assert_eq!(next.access_count(), 1);
        assert_eq!(next.vector(), &[3.0, 4.0]);
        assert_eq!(next.key(), point.key());
    }
}
