mod common;

use std::sync::Arc;

use cullrs::core::{FeatureLevel, VectorCompressor};
use cullrs::index::{FeaturePoint, IncrementalIndex, IndexError, IndexState, IndexTuning};
use cullrs::services::PressureLevel;
use rstest::*;

fn index_with(ratio: f64, tuning: IndexTuning) -> IncrementalIndex {
    IncrementalIndex::with_compressor(tuning, VectorCompressor::new(ratio))
}

fn points(vectors: &[Vec<f32>], level: FeatureLevel) -> Vec<FeaturePoint> {
    points_from(vectors, 0, "photo", level)
}

fn points_from(vectors: &[Vec<f32>], offset: usize, prefix: &str, level: FeatureLevel) -> Vec<FeaturePoint> {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| FeaturePoint::new(format!("{prefix}-{}", offset + i), level, v.clone()))
        .collect()
}

#[fixture]
fn tuning() -> IndexTuning {
    IndexTuning::default()
}

#[rstest]
#[case::uncompressed(1.0, 1)]
#[case::uncompressed_many(1.0, 150)]
#[case::half(0.5, 150)]
fn test_every_point_is_its_own_nearest(tuning: IndexTuning, #[case] ratio: f64, #[case] count: usize) {
    let index = index_with(ratio, tuning);
    let vectors = common::random_vectors(count, 64, 7);
    let outcome = index.add_or_update(points(&vectors, FeatureLevel::Mid)).unwrap();
    assert_eq!(outcome.added, count);
    assert_eq!(index.len(), count);
    assert_eq!(index.state(), IndexState::Ready);

    for (i, vector) in vectors.iter().enumerate() {
        let hits = index.k_nearest(vector, 1, FeatureLevel::Mid).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].photo_id(), format!("photo-{i}"));
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[0].similarity, 1.0);
    }
}

#[rstest]
#[case::one_by_one(1)]
#[case::small_batches(5)]
#[case::single_batch(25)]
fn test_threshold_driven_rebuild(#[case] batch: usize) {
    let index = index_with(
        1.0,
        IndexTuning {
            incremental_threshold: 10,
            rebuild_threshold: 2,
            ..IndexTuning::default()
        },
    );
    let vectors = common::random_vectors(25, 16, 11);
    for (n, chunk) in vectors.chunks(batch).enumerate() {
        index
            .add_or_update(points_from(chunk, n * batch, "photo", FeatureLevel::Mid))
            .unwrap();
    }

    let stats = index.stats();
    assert_eq!(stats.full_rebuilds, 1);
    assert_eq!(stats.size, 25);
    assert_eq!(stats.mid_points, 25);
    assert_eq!(stats.incremental_counter, 5);
    assert_eq!(stats.rebuild_counter, 0);
    assert_eq!(index.level_len(FeatureLevel::Mid), 25);
}

#[rstest]
fn test_pinned_points_survive_repeated_gc(tuning: IndexTuning) {
    let index = index_with(1.0, tuning);
    let vectors = common::random_vectors(60, 16, 3);
    index.add_or_update(points(&vectors, FeatureLevel::Mid)).unwrap();

    let pins: Vec<_> = (0..10)
        .map(|i| index.pin(&format!("photo-{i}"), FeatureLevel::Mid).unwrap())
        .collect();
    // A live query result pins its hit as well
    let in_flight = index.k_nearest(&vectors[59], 1, FeatureLevel::Mid).unwrap();
    assert_eq!(in_flight[0].photo_id(), "photo-59");

    let mut evicted = 0;
    for _ in 0..50 {
        evicted += index.collect_garbage(PressureLevel::Critical).unwrap();
    }

    assert!(evicted > 0);
    for i in 0..10 {
        assert!(index.contains(&format!("photo-{i}"), FeatureLevel::Mid));
    }
    assert!(index.contains("photo-59", FeatureLevel::Mid));
    assert_eq!(index.stats().evictions, evicted as u64);
    assert_eq!(index.len(), 60 - evicted);

    drop(pins);
    drop(in_flight);
    // Nothing is pinned anymore, so the next pass finds candidates again
    let size = index.len();
    let next = index.collect_garbage(PressureLevel::Critical).unwrap();
    assert_eq!(next, (size as f64 * 0.1).floor() as usize);
}

#[rstest]
fn test_levels_are_independent(tuning: IndexTuning) {
    let index = index_with(1.0, tuning);
    let low = common::random_vectors(4, 64, 1);
    let high = common::random_vectors(4, 32, 2);
    let mut batch = points(&low, FeatureLevel::Low);
    batch.extend(points(&high, FeatureLevel::High));
    index.add_or_update(batch).unwrap();

    assert_eq!(index.level_len(FeatureLevel::Low), 4);
    assert_eq!(index.level_len(FeatureLevel::High), 4);
    assert_eq!(index.level_len(FeatureLevel::Mid), 0);
    assert!(index.k_nearest(&low[0], 3, FeatureLevel::Mid).unwrap().is_empty());

    assert!(matches!(
        index.k_nearest(&low[0], 1, FeatureLevel::High),
        Err(IndexError::DimensionMismatch { expected: 32, actual: 64, .. })
    ));

    assert_eq!(index.remove_photo("photo-2").unwrap(), 2);
    assert!(!index.contains("photo-2", FeatureLevel::Low));
    assert!(!index.contains("photo-2", FeatureLevel::High));
    assert_eq!(index.len(), 6);
}

#[rstest]
fn test_gc_evicts_each_level_on_its_own(tuning: IndexTuning) {
    let index = index_with(1.0, tuning);
    let mut batch = points(&common::random_vectors(10, 16, 21), FeatureLevel::Low);
    batch.extend(points(&common::random_vectors(10, 16, 22), FeatureLevel::Mid));
    index.add_or_update(batch).unwrap();

    let pins: Vec<_> = (0..10)
        .map(|i| index.pin(&format!("photo-{i}"), FeatureLevel::Low).unwrap())
        .collect();
    assert_eq!(index.collect_garbage(PressureLevel::Critical).unwrap(), 2);

    assert_eq!(index.level_len(FeatureLevel::Low), 10);
    assert_eq!(index.level_len(FeatureLevel::Mid), 8);
    for i in 0..10 {
        let id = format!("photo-{i}");
        // Losing the mid point leaves the low point of the same photo alone
        assert!(index.contains(&id, FeatureLevel::Low));
    }
    let mid_missing = (0..10)
        .filter(|i| !index.contains(&format!("photo-{i}"), FeatureLevel::Mid))
        .count();
    assert_eq!(mid_missing, 2);
    drop(pins);
}

#[test]
fn test_concurrent_readers_see_published_snapshots() {
    let index = Arc::new(index_with(1.0, IndexTuning::default()));
    let vectors = common::random_vectors(200, 16, 5);
    index
        .add_or_update(points(&vectors[..100], FeatureLevel::Mid))
        .unwrap();

    std::thread::scope(|scope| {
        for reader in 0..4 {
            let index = index.clone();
            let vectors = &vectors;
            scope.spawn(move || {
                for i in 0..100 {
                    let query = &vectors[(i + reader * 7) % 100];
                    let hits = index.k_nearest(query, 3, FeatureLevel::Mid).unwrap();
                    assert!(!hits.is_empty());
                    assert_eq!(hits[0].distance, 0.0);
                }
            });
        }
        let writer = index.clone();
        let tail = &vectors[100..];
        scope.spawn(move || {
            for (n, chunk) in tail.chunks(10).enumerate() {
                writer
                    .add_or_update(points_from(chunk, n * 10, "late", FeatureLevel::Mid))
                    .unwrap();
            }
        });
    });

    assert_eq!(index.len(), 200);
}
