//! Fused similarity across low (hash), mid (histogram/texture) and high
//! (deep feature) levels.
//!
//! Each level yields a similarity in `[0, 1]`. Levels missing from either
//! photo, or disabled by configuration, give their weight to the remaining
//! levels (in equal shares by default), so the effective weights always sum
//! to one.

use crate::core::features::{EnabledLevels, FeatureLevel, MidLevelFeatures, MultiLevelFeature};
use crate::core::hash::{FingerprintSet, HashAlgorithm};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelWeights {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
}

impl LevelWeights {
    pub fn get(&self, level: FeatureLevel) -> f64 {
        match level {
            FeatureLevel::Low => self.low,
            FeatureLevel::Mid => self.mid,
            FeatureLevel::High => self.high,
        }
    }

    fn set(&mut self, level: FeatureLevel, value: f64) {
        match level {
            FeatureLevel::Low => self.low = value,
            FeatureLevel::Mid => self.mid = value,
            FeatureLevel::High => self.high = value,
        }
    }

    pub fn sum(&self) -> f64 {
        self.low + self.mid + self.high
    }
}

impl Default for LevelWeights {
    fn default() -> Self {
        Self {
            low: 0.30,
            mid: 0.30,
            high: 0.40,
        }
    }
}

/// Sub-vector weights inside the mid level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidWeights {
    pub histogram: f64,
    pub texture: f64,
}

impl Default for MidWeights {
    fn default() -> Self {
        Self {
            histogram: 0.6,
            texture: 0.4,
        }
    }
}

/// Per-algorithm weights for the multi-hash similarity used by grouping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashWeights {
    pub average: f64,
    pub difference: f64,
    pub perceptual: f64,
}

impl HashWeights {
    pub fn get(&self, algorithm: HashAlgorithm) -> f64 {
        match algorithm {
            HashAlgorithm::Average => self.average,
            HashAlgorithm::Difference => self.difference,
            HashAlgorithm::Perceptual => self.perceptual,
        }
    }
}

impl Default for HashWeights {
    fn default() -> Self {
        Self {
            average: 0.3,
            difference: 0.3,
            perceptual: 0.4,
        }
    }
}

/// How the weight of missing levels is handed to the available ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Redistribution {
    /// Equal share per available level.
    #[default]
    Even,
    /// In proportion to the available levels' base weights.
    Proportional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionMethod {
    Low,
    Mid,
    High,
    Fusion,
    Unavailable,
}

impl FusionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionMethod::Low => "low",
            FusionMethod::Mid => "mid",
            FusionMethod::High => "high",
            FusionMethod::Fusion => "fusion",
            FusionMethod::Unavailable => "unavailable",
        }
    }
}

impl From<FeatureLevel> for FusionMethod {
    fn from(level: FeatureLevel) -> Self {
        match level {
            FeatureLevel::Low => FusionMethod::Low,
            FeatureLevel::Mid => FusionMethod::Mid,
            FeatureLevel::High => FusionMethod::High,
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    /// 0..=100
    pub score: f64,
    pub method: FusionMethod,
    /// Level with the largest weighted contribution.
    pub dominant: Option<FeatureLevel>,
    /// Effective weights after redistribution.
    pub weights: LevelWeights,
}

impl FusionResult {
    fn unavailable() -> Self {
        Self {
            score: 0.0,
            method: FusionMethod::Unavailable,
            dominant: None,
            weights: LevelWeights {
                low: 0.0,
                mid: 0.0,
                high: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFusion {
    weights: LevelWeights,
    mid_weights: MidWeights,
    enabled: EnabledLevels,
    redistribution: Redistribution,
}

impl FeatureFusion {
    pub fn new(weights: LevelWeights, enabled: EnabledLevels) -> Self {
        Self {
            weights,
            mid_weights: MidWeights::default(),
            enabled,
            redistribution: Redistribution::Even,
        }
    }

    pub fn with_mid_weights(mut self, mid_weights: MidWeights) -> Self {
        self.mid_weights = mid_weights;
        self
    }

    pub fn with_redistribution(mut self, redistribution: Redistribution) -> Self {
        self.redistribution = redistribution;
        self
    }

    pub fn calculate_similarity(&self, a: &MultiLevelFeature, b: &MultiLevelFeature) -> FusionResult {
        let level_scores = [
            self.level_similarity(FeatureLevel::Low, a, b),
            self.level_similarity(FeatureLevel::Mid, a, b),
            self.level_similarity(FeatureLevel::High, a, b),
        ];
        let available = level_scores.map(|s| s.is_some());

        let Some(weights) = self.adaptive_weights(available) else {
            return FusionResult::unavailable();
        };

        let mut score = 0.0;
        let mut dominant: Option<(FeatureLevel, f64)> = None;
        for level in FeatureLevel::ALL {
            if let Some(similarity) = level_scores[level.index()] {
                let contribution = similarity * weights.get(level);
                score += contribution;
                if dominant.is_none_or(|(_, best)| contribution > best) {
                    dominant = Some((level, contribution));
                }
            }
        }

        let contributing: Vec<FeatureLevel> = FeatureLevel::ALL
            .into_iter()
            .filter(|l| available[l.index()])
            .collect();
        let method = match contributing.as_slice() {
            [single] => FusionMethod::from(*single),
            _ => FusionMethod::Fusion,
        };

        FusionResult {
            score: (score * 100.0).clamp(0.0, 100.0),
            method,
            dominant: dominant.map(|(level, _)| level),
            weights,
        }
    }

    /// Base weights with the share of unavailable levels spread over the
    /// available ones. `None` when no level is available.
    pub fn adaptive_weights(&self, available: [bool; 3]) -> Option<LevelWeights> {
        let count = available.iter().filter(|a| **a).count();
        if count == 0 {
            return None;
        }

        let missing: f64 = FeatureLevel::ALL
            .iter()
            .filter(|l| !available[l.index()])
            .map(|l| self.weights.get(*l))
            .sum();
        let share = missing / count as f64;

        let mut weights = LevelWeights {
            low: 0.0,
            mid: 0.0,
            high: 0.0,
        };
        for level in FeatureLevel::ALL {
            if available[level.index()] {
                let base = self.weights.get(level);
                weights.set(
                    level,
                    match self.redistribution {
                        Redistribution::Even => base + share,
                        // Normalisation below scales the base weights up
                        Redistribution::Proportional => base,
                    },
                );
            }
        }

        // Tuned base weights may not sum to one
        let total = weights.sum();
        if total <= f64::EPSILON {
            let even = 1.0 / count as f64;
            for level in FeatureLevel::ALL {
                if available[level.index()] {
                    weights.set(level, even);
                }
            }
        } else if (total - 1.0).abs() > 1e-9 {
            for level in FeatureLevel::ALL {
                weights.set(level, weights.get(level) / total);
            }
        }
        Some(weights)
    }

    fn level_similarity(
        &self,
        level: FeatureLevel,
        a: &MultiLevelFeature,
        b: &MultiLevelFeature,
    ) -> Option<f64> {
        if !self.enabled.contains(level) {
            return None;
        }
        match level {
            FeatureLevel::Low => low_level_similarity(a.low.as_ref()?, b.low.as_ref()?),
            FeatureLevel::Mid => self.mid_level_similarity(a.mid.as_ref()?, b.mid.as_ref()?),
            FeatureLevel::High => high_level_similarity(a.high.as_deref()?, b.high.as_deref()?),
        }
    }

    /// Weighted cosine over the sub-vectors both sides carry.
    pub fn mid_level_similarity(&self, a: &MidLevelFeatures, b: &MidLevelFeatures) -> Option<f64> {
        let pairs = [
            (
                a.color_histogram.as_deref().zip(b.color_histogram.as_deref()),
                self.mid_weights.histogram,
            ),
            (a.texture.as_deref().zip(b.texture.as_deref()), self.mid_weights.texture),
        ];

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (pair, weight) in pairs {
            if let Some((x, y)) = pair {
                weighted += cosine_similarity(x, y).max(0.0) * weight;
                total_weight += weight;
            }
        }

        if total_weight <= f64::EPSILON {
            None
        } else {
            Some(weighted / total_weight)
        }
    }
}

/// Mean Hamming-derived similarity in `[0, 1]` over algorithms present in both sets.
pub fn low_level_similarity(a: &FingerprintSet, b: &FingerprintSet) -> Option<f64> {
    let sims: Vec<f64> = HashAlgorithm::ALL
        .iter()
        .filter_map(|alg| a.get(*alg)?.similarity(b.get(*alg)?).ok())
        .collect();
    if sims.is_empty() {
        None
    } else {
        Some(sims.iter().sum::<f64>() / sims.len() as f64 / 100.0)
    }
}

/// Cosine in `[0, 1]` between deep vectors; `None` if lengths differ.
pub fn high_level_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    Some(cosine_similarity(a, b).max(0.0))
}

/// Weighted multi-hash similarity on a 0..=100 scale.
pub fn weighted_hash_similarity(
    a: &FingerprintSet,
    b: &FingerprintSet,
    weights: &HashWeights,
) -> Option<f64> {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for algorithm in HashAlgorithm::ALL {
        let (Some(x), Some(y)) = (a.get(algorithm), b.get(algorithm)) else {
            continue;
        };
        if let Ok(similarity) = x.similarity(y) {
            let weight = weights.get(algorithm);
            weighted += similarity * weight;
            total_weight += weight;
        }
    }
    if total_weight <= f64::EPSILON {
        None
    } else {
        Some(weighted / total_weight)
    }
}

/// Cosine similarity in `[-1, 1]`. Empty, mismatched or zero-norm input gives 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::FeatureMetadata;
    use crate::core::hash::Fingerprint;
    use chrono::Utc;

    fn fingerprint(algorithm: HashAlgorithm, ones: usize) -> Fingerprint {
        Fingerprint::from_bits(algorithm, (0..64).map(|i| i < ones))
    }

    fn low(ones: usize) -> FingerprintSet {
        let mut set = FingerprintSet::default();
        for alg in HashAlgorithm::ALL {
            set.set(fingerprint(alg, ones));
        }
        set
    }

    fn feature(
        low: Option<FingerprintSet>,
        mid: Option<MidLevelFeatures>,
        high: Option<Vec<f32>>,
    ) -> MultiLevelFeature {
        MultiLevelFeature {
            id: "p".into(),
            low,
            mid,
            high,
            metadata: FeatureMetadata {
                width: 1,
                height: 1,
                content_hash: String::new(),
                extracted_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_disjoint_levels_are_unavailable() {
        let fusion = FeatureFusion::default();
        let a = feature(Some(low(10)), None, None);
        let b = feature(None, None, Some(vec![1.0, 0.0]));
        let result = fusion.calculate_similarity(&a, &b);
        assert_eq!(result.method, FusionMethod::Unavailable);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_missing_level_weight_is_redistributed() {
        let fusion = FeatureFusion::default();
        let weights = fusion.adaptive_weights([true, true, false]).unwrap();
        assert!((weights.low - 0.5).abs() < 1e-9);
        assert!((weights.mid - 0.5).abs() < 1e-9);
        assert_eq!(weights.high, 0.0);

        let weights = fusion.adaptive_weights([false, false, true]).unwrap();
        assert!((weights.high - 1.0).abs() < 1e-9);
        assert!(fusion.adaptive_weights([false; 3]).is_none());
    }

    #[test]
    fn test_proportional_redistribution() {
        let fusion = FeatureFusion::default().with_redistribution(Redistribution::Proportional);
        let weights = fusion.adaptive_weights([false, true, true]).unwrap();
        assert!((weights.mid - 0.3 / 0.7).abs() < 1e-9);
        assert!((weights.high - 0.4 / 0.7).abs() < 1e-9);
        assert_eq!(weights.low, 0.0);
    }

    #[test]
    fn test_identical_features_score_full() {
        let fusion = FeatureFusion::default();
        let mid = MidLevelFeatures {
            color_histogram: Some(vec![0.2, 0.3, 0.5]),
            texture: Some(vec![1.0, 0.0]),
        };
        let a = feature(Some(low(20)), Some(mid.clone()), Some(vec![0.5, 0.5, 0.1]));
        let result = fusion.calculate_similarity(&a, &a.clone());
        assert!((result.score - 100.0).abs() < 1e-6);
        assert_eq!(result.method, FusionMethod::Fusion);
    }

    #[test]
    fn test_single_level_names_method() {
        let fusion = FeatureFusion::default();
        let a = feature(Some(low(0)), None, None);
        let b = feature(Some(low(16)), None, None);
        let result = fusion.calculate_similarity(&a, &b);
        assert_eq!(result.method, FusionMethod::Low);
        assert_eq!(result.dominant, Some(FeatureLevel::Low));
        assert!((result.score - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_level_is_ignored() {
        let fusion = FeatureFusion::new(LevelWeights::default(), EnabledLevels::only(FeatureLevel::High));
        let a = feature(Some(low(0)), None, Some(vec![1.0, 0.0]));
        let b = feature(Some(low(64)), None, Some(vec![1.0, 0.0]));
        let result = fusion.calculate_similarity(&a, &b);
        assert_eq!(result.method, FusionMethod::High);
        assert!((result.score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_mid_uses_only_shared_sub_vectors() {
        let fusion = FeatureFusion::default();
        let a = MidLevelFeatures {
            color_histogram: Some(vec![1.0, 0.0]),
            texture: Some(vec![0.0, 1.0]),
        };
        let b = MidLevelFeatures {
            color_histogram: Some(vec![1.0, 0.0]),
            texture: None,
        };
        assert_eq!(fusion.mid_level_similarity(&a, &b), Some(1.0));
    }

    #[test]
    fn test_zero_norm_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(high_level_similarity(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let fusion = FeatureFusion::default();
        for ones in [0, 7, 32, 64] {
            let a = feature(Some(low(ones)), None, Some(vec![1.0, -1.0]));
            let b = feature(Some(low(64 - ones)), None, Some(vec![-1.0, 1.0]));
            let score = fusion.calculate_similarity(&a, &b).score;
            assert!((0.0..=100.0).contains(&score));
        }
    }

    #[test]
    fn test_weighted_hash_similarity() {
        let a = low(0);
        let mut b = low(0);
        b.perceptual = Some(fingerprint(HashAlgorithm::Perceptual, 32));
        let similarity = weighted_hash_similarity(&a, &b, &HashWeights::default()).unwrap();
        // 0.3 * 100 + 0.3 * 100 + 0.4 * 50
        assert!((similarity - 80.0).abs() < 1e-9);
    }
}
