//! Gradient-guided dimensionality reduction for indexed vectors.
//!
//! Instead of sampling uniformly, the compressor keeps the positions where the
//! vector changes most sharply. Bit-expanded hashes and texture descriptors
//! carry most of their information at such transitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Compressed vectors never shrink below this length.
pub const MIN_COMPRESSED_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VectorCompressor {
    ratio: f64,
}

impl VectorCompressor {
    /// `ratio` is clamped into `[0, 1]`; 1.0 disables compression.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self { ratio }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn target_len(&self, len: usize) -> usize {
        MIN_COMPRESSED_LEN.max((len as f64 * self.ratio).round() as usize)
    }

    pub fn compress(&self, vector: &[f32]) -> Vec<f32> {
        let target = self.target_len(vector.len());
        if target >= vector.len() {
            return vector.to_vec();
        }
        self.select_indices(vector, target)
            .into_iter()
            .map(|i| vector[i])
            .collect()
    }

    /// Indices kept for `vector`, ascending, exactly `target` of them.
    fn select_indices(&self, vector: &[f32], target: usize) -> Vec<usize> {
        let len = vector.len();
        let last = len - 1;

        // Forward difference; the final element has no successor
        let gradient: Vec<f32> = (0..len)
            .map(|i| {
                if i < last {
                    (vector[i + 1] - vector[i]).abs()
                } else {
                    0.0
                }
            })
            .collect();

        let mut ranked: Vec<usize> = (1..last).collect();
        ranked.sort_by(|&a, &b| gradient[b].total_cmp(&gradient[a]).then(a.cmp(&b)));
        ranked.truncate(target.saturating_sub(2));

        let min_spacing = len / target / 2;
        let mut selected = BTreeSet::from([0, last]);
        for index in ranked {
            if spaced_enough(&selected, index, min_spacing) {
                selected.insert(index);
            }
        }

        // Pad with evenly spaced positions, then any free slot left to right
        if selected.len() < target {
            let step = last as f64 / (target - 1) as f64;
            for j in 0..target {
                if selected.len() >= target {
                    break;
                }
                selected.insert((j as f64 * step).round() as usize);
            }
        }
        let mut next = 0;
        while selected.len() < target && next < len {
            selected.insert(next);
            next += 1;
        }

        selected.into_iter().collect()
    }
}

impl Default for VectorCompressor {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn spaced_enough(selected: &BTreeSet<usize>, index: usize, min_spacing: usize) -> bool {
    if min_spacing <= 1 {
        return true;
    }
    let below = selected.range(..index).next_back();
    let above = selected.range(index..).next();
    below.is_none_or(|&b| index - b >= min_spacing) && above.is_none_or(|&a| a - index >= min_spacing)
}

/// Compresses `vector` to `max(16, round(len * ratio))` elements.
pub fn compress(vector: &[f32], ratio: f64) -> Vec<f32> {
    VectorCompressor::new(ratio).compress(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_ratio_is_identity() {
        let v: Vec<f32> = (0..100).map(|i| (i as f32).sin()).collect();
        assert_eq!(compress(&v, 1.0), v);
    }

    #[test]
    fn test_short_vectors_are_untouched() {
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(compress(&v, 0.1), v);
        let v16: Vec<f32> = (0..16).map(|i| i as f32).collect();
        assert_eq!(compress(&v16, 0.5), v16);
    }

    #[test]
    fn test_output_length_matches_target() {
        let v: Vec<f32> = (0..192).map(|i| ((i * 7) % 5) as f32).collect();
        assert_eq!(compress(&v, 0.5).len(), 96);
        assert_eq!(compress(&v, 0.25).len(), 48);
        assert_eq!(compress(&v, 0.01).len(), MIN_COMPRESSED_LEN);
    }

    #[test]
    fn test_keeps_endpoints_and_sharp_transitions() {
        let mut v = vec![0.0f32; 64];
        v[30] = 10.0;
        v[45] = -8.0;
        let compressor = VectorCompressor::new(0.25);
        let indices = compressor.select_indices(&v, compressor.target_len(v.len()));

        assert_eq!(indices.len(), 16);
        assert_eq!(indices[0], 0);
        assert_eq!(*indices.last().unwrap(), 63);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        // The spikes rise at 29/30 and 44/45
        assert!(indices.contains(&29) || indices.contains(&30));
        assert!(indices.contains(&44) || indices.contains(&45));
    }

    #[test]
    fn test_compression_is_deterministic() {
        let v: Vec<f32> = (0..300).map(|i| ((i * 31) % 17) as f32 / 17.0).collect();
        let compressor = VectorCompressor::new(0.3);
        assert_eq!(compressor.compress(&v), compressor.compress(&v));
    }
}
