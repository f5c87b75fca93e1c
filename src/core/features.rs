use crate::core::extractor::{extract_checked, ExtractionError, FeatureExtractor};
use crate::core::hash::{FingerprintSet, HashEngine};
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const HISTOGRAM_BINS_PER_CHANNEL: usize = 8;
pub const ORIENTATION_BINS: usize = 8;
/// Texture energy is measured on a GRID_CELLS x GRID_CELLS grid.
pub const GRID_CELLS: usize = 4;
/// Mid-level extraction works on a thumbnail of at most this side.
const ANALYSIS_SIDE: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureLevel {
    Low,
    Mid,
    High,
}

impl FeatureLevel {
    pub const ALL: [FeatureLevel; 3] = [FeatureLevel::Low, FeatureLevel::Mid, FeatureLevel::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureLevel::Low => "low",
            FeatureLevel::Mid => "mid",
            FeatureLevel::High => "high",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            FeatureLevel::Low => 0,
            FeatureLevel::Mid => 1,
            FeatureLevel::High => 2,
        }
    }
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which feature levels are extracted and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnabledLevels {
    pub low: bool,
    pub mid: bool,
    pub high: bool,
}

impl EnabledLevels {
    pub fn contains(&self, level: FeatureLevel) -> bool {
        match level {
            FeatureLevel::Low => self.low,
            FeatureLevel::Mid => self.mid,
            FeatureLevel::High => self.high,
        }
    }

    pub fn only(level: FeatureLevel) -> Self {
        Self {
            low: level == FeatureLevel::Low,
            mid: level == FeatureLevel::Mid,
            high: level == FeatureLevel::High,
        }
    }
}

impl Default for EnabledLevels {
    fn default() -> Self {
        Self {
            low: true,
            mid: true,
            high: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MidLevelFeatures {
    pub color_histogram: Option<Vec<f32>>,
    pub texture: Option<Vec<f32>>,
}

impl MidLevelFeatures {
    pub fn is_empty(&self) -> bool {
        self.color_histogram.is_none() && self.texture.is_none()
    }

    /// Histogram followed by texture, for spatial indexing.
    pub fn to_vector(&self) -> Vec<f32> {
        let mut vector = Vec::new();
        if let Some(hist) = &self.color_histogram {
            vector.extend_from_slice(hist);
        }
        if let Some(texture) = &self.texture {
            vector.extend_from_slice(texture);
        }
        vector
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    pub width: u32,
    pub height: u32,
    pub content_hash: String,
    pub extracted_at: DateTime<Utc>,
}

/// Every descriptor extracted for one photo. Replaced wholesale on re-extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiLevelFeature {
    pub id: String,
    pub low: Option<FingerprintSet>,
    pub mid: Option<MidLevelFeatures>,
    pub high: Option<Vec<f32>>,
    pub metadata: FeatureMetadata,
}

impl MultiLevelFeature {
    pub fn has_level(&self, level: FeatureLevel) -> bool {
        match level {
            FeatureLevel::Low => self.low.as_ref().is_some_and(|l| !l.is_empty()),
            FeatureLevel::Mid => self.mid.as_ref().is_some_and(|m| !m.is_empty()),
            FeatureLevel::High => self.high.as_ref().is_some_and(|h| !h.is_empty()),
        }
    }

    /// Flat vector for `level`, if that level was extracted.
    pub fn level_vector(&self, level: FeatureLevel) -> Option<Vec<f32>> {
        if !self.has_level(level) {
            return None;
        }
        match level {
            FeatureLevel::Low => self.low.as_ref().map(FingerprintSet::to_vector),
            FeatureLevel::Mid => self.mid.as_ref().map(MidLevelFeatures::to_vector),
            FeatureLevel::High => self.high.clone(),
        }
    }
}

/// Normalised RGB histogram, `HISTOGRAM_BINS_PER_CHANNEL` bins per channel.
pub fn color_histogram(image: &DynamicImage) -> Vec<f32> {
    let rgb = analysis_thumbnail(image).to_rgb8();
    let mut hist = vec![0f32; HISTOGRAM_BINS_PER_CHANNEL * 3];
    let bin_width = 256 / HISTOGRAM_BINS_PER_CHANNEL;

    for pixel in rgb.pixels() {
        for channel in 0..3 {
            let bin = pixel[channel] as usize / bin_width;
            hist[channel * HISTOGRAM_BINS_PER_CHANNEL + bin] += 1.0;
        }
    }

    let total: f32 = hist.iter().sum();
    if total > 0.0 {
        hist.iter_mut().for_each(|v| *v /= total);
    }
    hist
}

/// Gradient-orientation histogram followed by per-cell edge energy.
///
/// Flat images produce an all-zero descriptor.
pub fn texture_descriptor(image: &DynamicImage) -> Vec<f32> {
    let gray = analysis_thumbnail(image).to_luma8();
    let (width, height) = gray.dimensions();
    let mut orientation = vec![0f32; ORIENTATION_BINS];
    let mut energy = vec![0f32; GRID_CELLS * GRID_CELLS];
    let mut cell_counts = vec![0u32; GRID_CELLS * GRID_CELLS];

    if width < 3 || height < 3 {
        orientation.extend(energy);
        return orientation;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let px = |dx: i32, dy: i32| {
                gray.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as f32
            };
            // Sobel
            let gx = (px(1, -1) + 2.0 * px(1, 0) + px(1, 1))
                - (px(-1, -1) + 2.0 * px(-1, 0) + px(-1, 1));
            let gy = (px(-1, 1) + 2.0 * px(0, 1) + px(1, 1))
                - (px(-1, -1) + 2.0 * px(0, -1) + px(1, -1));
            let magnitude = (gx * gx + gy * gy).sqrt();

            let cell_x = (x as usize * GRID_CELLS / width as usize).min(GRID_CELLS - 1);
            let cell_y = (y as usize * GRID_CELLS / height as usize).min(GRID_CELLS - 1);
            energy[cell_y * GRID_CELLS + cell_x] += magnitude;
            cell_counts[cell_y * GRID_CELLS + cell_x] += 1;

            if magnitude > f32::EPSILON {
                // Orientation folded to [0, pi)
                let angle = gy.atan2(gx).rem_euclid(std::f32::consts::PI);
                let bin = ((angle / std::f32::consts::PI) * ORIENTATION_BINS as f32) as usize;
                orientation[bin.min(ORIENTATION_BINS - 1)] += magnitude;
            }
        }
    }

    let total: f32 = orientation.iter().sum();
    if total > 0.0 {
        orientation.iter_mut().for_each(|v| *v /= total);
    }

    // Max Sobel magnitude on 8-bit input is about 1442
    for (e, count) in energy.iter_mut().zip(&cell_counts) {
        if *count > 0 {
            *e = (*e / *count as f32 / 1442.0).min(1.0);
        }
    }

    orientation.extend(energy);
    orientation
}

fn analysis_thumbnail(image: &DynamicImage) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= ANALYSIS_SIDE && height <= ANALYSIS_SIDE {
        image.clone()
    } else {
        image.resize(ANALYSIS_SIDE, ANALYSIS_SIDE, FilterType::Triangle)
    }
}

/// Assembles a `MultiLevelFeature` from a decoded photo.
pub struct FeatureBuilder<'a> {
    hash_engine: &'a HashEngine,
    extractor: Option<&'a dyn FeatureExtractor>,
    levels: EnabledLevels,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(hash_engine: &'a HashEngine, levels: EnabledLevels) -> Self {
        Self {
            hash_engine,
            extractor: None,
            levels,
        }
    }

    pub fn with_extractor(mut self, extractor: Option<&'a dyn FeatureExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Extracts every enabled level. A level that fails is left empty; the call
    /// only fails when no level at all could be produced.
    ///
    /// `known_low` short-circuits hashing when fingerprints were already cached.
    pub fn build(
        &self,
        id: &str,
        image: &DynamicImage,
        content_hash: String,
        known_low: Option<FingerprintSet>,
    ) -> Result<MultiLevelFeature, ExtractionError> {
        let mut first_error = None;

        let low = if self.levels.low {
            match known_low {
                Some(low) => Some(low),
                None => match self.hash_engine.compute_all_hashes(image) {
                    Ok(set) => Some(set),
                    Err(e) => {
                        log::debug!("Low-level extraction failed for {}: {}", id, e);
                        if first_error.is_none() {
                            first_error = Some(ExtractionError::Hash(e));
                        }
                        None
                    }
                },
            }
        } else {
            None
        };

        let mid = if self.levels.mid && image.width() > 0 && image.height() > 0 {
            Some(MidLevelFeatures {
                color_histogram: Some(color_histogram(image)),
                texture: Some(texture_descriptor(image)),
            })
        } else {
            None
        };

        let high = match (self.levels.high, self.extractor) {
            (true, Some(extractor)) => match extract_checked(extractor, image) {
                Ok(vector) => Some(vector),
                Err(e) => {
                    log::debug!("High-level extraction failed for {}: {}", id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    None
                }
            },
            _ => None,
        };

        let feature = MultiLevelFeature {
            id: id.to_string(),
            low,
            mid,
            high,
            metadata: FeatureMetadata {
                width: image.width(),
                height: image.height(),
                content_hash,
                extracted_at: Utc::now(),
            },
        };

        if FeatureLevel::ALL.iter().any(|l| feature.has_level(*l)) {
            Ok(feature)
        } else {
            Err(first_error.unwrap_or(ExtractionError::NoLevels))
        }
    }
}
