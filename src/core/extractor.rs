use crate::core::hash::HashError;
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Hash computation failed: {0}")]
    Hash(#[from] HashError),

    #[error("Feature extractor '{extractor}' failed: {message}")]
    Extractor { extractor: String, message: String },

    #[error("Extractor returned a vector of length {actual}, expected {expected}")]
    InvalidVector { expected: usize, actual: usize },

    #[error("No feature level could be extracted")]
    NoLevels,
}

/// High-level (deep) feature capability.
///
/// Implementations wrap whatever model produces the embedding; the pipeline
/// treats them as opaque and drops the high level when they fail.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this extractor returns.
    fn dimension(&self) -> usize;

    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>, ExtractionError>;
}

/// Model-free embedding: a downscaled grayscale thumbnail, zero-centred and
/// L2-normalised. Stands in for a neural extractor when none is available.
pub struct PixelEmbeddingExtractor {
    side: u32,
}

impl PixelEmbeddingExtractor {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(2) }
    }
}

impl Default for PixelEmbeddingExtractor {
    fn default() -> Self {
        Self::new(16)
    }
}

impl FeatureExtractor for PixelEmbeddingExtractor {
    fn name(&self) -> &str {
        "pixel-embedding"
    }

    fn dimension(&self) -> usize {
        (self.side * self.side) as usize
    }

    fn extract(&self, image: &DynamicImage) -> Result<Vec<f32>, ExtractionError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractionError::Extractor {
                extractor: self.name().to_string(),
                message: "image has no pixels".to_string(),
            });
        }

        let gray = image
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_luma8();
        let mut vector: Vec<f32> = gray.pixels().map(|p| p[0] as f32 / 255.0).collect();

        let mean = vector.iter().sum::<f32>() / vector.len() as f32;
        vector.iter_mut().for_each(|v| *v -= mean);
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

/// Runs `extractor` and checks the returned length against its declared dimension.
pub fn extract_checked(
    extractor: &dyn FeatureExtractor,
    image: &DynamicImage,
) -> Result<Vec<f32>, ExtractionError> {
    let vector = extractor.extract(image)?;
    if vector.len() != extractor.dimension() || vector.is_empty() {
        return Err(ExtractionError::InvalidVector {
            expected: extractor.dimension(),
            actual: vector.len(),
        });
    }
    Ok(vector)
}
