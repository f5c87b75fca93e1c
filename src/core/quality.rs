use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use serde::{Deserialize, Serialize};

/// Images are scored on a copy no larger than this on either side.
const SCORING_SIDE: u32 = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: f64,
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub technical_issues: Vec<String>,
}

/// Sharpness / brightness / contrast composite used to pick group representatives.
pub struct QualityScorer {
    sharpness_weight: f64,
    brightness_weight: f64,
    contrast_weight: f64,
}

impl QualityScorer {
    pub fn new() -> Self {
        Self {
            sharpness_weight: 0.4,
            brightness_weight: 0.3,
            contrast_weight: 0.3,
        }
    }

    pub fn score(&self, image: &DynamicImage) -> QualityScore {
        let (width, height) = image.dimensions();
        let gray = if width > SCORING_SIDE || height > SCORING_SIDE {
            image
                .resize(SCORING_SIDE, SCORING_SIDE, FilterType::Triangle)
                .to_luma8()
        } else {
            image.to_luma8()
        };

        let sharpness = self.calculate_sharpness(&gray);
        let (mean, std_dev) = luminance_stats(&gray);
        // Best exposure sits around mid-grey
        let brightness = (1.0 - (mean / 255.0 - 0.5).abs() * 2.0).max(0.0);
        // A standard deviation of 64 levels already reads as full contrast
        let contrast = (std_dev / 64.0).min(1.0);

        let mut technical_issues = Vec::new();
        if sharpness < 0.3 {
            technical_issues.push("Image appears blurry".to_string());
        }
        if brightness < 0.4 {
            technical_issues.push("Poor exposure detected".to_string());
        }
        if contrast < 0.2 {
            technical_issues.push("Low contrast".to_string());
        }

        let overall = sharpness * self.sharpness_weight
            + brightness * self.brightness_weight
            + contrast * self.contrast_weight;

        QualityScore {
            overall,
            sharpness,
            brightness,
            contrast,
            technical_issues,
        }
    }

    fn calculate_sharpness(&self, gray: &GrayImage) -> f64 {
        // Normalised against a variance that reads as crisp on typical photos
        (laplacian_variance(gray) / 1000.0).min(1.0)
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new()
    }
}

fn laplacian_variance(image: &GrayImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let kernel: [[f64; 3]; 3] = [[0.0, -1.0, 0.0], [-1.0, 4.0, -1.0], [0.0, -1.0, 0.0]];
    let mut sum = 0.0;
    let mut count = 0u64;

    for y in 1..(height - 1) {
        for x in 1..(width - 1) {
            let mut laplacian = 0.0;
            for (ky, row) in kernel.iter().enumerate() {
                for (kx, weight) in row.iter().enumerate() {
                    let pixel = image.get_pixel(x + kx as u32 - 1, y + ky as u32 - 1)[0] as f64;
                    laplacian += pixel * weight;
                }
            }
            sum += laplacian * laplacian;
            count += 1;
        }
    }

    sum / count as f64
}

fn luminance_stats(image: &GrayImage) -> (f64, f64) {
    let n = (image.width() as u64 * image.height() as u64) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = image.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let variance = image
        .pixels()
        .map(|p| (p[0] as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn gray(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(width, height, |x, y| Luma([f(x, y)])))
    }

    #[test]
    fn test_sharp_image_outscores_flat_image() {
        let scorer = QualityScorer::new();
        let sharp = scorer.score(&gray(64, 64, |x, y| if (x + y) % 2 == 0 { 30 } else { 220 }));
        let flat = scorer.score(&gray(64, 64, |_, _| 128));

        assert!(sharp.sharpness > flat.sharpness);
        assert!(sharp.contrast > flat.contrast);
        assert!(sharp.overall > flat.overall);
        assert!(flat.technical_issues.iter().any(|i| i.contains("blurry")));
    }

    #[test]
    fn test_dark_image_flags_exposure() {
        let scorer = QualityScorer::new();
        let dark = scorer.score(&gray(32, 32, |_, _| 5));
        assert!(dark.brightness < 0.1);
        assert!(dark.technical_issues.iter().any(|i| i.contains("exposure")));
    }

    #[test]
    fn test_tiny_image_does_not_panic() {
        let scorer = QualityScorer::new();
        let score = scorer.score(&gray(1, 1, |_, _| 100));
        assert_eq!(score.sharpness, 0.0);
        assert!(score.overall >= 0.0 && score.overall <= 1.0);
    }
}
