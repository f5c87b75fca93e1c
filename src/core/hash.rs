use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Side length of the square luminance grid behind average/perceptual hashes.
const GRID: u32 = 8;
/// Intermediate resolution for the perceptual hash.
const PERCEPTUAL_BASE: u32 = 32;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image has no pixels")]
    EmptyImage,

    #[error("Fingerprint length mismatch: {left} vs {right} bits")]
    LengthMismatch { left: usize, right: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Average,
    Difference,
    Perceptual,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [
        HashAlgorithm::Average,
        HashAlgorithm::Difference,
        HashAlgorithm::Perceptual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Average => "average",
            HashAlgorithm::Difference => "difference",
            HashAlgorithm::Perceptual => "perceptual",
        }
    }
}

/// Fixed-length bit string produced by one hashing algorithm.
///
/// Bits are packed MSB-first into 32-bit words so that Hamming distance can be
/// computed one word at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    algorithm: HashAlgorithm,
    bits: usize,
    words: Vec<u32>,
}

impl Fingerprint {
    pub fn from_bits<I>(algorithm: HashAlgorithm, bits: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        let mut words = Vec::new();
        let mut len = 0;
        for bit in bits {
            if len % 32 == 0 {
                words.push(0u32);
            }
            if bit {
                let last = words.len() - 1;
                words[last] |= 1 << (31 - (len % 32));
            }
            len += 1;
        }
        Self {
            algorithm,
            bits: len,
            words,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn bit(&self, index: usize) -> bool {
        index < self.bits && self.words[index / 32] & (1 << (31 - (index % 32))) != 0
    }

    /// Reads `width` bits starting at `start` as an integer (used for LSH banding).
    pub fn band(&self, start: usize, width: usize) -> u64 {
        (start..(start + width).min(self.bits))
            .fold(0u64, |acc, i| (acc << 1) | self.bit(i) as u64)
    }

    pub fn hamming_distance(&self, other: &Fingerprint) -> Result<u32, HashError> {
        if self.bits != other.bits {
            return Err(HashError::LengthMismatch {
                left: self.bits,
                right: other.bits,
            });
        }
        Ok(self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum())
    }

    /// Similarity on a 0..=100 scale derived from the Hamming distance.
    pub fn similarity(&self, other: &Fingerprint) -> Result<f64, HashError> {
        let distance = self.hamming_distance(other)?;
        if self.bits == 0 {
            return Ok(0.0);
        }
        Ok((self.bits as f64 - distance as f64) / self.bits as f64 * 100.0)
    }

    /// Expands the fingerprint into a 0/1 vector for spatial indexing.
    pub fn to_unit_vector(&self) -> Vec<f32> {
        (0..self.bits)
            .map(|i| if self.bit(i) { 1.0 } else { 0.0 })
            .collect()
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.bits.div_ceil(4));
        for chunk in 0..self.bits.div_ceil(4) {
            let nibble = self.band(chunk * 4, 4);
            out.push(char::from_digit(nibble as u32, 16).unwrap_or('0'));
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.to_hex())
    }
}

/// All fingerprints computed for one photo. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    pub average: Option<Fingerprint>,
    pub difference: Option<Fingerprint>,
    pub perceptual: Option<Fingerprint>,
}

impl FingerprintSet {
    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&Fingerprint> {
        match algorithm {
            HashAlgorithm::Average => self.average.as_ref(),
            HashAlgorithm::Difference => self.difference.as_ref(),
            HashAlgorithm::Perceptual => self.perceptual.as_ref(),
        }
    }

    pub fn set(&mut self, fingerprint: Fingerprint) {
        match fingerprint.algorithm() {
            HashAlgorithm::Average => self.average = Some(fingerprint),
            HashAlgorithm::Difference => self.difference = Some(fingerprint),
            HashAlgorithm::Perceptual => self.perceptual = Some(fingerprint),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        [&self.average, &self.difference, &self.perceptual]
            .into_iter()
            .flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Concatenated 0/1 vector of every present fingerprint, in algorithm order.
    pub fn to_vector(&self) -> Vec<f32> {
        self.iter().flat_map(|fp| fp.to_unit_vector()).collect()
    }
}

/// Computes perceptual fingerprints from decoded pixels.
pub struct HashEngine {
    filter: FilterType,
}

impl HashEngine {
    pub fn new() -> Self {
        Self {
            filter: FilterType::Triangle,
        }
    }

    pub fn compute_hash(
        &self,
        image: &DynamicImage,
        algorithm: HashAlgorithm,
    ) -> Result<Fingerprint, HashError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(HashError::EmptyImage);
        }

        let fingerprint = match algorithm {
            HashAlgorithm::Average => {
                let gray = self.grayscale(image, GRID, GRID);
                mean_threshold(algorithm, &gray)
            }
            HashAlgorithm::Difference => {
                let gray = self.grayscale(image, GRID + 1, GRID);
                let bits = (0..GRID).flat_map(|y| {
                    let gray = &gray;
                    (0..GRID).map(move |x| gray.get_pixel(x, y)[0] > gray.get_pixel(x + 1, y)[0])
                });
                Fingerprint::from_bits(algorithm, bits)
            }
            HashAlgorithm::Perceptual => {
                // Two-step reduction: smooth at 32x32, then box-average down to 8x8
                let base = self.grayscale(image, PERCEPTUAL_BASE, PERCEPTUAL_BASE);
                let step = PERCEPTUAL_BASE / GRID;
                let reduced = GrayImage::from_fn(GRID, GRID, |gx, gy| {
                    let mut sum = 0u32;
                    for y in gy * step..(gy + 1) * step {
                        for x in gx * step..(gx + 1) * step {
                            sum += base.get_pixel(x, y)[0] as u32;
                        }
                    }
                    image::Luma([(sum / (step * step)) as u8])
                });
                mean_threshold(algorithm, &reduced)
            }
        };

        Ok(fingerprint)
    }

    pub fn compute_all_hashes(&self, image: &DynamicImage) -> Result<FingerprintSet, HashError> {
        let mut set = FingerprintSet::default();
        for algorithm in HashAlgorithm::ALL {
            set.set(self.compute_hash(image, algorithm)?);
        }
        Ok(set)
    }

    /// Decodes encoded image bytes, then hashes them.
    pub fn hash_bytes(
        &self,
        bytes: &[u8],
        algorithm: HashAlgorithm,
    ) -> Result<Fingerprint, HashError> {
        let image = image::load_from_memory(bytes)?;
        self.compute_hash(&image, algorithm)
    }

    fn grayscale(&self, image: &DynamicImage, width: u32, height: u32) -> GrayImage {
        image.resize_exact(width, height, self.filter).to_luma8()
    }
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn mean_threshold(algorithm: HashAlgorithm, gray: &GrayImage) -> Fingerprint {
    let count = (gray.width() * gray.height()).max(1) as f64;
    let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
    Fingerprint::from_bits(algorithm, gray.pixels().map(|p| p[0] as f64 > mean))
}

/// Content fingerprint (blake3, hex) used to key cached results.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn checker_image(size: u32, invert: bool) -> DynamicImage {
        let cell = size / 8;
        let img = RgbImage::from_fn(size, size, |x, y| {
            let on = ((x / cell) + (y / cell)) % 2 == 0;
            let on = on != invert;
            let v = if on { 210 } else { 40 };
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_hash_is_deterministic() {
        let engine = HashEngine::new();
        let image = checker_image(64, false);
        for algorithm in HashAlgorithm::ALL {
            let a = engine.compute_hash(&image, algorithm).unwrap();
            let b = engine.compute_hash(&image, algorithm).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 64);
        }
    }

    #[test]
    fn test_hamming_distance_is_symmetric() {
        let engine = HashEngine::new();
        let a = engine.compute_all_hashes(&checker_image(64, false)).unwrap();
        let b = engine.compute_all_hashes(&checker_image(64, true)).unwrap();
        for (fa, fb) in a.iter().zip(b.iter()) {
            assert_eq!(
                fa.hamming_distance(fb).unwrap(),
                fb.hamming_distance(fa).unwrap()
            );
        }
    }

    #[test]
    fn test_inverted_image_flips_average_hash() {
        let engine = HashEngine::new();
        let a = engine
            .compute_hash(&checker_image(64, false), HashAlgorithm::Average)
            .unwrap();
        let b = engine
            .compute_hash(&checker_image(64, true), HashAlgorithm::Average)
            .unwrap();
        assert_eq!(a.hamming_distance(&b).unwrap(), 64);
        assert_eq!(a.similarity(&b).unwrap(), 0.0);
        assert_eq!(a.similarity(&a).unwrap(), 100.0);
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let a = Fingerprint::from_bits(HashAlgorithm::Average, [true; 64]);
        let b = Fingerprint::from_bits(HashAlgorithm::Average, [true; 32]);
        assert!(matches!(
            a.hamming_distance(&b),
            Err(HashError::LengthMismatch { left: 64, right: 32 })
        ));
    }

    #[test]
    fn test_hex_and_band() {
        let bits = (0..64).map(|i| i < 4);
        let fp = Fingerprint::from_bits(HashAlgorithm::Difference, bits);
        assert_eq!(fp.to_hex(), "f000000000000000");
        assert_eq!(fp.band(0, 8), 0b1111_0000);
        assert_eq!(fp.band(8, 8), 0);
        assert_eq!(fp.to_unit_vector().iter().sum::<f32>(), 4.0);
    }

    #[test]
    fn test_corrupt_bytes_fail_with_decode_error() {
        let engine = HashEngine::new();
        let result = engine.hash_bytes(b"definitely not an image", HashAlgorithm::Average);
        assert!(matches!(result, Err(HashError::Decode(_))));
    }

    #[test]
    fn test_content_hash_is_hex() {
        let hash = content_hash(b"Hello, World!");
        assert_eq!(hash, content_hash(b"Hello, World!"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
