#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Horizontal gradient with a few solid blocks; far from flat in every hash.
pub fn scene() -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        let base = (x * 4) as u8;
        if (16..32).contains(&y) && (8..24).contains(&x) {
            Rgb([230, 40, 40])
        } else if (40..56).contains(&y) && (36..60).contains(&x) {
            Rgb([20, 60, 200])
        } else {
            Rgb([base, base / 2, 255 - base])
        }
    })
}

/// `scene()` with a single pixel nudged, different for every `i`.
pub fn near_copy(i: u32) -> DynamicImage {
    let mut image = scene();
    let (x, y) = (i % 64, (i / 64) % 64);
    let pixel = image.get_pixel_mut(x, y);
    pixel.0 = pixel.0.map(|c| c.saturating_add(10));
    DynamicImage::ImageRgb8(image)
}

/// 8x8 grid of random coloured blocks.
pub fn random_blocks(seed: u64) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let colors: Vec<[u8; 3]> = (0..64)
        .map(|_| [rng.random::<u8>(), rng.random::<u8>(), rng.random::<u8>()])
        .collect();
    DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
        Rgb(colors[((y / 8) * 8 + x / 8) as usize])
    }))
}

/// 128px checkerboard of 16px cells with jittered dark and bright tones.
pub fn checker(seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let tones: Vec<u8> = (0..64)
        .map(|cell| {
            let bright = (cell / 8 + cell % 8) % 2 == 0;
            let jitter = rng.random_range(0..40u8);
            if bright { 190 + jitter } else { 30 + jitter }
        })
        .collect();
    RgbImage::from_fn(128, 128, |x, y| {
        let v = tones[((y / 16) * 8 + x / 16) as usize];
        Rgb([v, v, v])
    })
}

/// Same image with a 1px solid black frame.
pub fn with_border(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut framed = image.clone();
    for (x, y, pixel) in framed.enumerate_pixels_mut() {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            *pixel = Rgb([0, 0, 0]);
        }
    }
    framed
}

/// Random unit-free vectors; distinct with overwhelming probability.
pub fn random_vectors(count: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dimension).map(|_| rng.random::<f32>()).collect())
        .collect()
}
