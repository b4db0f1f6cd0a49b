//! Synthetic subjects and a scripted detector for unit tests.

use crate::detector::FaceDetector;
use crate::normalizer::{ImageInput, ImageNormalizer, NormalizerParams};
use crate::types::{FacePatch, FaceRegion};
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const IMAGE_SIZE: u32 = 240;

/// Gain/offset pairs applied to a subject's base levels.
///
/// Gains are at least 1 so the level map stays strictly increasing and
/// histogram equalization maps every variant back to the same patch.
const VARIANTS: [(f64, f64); 8] = [
    (1.0, 0.0),
    (1.0, 6.0),
    (1.0, -6.0),
    (1.05, 0.0),
    (1.05, 4.0),
    (1.1, -4.0),
    (1.1, 3.0),
    (1.02, -2.0),
];

/// Returns the same regions for every image and counts invocations.
pub struct ScriptedDetector {
    regions: Vec<FaceRegion>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(regions: Vec<FaceRegion>) -> Self {
        Self {
            regions,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn single(region: FaceRegion) -> Self {
        Self::new(vec![region])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, _gray: &GrayImage) -> Vec<FaceRegion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.regions.clone()
    }
}

/// The face region every synthetic photo is framed around.
pub fn face_region() -> FaceRegion {
    FaceRegion::new(20, 20, 200, 200)
}

/// A synthetic "person": a smooth interference texture fixed by a seed.
pub struct Subject {
    waves: Vec<(f64, f64, f64, f64)>,
}

impl Subject {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let waves = (0..4)
            .map(|_| {
                let fx = rng.gen_range(0.1..0.35) * if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                let fy = rng.gen_range(0.1..0.35) * if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                let phase = rng.gen_range(0.0..std::f64::consts::TAU);
                let amp = rng.gen_range(15.0..25.0);
                (fx, fy, phase, amp)
            })
            .collect();
        Self { waves }
    }

    fn level(&self, x: u32, y: u32) -> f64 {
        let wave: f64 = self
            .waves
            .iter()
            .map(|&(fx, fy, phase, amp)| amp * (fx * x as f64 + fy * y as f64 + phase).sin())
            .sum();
        (wave + 128.0).round().clamp(0.0, 255.0)
    }

    pub fn render(&self, gain: f64, offset: f64) -> RgbImage {
        RgbImage::from_fn(IMAGE_SIZE, IMAGE_SIZE, |x, y| {
            let base = self.level(x, y);
            let v = ((base - 128.0) * gain + 128.0 + offset).round().clamp(0.0, 255.0) as u8;
            Rgb([v, v, v])
        })
    }

    /// PNG bytes of one photometric variant (index wraps).
    pub fn photo(&self, variant: usize) -> Vec<u8> {
        let (gain, offset) = VARIANTS[variant % VARIANTS.len()];
        encode_png(&self.render(gain, offset))
    }
}

/// Normalizer framing every photo around [`face_region`].
pub fn normalizer() -> ImageNormalizer {
    ImageNormalizer::new(
        Arc::new(ScriptedDetector::single(face_region())),
        NormalizerParams::default(),
    )
}

/// Normalized patch of one subject variant.
pub fn patch(subject: &Subject, variant: usize) -> FacePatch {
    normalizer()
        .validate(&ImageInput::Encoded(&subject.photo(variant)))
        .unwrap()
}

/// PNG bytes of a featureless photo at the given intensity.
pub fn flat_photo(value: u8) -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, Rgb([value, value, value])))
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}
