//! Image decoding, face localization and patch normalization.
//!
//! Every patch goes through the same fixed pipeline:
//! crop → resize → grayscale → histogram equalization → 5×5 Gaussian blur.

use crate::detector::FaceDetector;
use crate::types::{FacePatch, FaceRegion};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_PATCH_SIZE: u32 = 200;
const DEFAULT_MIN_FACE_SIZE: u32 = 100;
const DEFAULT_MIN_LUMINANCE: f64 = 30.0;
const DEFAULT_MAX_LUMINANCE: f64 = 220.0;
const GAUSS_5: [u32; 5] = [1, 4, 6, 4, 1];

/// An incoming still image, in whatever form the caller holds it.
#[derive(Debug, Clone, Copy)]
pub enum ImageInput<'a> {
    /// Encoded file bytes (PNG, JPEG, ...).
    Encoded(&'a [u8]),
    /// Base64 text, optionally a `data:image/...;base64,` URL.
    Base64(&'a str),
    Decoded(&'a DynamicImage),
}

/// Why an image cannot produce a usable face patch.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ImageRejection {
    #[error("image could not be decoded: {message}")]
    Undecodable { message: String },
    #[error("no face detected")]
    NoFace,
    #[error("expected exactly one face, found {count}")]
    MultipleFaces { count: usize },
    #[error("face too small: {width}x{height} (minimum {min}x{min})")]
    FaceTooSmall { width: u32, height: u32, min: u32 },
    #[error("face too dark: mean luminance {mean:.1} below {min:.0}")]
    TooDark { mean: f64, min: f64 },
    #[error("face too bright: mean luminance {mean:.1} above {max:.0}")]
    TooBright { mean: f64, max: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizerParams {
    /// Edge length of the square output patch.
    pub patch_size: u32,
    pub min_face_size: u32,
    pub min_luminance: f64,
    pub max_luminance: f64,
}

impl Default for NormalizerParams {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            min_luminance: DEFAULT_MIN_LUMINANCE,
            max_luminance: DEFAULT_MAX_LUMINANCE,
        }
    }
}

/// Turns raw images into face patches. Stateless apart from its detector.
pub struct ImageNormalizer {
    detector: Arc<dyn FaceDetector>,
    params: NormalizerParams,
}

impl ImageNormalizer {
    pub fn new(detector: Arc<dyn FaceDetector>, params: NormalizerParams) -> Self {
        Self { detector, params }
    }

    pub fn params(&self) -> &NormalizerParams {
        &self.params
    }

    /// Exactly-one-face path with size and luminance gates.
    ///
    /// Used for enrollment candidates and verification probes.
    pub fn validate(&self, input: &ImageInput<'_>) -> Result<FacePatch, ImageRejection> {
        let rgb = decode(input)?;
        let gray = imageops::grayscale(&rgb);
        let regions = self.detector.detect(&gray);
        tracing::debug!(faces = regions.len(), "validate: faces detected");

        let region = match regions.as_slice() {
            [] => return Err(ImageRejection::NoFace),
            [only] => *only,
            many => return Err(ImageRejection::MultipleFaces { count: many.len() }),
        };
        let region = region
            .clip(rgb.width(), rgb.height())
            .ok_or(ImageRejection::NoFace)?;

        let min = self.params.min_face_size;
        if region.width < min || region.height < min {
            return Err(ImageRejection::FaceTooSmall {
                width: region.width,
                height: region.height,
                min,
            });
        }

        let mean = region_luminance(&gray, &region);
        tracing::debug!(
            width = region.width,
            height = region.height,
            luminance = mean,
            "validate: face region"
        );
        if mean < self.params.min_luminance {
            return Err(ImageRejection::TooDark {
                mean,
                min: self.params.min_luminance,
            });
        }
        if mean > self.params.max_luminance {
            return Err(ImageRejection::TooBright {
                mean,
                max: self.params.max_luminance,
            });
        }

        Ok(self.normalize(&rgb, &region))
    }

    /// Extraction-only path: first detected region, no quality gates.
    pub fn extract(&self, input: &ImageInput<'_>) -> Result<FacePatch, ImageRejection> {
        let rgb = decode(input)?;
        let gray = imageops::grayscale(&rgb);
        let region = self
            .detector
            .detect(&gray)
            .first()
            .and_then(|r| r.clip(rgb.width(), rgb.height()))
            .ok_or(ImageRejection::NoFace)?;
        Ok(self.normalize(&rgb, &region))
    }

    /// Decode and run the detector only (diagnostics).
    pub fn locate(&self, input: &ImageInput<'_>) -> Result<Vec<FaceRegion>, ImageRejection> {
        let rgb = decode(input)?;
        Ok(self.detector.detect(&imageops::grayscale(&rgb)))
    }

    fn normalize(&self, rgb: &RgbImage, region: &FaceRegion) -> FacePatch {
        let size = self.params.patch_size;
        let crop = imageops::crop_imm(rgb, region.x, region.y, region.width, region.height).to_image();
        let resized = if crop.dimensions() == (size, size) {
            crop
        } else {
            imageops::resize(&crop, size, size, FilterType::Triangle)
        };
        let mut gray = imageops::grayscale(&resized);
        equalize_histogram(&mut gray);
        let blurred = gaussian_blur_5x5(&gray);
        // Square by construction.
        FacePatch::from_gray(blurred).unwrap_or_else(|| unreachable!("patch is {size}x{size}"))
    }
}

/// Decode any supported input form into an RGB bitmap.
pub fn decode(input: &ImageInput<'_>) -> Result<RgbImage, ImageRejection> {
    let undecodable = |message: String| ImageRejection::Undecodable { message };
    match input {
        ImageInput::Encoded(bytes) => image::load_from_memory(bytes)
            .map(|img| img.to_rgb8())
            .map_err(|e| undecodable(e.to_string())),
        ImageInput::Base64(text) => {
            let text: &str = text;
            // Strip a data URL prefix ("data:image/png;base64,")
            let payload = match text.split_once(',') {
                Some((_, rest)) => rest,
                None => text,
            };
            let bytes = BASE64
                .decode(payload.trim())
                .map_err(|e| undecodable(format!("invalid base64: {e}")))?;
            image::load_from_memory(&bytes)
                .map(|img| img.to_rgb8())
                .map_err(|e| undecodable(e.to_string()))
        }
        ImageInput::Decoded(img) => Ok(img.to_rgb8()),
    }
}

fn region_luminance(gray: &GrayImage, region: &FaceRegion) -> f64 {
    let crop = imageops::crop_imm(gray, region.x, region.y, region.width, region.height).to_image();
    let pixels = crop.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    let total: u64 = pixels.iter().map(|&p| p as u64).sum();
    total as f64 / pixels.len() as f64
}

/// Spread the intensity distribution over the full 0–255 range in-place.
pub(crate) fn equalize_histogram(gray: &mut GrayImage) {
    let total = gray.as_raw().len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in gray.as_raw() {
        hist[p as usize] += 1;
    }

    let cdf_min = hist.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if cdf_min == total {
        // Single intensity, nothing to spread.
        return;
    }

    let denom = (total - cdf_min) as f64;
    let mut lut = [0u8; 256];
    let mut cdf = 0usize;
    for (value, &count) in hist.iter().enumerate() {
        cdf += count;
        let scaled = (cdf.saturating_sub(cdf_min) as f64 / denom * 255.0).round();
        lut[value] = scaled.clamp(0.0, 255.0) as u8;
    }

    for p in gray.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Reflect an out-of-range index back into `0..n` without repeating the edge pixel.
fn reflect_101(i: i64, n: i64) -> usize {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as usize
}

/// Separable binomial 5×5 blur (σ ≈ 1.1).
pub(crate) fn gaussian_blur_5x5(src: &GrayImage) -> GrayImage {
    let (w, h) = (src.width() as usize, src.height() as usize);
    let raw = src.as_raw();
    let mut horizontal = vec![0u32; w * h];

    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, &weight) in GAUSS_5.iter().enumerate() {
                let sx = reflect_101(x as i64 + k as i64 - 2, w as i64);
                acc += weight * raw[y * w + sx] as u32;
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, &weight) in GAUSS_5.iter().enumerate() {
                let sy = reflect_101(y as i64 + k as i64 - 2, h as i64);
                acc += weight * horizontal[sy * w + x];
            }
            out[y * w + x] = ((acc + 128) / 256).min(255) as u8;
        }
    }

    GrayImage::from_raw(src.width(), src.height(), out)
        .unwrap_or_else(|| unreachable!("buffer sized to {w}x{h}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, ScriptedDetector, Subject};
    use image::Luma;

    fn normalizer(detector: ScriptedDetector) -> ImageNormalizer {
        ImageNormalizer::new(Arc::new(detector), NormalizerParams::default())
    }

    #[test]
    fn test_equalize_spreads_narrow_range() {
        let mut img = GrayImage::from_fn(16, 16, |x, _| Luma([100 + (x % 8) as u8]));
        equalize_histogram(&mut img);
        let min = *img.as_raw().iter().min().unwrap();
        let max = *img.as_raw().iter().max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn test_equalize_preserves_order() {
        let mut img = GrayImage::from_fn(10, 1, |x, _| Luma([50 + x as u8 * 3]));
        equalize_histogram(&mut img);
        let raw = img.as_raw();
        assert!(raw.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_equalize_uniform_is_noop() {
        let mut img = GrayImage::from_pixel(8, 8, Luma([77]));
        equalize_histogram(&mut img);
        assert!(img.as_raw().iter().all(|&p| p == 77));
    }

    #[test]
    fn test_blur_uniform_stays_uniform() {
        let img = GrayImage::from_pixel(12, 9, Luma([140]));
        let out = gaussian_blur_5x5(&img);
        assert!(out.as_raw().iter().all(|&p| p == 140));
    }

    #[test]
    fn test_blur_softens_impulse() {
        let mut img = GrayImage::new(9, 9);
        img.put_pixel(4, 4, Luma([255]));
        let out = gaussian_blur_5x5(&img);
        // Centre weight 36/256
        assert_eq!(out.get_pixel(4, 4).0[0], 36);
        assert!(out.get_pixel(3, 4).0[0] > 0);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(6, 5), 2);
        assert_eq!(reflect_101(3, 1), 0);
    }

    #[test]
    fn test_validate_produces_canonical_patch() {
        let n = normalizer(ScriptedDetector::single(testing::face_region()));
        let photo = Subject::new(1).photo(0);
        let patch = n.validate(&ImageInput::Encoded(&photo)).unwrap();
        assert_eq!(patch.size(), 200);
        assert_eq!(patch.pixels().len(), 200 * 200);
    }

    #[test]
    fn test_monotone_lighting_change_normalizes_away() {
        let subject = Subject::new(5);
        assert_eq!(testing::patch(&subject, 0), testing::patch(&subject, 5));
        assert_ne!(testing::patch(&subject, 0), testing::patch(&Subject::new(6), 0));
    }

    #[test]
    fn test_validate_undecodable() {
        let n = normalizer(ScriptedDetector::single(testing::face_region()));
        let result = n.validate(&ImageInput::Encoded(b"definitely not an image"));
        assert!(matches!(result, Err(ImageRejection::Undecodable { .. })));
    }

    #[test]
    fn test_validate_no_face() {
        let n = normalizer(ScriptedDetector::new(vec![]));
        let photo = Subject::new(1).photo(0);
        assert_eq!(n.validate(&ImageInput::Encoded(&photo)), Err(ImageRejection::NoFace));
    }

    #[test]
    fn test_validate_multiple_faces() {
        let n = normalizer(ScriptedDetector::new(vec![
            FaceRegion::new(0, 0, 110, 110),
            FaceRegion::new(120, 120, 110, 110),
        ]));
        let photo = Subject::new(1).photo(0);
        assert_eq!(
            n.validate(&ImageInput::Encoded(&photo)),
            Err(ImageRejection::MultipleFaces { count: 2 })
        );
    }

    #[test]
    fn test_validate_face_too_small() {
        let n = normalizer(ScriptedDetector::single(FaceRegion::new(10, 10, 90, 120)));
        let photo = Subject::new(1).photo(0);
        assert_eq!(
            n.validate(&ImageInput::Encoded(&photo)),
            Err(ImageRejection::FaceTooSmall { width: 90, height: 120, min: 100 })
        );
    }

    #[test]
    fn test_validate_too_dark_and_too_bright() {
        let n = normalizer(ScriptedDetector::single(testing::face_region()));
        let dark = testing::flat_photo(10);
        assert!(matches!(
            n.validate(&ImageInput::Encoded(&dark)),
            Err(ImageRejection::TooDark { .. })
        ));
        let bright = testing::flat_photo(240);
        assert!(matches!(
            n.validate(&ImageInput::Encoded(&bright)),
            Err(ImageRejection::TooBright { .. })
        ));
    }

    #[test]
    fn test_extract_takes_first_region_without_gates() {
        let n = normalizer(ScriptedDetector::new(vec![
            FaceRegion::new(0, 0, 50, 50),
            FaceRegion::new(100, 100, 50, 50),
        ]));
        let dark = testing::flat_photo(10);
        let patch = n.extract(&ImageInput::Encoded(&dark)).unwrap();
        assert_eq!(patch.size(), 200);
    }

    #[test]
    fn test_base64_data_url_decodes() {
        let photo = Subject::new(3).photo(1);
        let url = format!("data:image/png;base64,{}", BASE64.encode(&photo));
        let rgb = decode(&ImageInput::Base64(&url)).unwrap();
        assert_eq!(rgb.dimensions(), (testing::IMAGE_SIZE, testing::IMAGE_SIZE));

        let bare = BASE64.encode(&photo);
        assert!(decode(&ImageInput::Base64(&bare)).is_ok());
        assert!(matches!(
            decode(&ImageInput::Base64("@@@not base64@@@")),
            Err(ImageRejection::Undecodable { .. })
        ));
    }

    #[test]
    fn test_region_clipped_to_image() {
        let n = normalizer(ScriptedDetector::single(FaceRegion::new(100, 100, 500, 500)));
        let photo = Subject::new(2).photo(0);
        // 140x140 remains inside the 240x240 photo
        assert!(n.validate(&ImageInput::Encoded(&photo)).is_ok());
    }
}
