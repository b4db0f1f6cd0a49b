use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Internal class handle for one enrolled identity. Assigned from 1 upward, never reused.
pub type Label = u32;

/// Axis-aligned face region in source image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw detector windows merged into this region (0 when not applicable).
    pub neighbors: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            neighbors: 0,
        }
    }

    /// Clip the region to an image of the given size.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn clip(&self, image_width: u32, image_height: u32) -> Option<FaceRegion> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(FaceRegion {
            width,
            height,
            ..*self
        })
    }
}

/// A fixed-size, single-channel, contrast-normalized face sample.
///
/// The unit of both training and prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPatch")]
pub struct FacePatch {
    size: u32,
    pixels: Vec<u8>,
}

#[derive(Deserialize)]
struct RawPatch {
    size: u32,
    pixels: Vec<u8>,
}

impl TryFrom<RawPatch> for FacePatch {
    type Error = String;

    fn try_from(raw: RawPatch) -> Result<Self, Self::Error> {
        let expected = raw.size as usize * raw.size as usize;
        if raw.size == 0 || raw.pixels.len() != expected {
            return Err(format!(
                "{}x{} patch carries {} pixels",
                raw.size,
                raw.size,
                raw.pixels.len()
            ));
        }
        Ok(Self {
            size: raw.size,
            pixels: raw.pixels,
        })
    }
}

impl FacePatch {
    /// Wrap a square grayscale image. Returns `None` for non-square input.
    pub fn from_gray(image: GrayImage) -> Option<Self> {
        if image.width() != image.height() || image.width() == 0 {
            return None;
        }
        Some(Self {
            size: image.width(),
            pixels: image.into_raw(),
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Row-major pixels, `size * size` bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels[(y * self.size + x) as usize]
    }

    pub fn to_gray(&self) -> GrayImage {
        GrayImage::from_fn(self.size, self.size, |x, y| image::Luma([self.pixel(x, y)]))
    }
}

/// Closest trained class for a probe patch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: Label,
    /// Histogram dissimilarity to the closest sample of `label`. Lower = more similar.
    pub distance: f64,
}
