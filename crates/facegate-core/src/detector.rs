//! Boosted Haar-cascade face detector.
//!
//! Evaluates a stage cascade of Haar-like rectangle features over an integral
//! image with a multi-scale sliding window, then merges overlapping window hits
//! into face regions by neighbor grouping.

use crate::types::FaceRegion;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

mod opencv;

// --- Named constants (scan defaults match the classic frontal-face setup) ---
const DEFAULT_SCALE_FACTOR: f32 = 1.1;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const DEFAULT_MIN_SIZE: u32 = 100;
const GROUP_EPS: f32 = 0.2;
/// Windows flatter than this (intensity std-dev) carry no texture to classify.
const MIN_WINDOW_STDDEV: f64 = 1.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0} (set cascade_path or FACEGATE_CASCADE_PATH)")]
    ModelNotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cascade: {0}")]
    InvalidCascade(String),
    #[error("invalid scan parameters: {0}")]
    InvalidParams(String),
}

/// Pluggable face localization backend.
pub trait FaceDetector: Send + Sync {
    /// Detect face-like regions in a grayscale image, strongest first.
    fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion>;
}

/// One weighted rectangle of a Haar-like feature, in base-window coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Decision stump over one Haar-like feature.
///
/// The feature value is the weighted sum of rectangle pixel sums divided by
/// `window_area * stddev` of the window, as OpenCV evaluates it. Values below
/// `threshold` vote `left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<WeightedRect>,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A trained detection cascade, stored as JSON or imported from OpenCV XML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

impl Cascade {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(DetectorError::InvalidCascade("window size must be non-zero".into()));
        }
        if self.stages.is_empty() {
            return Err(DetectorError::InvalidCascade("cascade has no stages".into()));
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(DetectorError::InvalidCascade(format!("stage {s} has no classifiers")));
            }
            for weak in &stage.classifiers {
                if weak.rects.is_empty() {
                    return Err(DetectorError::InvalidCascade(format!(
                        "stage {s} has a feature without rectangles"
                    )));
                }
                for r in &weak.rects {
                    if r.width == 0
                        || r.height == 0
                        || r.x + r.width > self.window_width
                        || r.y + r.height > self.window_height
                    {
                        return Err(DetectorError::InvalidCascade(format!(
                            "stage {s}: rectangle ({}, {}, {}x{}) outside {}x{} window",
                            r.x, r.y, r.width, r.height, self.window_width, self.window_height
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    /// Window growth per pyramid level; must be > 1.
    pub scale_factor: f32,
    /// A merged region needs more than this many raw hits to survive.
    pub min_neighbors: u32,
    /// Smallest window edge, in pixels.
    pub min_size: u32,
    pub max_size: Option<u32>,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: DEFAULT_MIN_SIZE,
            max_size: None,
        }
    }
}

/// Cascade-based face detector.
pub struct CascadeDetector {
    cascade: Cascade,
    params: ScanParams,
}

impl CascadeDetector {
    pub fn new(cascade: Cascade, params: ScanParams) -> Result<Self, DetectorError> {
        cascade.validate()?;
        if params.scale_factor.is_nan() || params.scale_factor <= 1.0 {
            return Err(DetectorError::InvalidParams(format!(
                "scale_factor must be > 1.0, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    /// Load a cascade from `path`: OpenCV XML for `.xml` files, JSON otherwise.
    pub fn load(path: &Path, params: ScanParams) -> Result<Self, DetectorError> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(shown));
        }
        let raw = std::fs::read(path).map_err(|source| DetectorError::Read {
            path: shown.clone(),
            source,
        })?;
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        let cascade = if is_xml {
            let text = std::str::from_utf8(&raw)
                .map_err(|e| DetectorError::InvalidCascade(format!("{shown}: {e}")))?;
            opencv::parse(text).map_err(|e| match e {
                DetectorError::InvalidCascade(msg) => {
                    DetectorError::InvalidCascade(format!("{shown}: {msg}"))
                }
                other => other,
            })?
        } else {
            serde_json::from_slice(&raw)
                .map_err(|e| DetectorError::InvalidCascade(format!("{shown}: {e}")))?
        };

        tracing::info!(
            path = %shown,
            format = if is_xml { "opencv-xml" } else { "json" },
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            "loaded face cascade"
        );

        Self::new(cascade, params)
    }

    /// Run the raw sliding-window scan without grouping.
    fn scan(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        let base_w = self.cascade.window_width as f32;
        let base_h = self.cascade.window_height as f32;
        let min_size = self.params.min_size as f32;

        let integral = IntegralImage::new(gray);
        let mut hits = Vec::new();
        let mut scale = (min_size / base_w).max(min_size / base_h).max(1.0);

        loop {
            let win_w = (base_w * scale).round() as u32;
            let win_h = (base_h * scale).round() as u32;
            if win_w > width || win_h > height {
                break;
            }
            if let Some(max) = self.params.max_size {
                if win_w > max || win_h > max {
                    break;
                }
            }

            let step = (scale.round() as u32).max(1);
            let mut y = 0;
            while y + win_h <= height {
                let mut x = 0;
                while x + win_w <= width {
                    if self.evaluate(&integral, x, y, win_w, win_h, scale) {
                        hits.push(FaceRegion::new(x, y, win_w, win_h));
                    }
                    x += step;
                }
                y += step;
            }

            scale *= self.params.scale_factor;
        }

        hits
    }

    /// Run every cascade stage on one window; `true` when all stages pass.
    fn evaluate(
        &self,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        win_w: u32,
        win_h: u32,
        scale: f32,
    ) -> bool {
        let area = (win_w as u64 * win_h as u64) as f64;
        let mean = integral.sum(x, y, win_w, win_h) as f64 / area;
        let variance = integral.sq_sum(x, y, win_w, win_h) as f64 / area - mean * mean;
        if variance <= MIN_WINDOW_STDDEV * MIN_WINDOW_STDDEV {
            return false;
        }
        let stddev = variance.sqrt();

        for stage in &self.cascade.stages {
            let mut total = 0.0f32;
            for weak in &stage.classifiers {
                let mut feature = 0.0f64;
                for r in &weak.rects {
                    let (rx, ry, rw, rh) = scale_rect(r, scale, win_w, win_h);
                    feature += r.weight as f64 * integral.sum(x + rx, y + ry, rw, rh) as f64;
                }
                let value = feature / (area * stddev);
                total += if value < weak.threshold as f64 {
                    weak.left
                } else {
                    weak.right
                };
            }
            if total < stage.threshold {
                return false;
            }
        }
        true
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let hits = self.scan(gray);
        let regions = group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(
            width = gray.width(),
            height = gray.height(),
            raw_hits = hits.len(),
            regions = regions.len(),
            "cascade scan complete"
        );
        regions
    }
}

/// Map a base-window rectangle into a scaled window, keeping it inside the window.
fn scale_rect(r: &WeightedRect, scale: f32, win_w: u32, win_h: u32) -> (u32, u32, u32, u32) {
    let rx = ((r.x as f32 * scale).round() as u32).min(win_w - 1);
    let ry = ((r.y as f32 * scale).round() as u32).min(win_h - 1);
    let rw = ((r.width as f32 * scale).round() as u32).max(1).min(win_w - rx);
    let rh = ((r.height as f32 * scale).round() as u32).max(1).min(win_h - ry);
    (rx, ry, rw, rh)
}

/// Summed-area tables of intensities and squared intensities.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let w = gray.width() as usize;
        let h = gray.height() as usize;
        let stride = w + 1;
        let raw = gray.as_raw();
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let top_left = table[y0 * stride + x0];
        let top_right = table[y0 * stride + x1];
        let bottom_left = table[y1 * stride + x0];
        let bottom_right = table[y1 * stride + x1];
        (bottom_right - top_right) - (bottom_left - top_left)
    }
}

/// Two hits belong to the same face when every edge lies within `eps` of the
/// smaller rectangle's mean side.
fn similar(a: &FaceRegion, b: &FaceRegion, eps: f32) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f32 * 0.5;
    let close = |p: u32, q: u32| (p as f32 - q as f32).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Merge raw window hits into averaged regions.
///
/// Clusters with `min_neighbors` or fewer members are dropped, as are clusters
/// nested inside a clearly stronger one. Output is sorted strongest first,
/// then top-to-bottom, left-to-right.
fn group_rectangles(hits: &[FaceRegion], min_neighbors: u32, eps: f32) -> Vec<FaceRegion> {
    let n = hits.len();
    let mut parent: Vec<usize> = (0..n).collect();

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&hits[i], &hits[j], eps) {
                let a = find_root(&mut parent, i);
                let b = find_root(&mut parent, j);
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    // root -> (sum x, sum y, sum w, sum h, count)
    let mut clusters: BTreeMap<usize, (u64, u64, u64, u64, u32)> = BTreeMap::new();
    for (i, hit) in hits.iter().enumerate() {
        let root = find_root(&mut parent, i);
        let entry = clusters.entry(root).or_insert((0, 0, 0, 0, 0));
        entry.0 += hit.x as u64;
        entry.1 += hit.y as u64;
        entry.2 += hit.width as u64;
        entry.3 += hit.height as u64;
        entry.4 += 1;
    }

    let candidates: Vec<FaceRegion> = clusters
        .values()
        .filter(|c| c.4 > min_neighbors)
        .map(|&(sx, sy, sw, sh, count)| {
            let avg = |v: u64| ((v as f64) / count as f64).round() as u32;
            FaceRegion {
                x: avg(sx),
                y: avg(sy),
                width: avg(sw),
                height: avg(sh),
                neighbors: count,
            }
        })
        .collect();

    let mut kept: Vec<FaceRegion> = candidates
        .iter()
        .enumerate()
        .filter(|(i, inner)| {
            !candidates.iter().enumerate().any(|(j, outer)| {
                j != *i && outer.neighbors > inner.neighbors.max(3) && nested_in(inner, outer, eps)
            })
        })
        .map(|(_, r)| *r)
        .collect();

    kept.sort_by(|a, b| {
        b.neighbors
            .cmp(&a.neighbors)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    kept
}

fn nested_in(inner: &FaceRegion, outer: &FaceRegion, eps: f32) -> bool {
    let dx = (outer.width as f32 * eps).round() as i64;
    let dy = (outer.height as f32 * eps).round() as i64;
    let (ix, iy) = (inner.x as i64, inner.y as i64);
    let (ox, oy) = (outer.x as i64, outer.y as i64);
    ix >= ox - dx
        && iy >= oy - dy
        && ix + inner.width as i64 <= ox + outer.width as i64 + dx
        && iy + inner.height as i64 <= oy + outer.height as i64 + dy
}
