//! Local Binary Pattern Histogram (LBPH) appearance model.
//!
//! Each patch is summarized by circular LBP codes pooled into a grid of
//! per-cell histograms. Training appends signatures, so the model extends
//! incrementally without revisiting earlier patches.

use crate::types::{FacePatch, Label, Prediction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::f64::consts::TAU;
use std::sync::Arc;

const DEFAULT_RADIUS: u32 = 1;
const DEFAULT_NEIGHBORS: u32 = 8;
const DEFAULT_GRID: u32 = 8;
/// Pixels are integral, so anything closer than this is an interpolation round-off tie.
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    /// Sampling points on the circle; the code space is `2^neighbors`.
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_RADIUS,
            neighbors: DEFAULT_NEIGHBORS,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
        }
    }
}

impl LbphParams {
    pub fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    pub fn signature_len(&self) -> usize {
        self.bins() * (self.grid_x * self.grid_y) as usize
    }
}

/// One trained patch signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub label: Label,
    pub histogram: Vec<f32>,
}

/// Signatures are shared, so cloning a model copies pointers only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbphModel {
    params: LbphParams,
    samples: Vec<Arc<Sample>>,
}

impl LbphModel {
    /// Initial training pass.
    pub fn train<'a, I>(params: LbphParams, samples: I) -> Self
    where
        I: IntoIterator<Item = (&'a FacePatch, Label)>,
    {
        let mut model = Self {
            params,
            samples: Vec::new(),
        };
        model.update(samples);
        model
    }

    /// Incremental update; existing signatures are left untouched.
    pub fn update<'a, I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = (&'a FacePatch, Label)>,
    {
        let before = self.samples.len();
        for (patch, label) in samples {
            let histogram = signature(&self.params, patch);
            self.samples.push(Arc::new(Sample { label, histogram }));
        }
        tracing::debug!(
            added = self.samples.len() - before,
            total = self.samples.len(),
            "LBPH model updated"
        );
    }

    /// Closest label and its minimum sample distance.
    ///
    /// Visits every sample; ties resolve to the lower label.
    pub fn predict(&self, patch: &FacePatch) -> Option<Prediction> {
        let probe = signature(&self.params, patch);
        let mut best: Option<Prediction> = None;

        for sample in &self.samples {
            if sample.histogram.len() != probe.len() {
                continue;
            }
            let distance = chi_square(&sample.histogram, &probe);
            let better = match best {
                None => true,
                Some(b) => distance < b.distance || (distance == b.distance && sample.label < b.label),
            };
            if better {
                best = Some(Prediction {
                    label: sample.label,
                    distance,
                });
            }
        }

        best
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn labels(&self) -> BTreeSet<Label> {
        self.samples.iter().map(|s| s.label).collect()
    }
}

/// Circular LBP codes with bilinear neighbor sampling.
///
/// Output covers the patch minus a `radius` border: `(size - 2r)^2` codes.
fn lbp_codes(params: &LbphParams, patch: &FacePatch) -> (Vec<u32>, usize, usize) {
    let size = patch.size() as usize;
    let r = params.radius as usize;
    if size <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let out_w = size - 2 * r;
    let out_h = size - 2 * r;
    let mut codes = vec![0u32; out_w * out_h];
    let px = |x: usize, y: usize| patch.pixel(x as u32, y as u32) as f64;

    for n in 0..params.neighbors {
        let angle = TAU * n as f64 / params.neighbors as f64;
        let sx = params.radius as f64 * angle.cos();
        let sy = -(params.radius as f64) * angle.sin();

        let (fx, fy) = (sx.floor(), sy.floor());
        let (cx, cy) = (sx.ceil(), sy.ceil());
        let (tx, ty) = (sx - fx, sy - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let (fx, fy, cx, cy) = (fx as i64, fy as i64, cx as i64, cy as i64);

        for y in r..size - r {
            for x in r..size - r {
                let at = |dx: i64, dy: i64| px((x as i64 + dx) as usize, (y as i64 + dy) as usize);
                let t = w1 * at(fx, fy) + w2 * at(cx, fy) + w3 * at(fx, cy) + w4 * at(cx, cy);
                let center = px(x, y);
                if t > center || (t - center).abs() < TIE_EPSILON {
                    codes[(y - r) * out_w + (x - r)] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Grid of per-cell code histograms, each normalized to sum 1.
pub fn signature(params: &LbphParams, patch: &FacePatch) -> Vec<f32> {
    let (codes, w, h) = lbp_codes(params, patch);
    let bins = params.bins();
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let mut histogram = vec![0f32; params.signature_len()];

    let cell_w = w / gx;
    let cell_h = h / gy;
    if cell_w == 0 || cell_h == 0 {
        return histogram;
    }
    let cell_pixels = (cell_w * cell_h) as f32;

    for row in 0..gy {
        for col in 0..gx {
            let cell = &mut histogram[(row * gx + col) * bins..(row * gx + col + 1) * bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    cell[codes[y * w + x] as usize] += 1.0;
                }
            }
            for v in cell.iter_mut() {
                *v /= cell_pixels;
            }
        }
    }

    histogram
}

/// Symmetric chi-square distance, `Σ 2(a−b)² / (a+b)`.
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&a, &b)| {
            let (a, b) = (a as f64, b as f64);
            let sum = a + b;
            if sum > 0.0 {
                2.0 * (a - b) * (a - b) / sum
            } else {
                0.0
            }
        })
        .sum()
}
