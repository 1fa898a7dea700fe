//! Trainable face matcher seam and the built-in LBPH-style matcher.
//!
//! [`LbphMatcher`] stores one spatial local-binary-pattern histogram per
//! training sample and predicts by nearest neighbour under the alternative
//! chi-square distance (identical samples → 0, disjoint cells → 4 per cell).

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("no training samples")]
    Empty,
    #[error("{samples} samples but {labels} labels")]
    LengthMismatch { samples: usize, labels: usize },
    #[error("sample is {width}x{height}, too small for LBP")]
    SampleTooSmall { width: u32, height: u32 },
    #[error("update before initial train")]
    NotTrained,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("model encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// A trainable `(label, distance)` face matcher.
///
/// `update` adds classes without discarding existing ones; `train` starts over.
pub trait MatcherBackend: Send + Sync {
    fn train(&mut self, samples: &[GrayImage], labels: &[u32]) -> Result<(), MatcherError>;
    fn update(&mut self, samples: &[GrayImage], labels: &[u32]) -> Result<(), MatcherError>;
    /// Best `(label, distance)`; `None` when the matcher holds no samples.
    fn predict(&self, sample: &GrayImage) -> Option<(u32, f64)>;
    fn is_trained(&self) -> bool;
    fn labels(&self) -> BTreeSet<u32>;
    fn write(&self, path: &Path) -> Result<(), MatcherError>;
    fn read(&mut self, path: &Path) -> Result<(), MatcherError>;
    /// Independent copy, used to build the next model generation.
    fn snapshot(&self) -> Box<dyn MatcherBackend>;
}

const LBP_BINS: usize = 256;
/// Ring offsets for radius 1, 8 neighbours, clockwise from top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphMatcher {
    grid_x: u32,
    grid_y: u32,
    histograms: Vec<Vec<f32>>,
    labels: Vec<u32>,
}

impl Default for LbphMatcher {
    fn default() -> Self {
        Self::new(8, 8)
    }
}

impl LbphMatcher {
    pub fn new(grid_x: u32, grid_y: u32) -> Self {
        Self {
            grid_x: grid_x.max(1),
            grid_y: grid_y.max(1),
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    fn spatial_histogram(&self, sample: &GrayImage) -> Result<Vec<f32>, MatcherError> {
        let (w, h) = sample.dimensions();
        if w < 3 || h < 3 {
            return Err(MatcherError::SampleTooSmall {
                width: w,
                height: h,
            });
        }
        let codes = lbp_codes(sample);
        let (lw, lh) = (w - 2, h - 2);

        let (gx, gy) = (self.grid_x, self.grid_y);
        let mut hist = vec![0.0f32; (gx * gy) as usize * LBP_BINS];
        for cy in 0..gy {
            let (y0, y1) = (cy * lh / gy, (cy + 1) * lh / gy);
            for cx in 0..gx {
                let (x0, x1) = (cx * lw / gx, (cx + 1) * lw / gx);
                let cell_pixels = ((y1 - y0) * (x1 - x0)) as f32;
                if cell_pixels == 0.0 {
                    continue;
                }
                let base = (cy * gx + cx) as usize * LBP_BINS;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let code = codes[(y * lw + x) as usize] as usize;
                        hist[base + code] += 1.0;
                    }
                }
                for bin in &mut hist[base..base + LBP_BINS] {
                    *bin /= cell_pixels;
                }
            }
        }
        Ok(hist)
    }

    fn histograms_for(
        &self,
        samples: &[GrayImage],
        labels: &[u32],
    ) -> Result<Vec<Vec<f32>>, MatcherError> {
        if samples.is_empty() {
            return Err(MatcherError::Empty);
        }
        if samples.len() != labels.len() {
            return Err(MatcherError::LengthMismatch {
                samples: samples.len(),
                labels: labels.len(),
            });
        }
        samples.iter().map(|s| self.spatial_histogram(s)).collect()
    }
}

impl MatcherBackend for LbphMatcher {
    fn train(&mut self, samples: &[GrayImage], labels: &[u32]) -> Result<(), MatcherError> {
        let hists = self.histograms_for(samples, labels)?;
        self.histograms = hists;
        self.labels = labels.to_vec();
        Ok(())
    }

    fn update(&mut self, samples: &[GrayImage], labels: &[u32]) -> Result<(), MatcherError> {
        if !self.is_trained() {
            return Err(MatcherError::NotTrained);
        }
        let hists = self.histograms_for(samples, labels)?;
        self.histograms.extend(hists);
        self.labels.extend_from_slice(labels);
        Ok(())
    }

    fn predict(&self, sample: &GrayImage) -> Option<(u32, f64)> {
        let query = self.spatial_histogram(sample).ok()?;
        self.histograms
            .iter()
            .zip(&self.labels)
            .map(|(h, &label)| (label, chi_square_alt(&query, h)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn is_trained(&self) -> bool {
        !self.histograms.is_empty()
    }

    fn labels(&self) -> BTreeSet<u32> {
        self.labels.iter().copied().collect()
    }

    fn write(&self, path: &Path) -> Result<(), MatcherError> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn read(&mut self, path: &Path) -> Result<(), MatcherError> {
        let bytes = std::fs::read(path)?;
        *self = bincode::deserialize(&bytes)?;
        Ok(())
    }

    fn snapshot(&self) -> Box<dyn MatcherBackend> {
        Box::new(self.clone())
    }
}

/// Radius-1, 8-neighbour LBP codes of the interior pixels, row-major,
/// `(w - 2) x (h - 2)`.
fn lbp_codes(img: &GrayImage) -> Vec<u8> {
    let (w, h) = img.dimensions();
    let mut codes = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let centre = img.get_pixel(x, y).0[0];
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                if img.get_pixel(nx, ny).0[0] >= centre {
                    code |= 1 << bit;
                }
            }
            codes.push(code);
        }
    }
    codes
}

fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > 0.0 {
                let d = (x - y) as f64;
                2.0 * d * d / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Deterministic pseudo-random texture in 40..200.
    fn texture(seed: u32, size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let mut v = x.wrapping_mul(7919) ^ y.wrapping_mul(104_729) ^ seed.wrapping_mul(31_337);
            v ^= v >> 13;
            v = v.wrapping_mul(0x5bd1_e995);
            v ^= v >> 15;
            Luma([40 + (v % 160) as u8])
        })
    }

    fn gradient(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| Luma([((x + y) * 255 / (2 * size)) as u8]))
    }

    #[test]
    fn test_lbp_uniform_image_all_ones() {
        let img = GrayImage::from_pixel(5, 5, Luma([77]));
        let codes = lbp_codes(&img);
        assert_eq!(codes.len(), 9);
        assert!(codes.iter().all(|&c| c == 255));
    }

    #[test]
    fn test_identical_sample_has_zero_distance() {
        let mut m = LbphMatcher::default();
        m.train(&[texture(1, 100)], &[0]).unwrap();
        let (label, dist) = m.predict(&texture(1, 100)).unwrap();
        assert_eq!(label, 0);
        assert!(dist.abs() < 1e-9, "dist = {dist}");
    }

    #[test]
    fn test_nearest_label_wins() {
        let mut m = LbphMatcher::default();
        m.train(&[texture(1, 100), gradient(100)], &[0, 1]).unwrap();
        assert_eq!(m.predict(&gradient(100)).unwrap().0, 1);
        assert_eq!(m.predict(&texture(1, 100)).unwrap().0, 0);
    }

    #[test]
    fn test_unrelated_texture_is_far() {
        let mut m = LbphMatcher::default();
        m.train(&[gradient(100)], &[0]).unwrap();
        let (_, dist) = m.predict(&texture(9, 100)).unwrap();
        assert!(dist > 80.0, "dist = {dist}");
    }

    #[test]
    fn test_update_keeps_existing_classes() {
        let mut m = LbphMatcher::default();
        m.train(&[texture(1, 100)], &[0]).unwrap();
        m.update(&[texture(2, 100)], &[1]).unwrap();
        assert_eq!(m.labels(), BTreeSet::from([0, 1]));
        assert_eq!(m.predict(&texture(1, 100)).unwrap().0, 0);
        assert_eq!(m.predict(&texture(2, 100)).unwrap().0, 1);
    }

    #[test]
    fn test_update_requires_training() {
        let mut m = LbphMatcher::default();
        assert!(matches!(
            m.update(&[texture(1, 100)], &[0]),
            Err(MatcherError::NotTrained)
        ));
    }

    #[test]
    fn test_train_rejects_mismatched_labels() {
        let mut m = LbphMatcher::default();
        assert!(matches!(
            m.train(&[texture(1, 100)], &[0, 1]),
            Err(MatcherError::LengthMismatch { .. })
        ));
        assert!(matches!(m.train(&[], &[]), Err(MatcherError::Empty)));
    }

    #[test]
    fn test_untrained_predict_is_none() {
        assert!(LbphMatcher::default().predict(&texture(1, 100)).is_none());
    }

    #[test]
    fn test_write_read_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let mut m = LbphMatcher::default();
        m.train(&[texture(1, 100), texture(2, 100)], &[4, 7]).unwrap();
        m.write(&path).unwrap();

        let mut loaded = LbphMatcher::default();
        loaded.read(&path).unwrap();
        assert_eq!(loaded.sample_count(), 2);
        assert_eq!(loaded.predict(&texture(2, 100)).unwrap().0, 7);
    }
}
