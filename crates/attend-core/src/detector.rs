//! Face detection seam and the two-stage detection strategy.
//!
//! Backends only turn an image into candidate boxes. [`FaceDetector`] owns the
//! policy: a strict pass first, and if that finds nothing a relaxed pass over a
//! histogram-equalized copy of the frame. Detection never fails; backend errors
//! are logged and treated as "no faces".

use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-pass detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    pub confidence_threshold: f32,
    /// Boxes narrower or shorter than this (pixels) are dropped.
    pub min_face_size: u32,
    pub nms_threshold: f32,
}

impl DetectParams {
    pub fn strict() -> Self {
        Self {
            confidence_threshold: 0.5,
            min_face_size: 80,
            nms_threshold: 0.4,
        }
    }

    pub fn relaxed() -> Self {
        Self {
            confidence_threshold: 0.35,
            min_face_size: 30,
            nms_threshold: 0.4,
        }
    }
}

/// A pluggable face detector (cascade-like or ML object detector).
pub trait DetectorBackend: Send {
    fn detect(
        &mut self,
        image: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Counts visible (open) eyes inside a detected face.
pub trait EyeDetector: Send {
    fn count_eyes(&mut self, image: &GrayImage, face: &BoundingBox) -> usize;
}

/// Two-stage face detector over any [`DetectorBackend`].
pub struct FaceDetector {
    backend: Box<dyn DetectorBackend>,
    strict: DetectParams,
    relaxed: DetectParams,
}

impl FaceDetector {
    pub fn new(backend: Box<dyn DetectorBackend>) -> Self {
        Self::with_params(backend, DetectParams::strict(), DetectParams::relaxed())
    }

    pub fn with_params(
        backend: Box<dyn DetectorBackend>,
        strict: DetectParams,
        relaxed: DetectParams,
    ) -> Self {
        Self {
            backend,
            strict,
            relaxed,
        }
    }

    /// Detect faces, best first. Returns an empty list when nothing is found.
    pub fn detect(&mut self, image: &GrayImage) -> Vec<BoundingBox> {
        let faces = self.run_pass(image, self.strict);
        if !faces.is_empty() {
            return faces;
        }

        let normalized = imageproc::contrast::equalize_histogram(image);
        let faces = self.run_pass(&normalized, self.relaxed);
        if !faces.is_empty() {
            tracing::debug!(count = faces.len(), "faces found on relaxed pass");
        }
        faces
    }

    fn run_pass(&mut self, image: &GrayImage, params: DetectParams) -> Vec<BoundingBox> {
        let raw = match self.backend.detect(image, &params) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; treating frame as empty");
                return Vec::new();
            }
        };

        let min = params.min_face_size as f32;
        let candidates: Vec<BoundingBox> = raw
            .into_iter()
            .filter(|b| {
                b.confidence >= params.confidence_threshold && b.width >= min && b.height >= min
            })
            .collect();

        nms(candidates, params.nms_threshold)
    }
}

/// Non-Maximum Suppression: keep the most confident of each overlapping group.
/// Output is sorted by descending confidence.
pub(crate) fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
pub(crate) fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
