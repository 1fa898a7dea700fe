//! One iteration of the frame loop: detect, recognize every face, update
//! liveness from the primary face. Nothing here commits attendance.

use crate::detector::EyeDetector;
use crate::liveness::{LivenessDetector, LivenessState};
use crate::recognizer::FaceRecognizer;
use crate::types::{BoundingBox, FaceMatch};
use image::GrayImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub bbox: BoundingBox,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub confidence: u8,
}

impl FaceResult {
    fn new(bbox: BoundingBox, m: FaceMatch) -> Self {
        Self {
            bbox,
            identity_id: m.identity_id,
            display_name: m.display_name,
            confidence: m.confidence,
        }
    }

    pub fn as_match(&self) -> FaceMatch {
        FaceMatch {
            identity_id: self.identity_id.clone(),
            display_name: self.display_name.clone(),
            confidence: self.confidence,
        }
    }
}

/// Per-frame output published to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub faces: Vec<FaceResult>,
    pub liveness: LivenessState,
}

impl FrameResult {
    /// First face that matched an enrolled identity.
    pub fn recognized(&self) -> Option<&FaceResult> {
        self.faces.iter().find(|f| f.identity_id.is_some())
    }
}

/// The subject liveness is judged on: the largest face in view.
pub fn primary_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().max_by(|a, b| {
        a.area()
            .partial_cmp(&b.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

pub fn process_frame(
    sequence: u64,
    image: &GrayImage,
    recognizer: &FaceRecognizer,
    eyes: &mut dyn EyeDetector,
    liveness: &mut LivenessDetector,
) -> FrameResult {
    let boxes = recognizer.detect(image);
    let liveness_state = liveness.observe_face(image, primary_face(&boxes), eyes);

    let faces: Vec<FaceResult> = boxes
        .into_iter()
        .map(|bbox| {
            let m = recognizer.recognize(image, &bbox);
            FaceResult::new(bbox, m)
        })
        .collect();

    if !faces.is_empty() {
        tracing::debug!(
            sequence,
            faces = faces.len(),
            blinks = liveness_state.blink_count,
            "frame processed"
        );
    }
    FrameResult {
        sequence,
        width: image.width(),
        height: image.height(),
        faces,
        liveness: liveness_state,
    }
}
