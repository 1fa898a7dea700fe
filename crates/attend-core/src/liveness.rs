//! Blink-counting liveness over a stream of frames.

use crate::config::LivenessConfig;
use crate::detector::EyeDetector;
use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Snapshot of the detector, published with every frame result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessState {
    pub blink_count: u32,
    pub verified: bool,
    pub cooldown: u32,
}

/// Counts a blink when the eyes go from open to fewer than two visible for
/// at least `closed_frames` consecutive frames, then open again. After a
/// blink, `cooldown_frames` frames are ignored.
#[derive(Debug, Clone)]
pub struct LivenessDetector {
    config: LivenessConfig,
    blink_count: u32,
    closed_run: u32,
    cooldown: u32,
    /// Eyes were last seen open, so a closed run may start. Starts unset:
    /// a subject who arrives with closed eyes has not blinked yet.
    armed: bool,
}

impl LivenessDetector {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            blink_count: 0,
            closed_run: 0,
            cooldown: 0,
            armed: false,
        }
    }

    pub fn reset(&mut self) {
        self.blink_count = 0;
        self.closed_run = 0;
        self.cooldown = 0;
        self.armed = false;
    }

    pub fn is_verified(&self) -> bool {
        self.blink_count >= self.config.required_blinks
    }

    pub fn state(&self) -> LivenessState {
        LivenessState {
            blink_count: self.blink_count,
            verified: self.is_verified(),
            cooldown: self.cooldown,
        }
    }

    /// Feed one frame's open-eye count. `None` means no face was found and
    /// leaves every counter untouched.
    pub fn observe(&mut self, eyes: Option<usize>) -> LivenessState {
        let Some(eyes) = eyes else {
            return self.state();
        };
        let open = eyes >= 2;

        if self.cooldown > 0 {
            self.cooldown -= 1;
            self.closed_run = 0;
            self.armed = open;
            return self.state();
        }

        if !open {
            if self.armed {
                self.closed_run += 1;
            }
            return self.state();
        }

        if self.closed_run >= self.config.closed_frames.max(1) {
            self.blink_count += 1;
            self.cooldown = self.config.cooldown_frames;
            tracing::debug!(blinks = self.blink_count, "blink counted");
        }
        self.closed_run = 0;
        self.armed = true;
        self.state()
    }

    /// Observe the primary face of a frame.
    pub fn observe_face(
        &mut self,
        image: &GrayImage,
        face: Option<&BoundingBox>,
        eyes: &mut dyn EyeDetector,
    ) -> LivenessState {
        let count = face.map(|f| eyes.count_eyes(image, f));
        self.observe(count)
    }
}
