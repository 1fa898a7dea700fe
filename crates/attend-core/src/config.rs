use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for the attendance core. Every field has a default, so a partial
/// TOML table is enough.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Directory holding `gallery.json`, `model.bin` and the daily logs.
    /// `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub recognition: RecognitionConfig,
    pub liveness: LivenessConfig,
    pub guard: GuardConfig,
    pub biometric: BiometricConfig,
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Side of the square normalized face sample. Training and inference share it.
    pub face_size: u32,
    /// A prediction is accepted only when its distance is below this.
    pub match_threshold: f64,
    pub min_samples: usize,
    pub max_samples_per_identity: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            face_size: 100,
            match_threshold: 80.0,
            min_samples: 3,
            max_samples_per_identity: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub required_blinks: u32,
    /// Frames ignored after a counted blink.
    pub cooldown_frames: u32,
    /// Consecutive frames with fewer than two eyes needed before a reopen counts.
    pub closed_frames: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            required_blinks: 2,
            cooldown_frames: 10,
            closed_frames: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub window_secs: u64,
    pub max_attempts: usize,
    pub location_window_secs: u64,
}

impl GuardConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn location_window(&self) -> Duration {
        Duration::from_secs(self.location_window_secs)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            max_attempts: 5,
            location_window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiometricConfig {
    pub fingerprint_secret: String,
    pub qr_secret: String,
    pub qr_namespace: String,
    pub fingerprint_len: usize,
    pub qr_token_len: usize,
}

impl Default for BiometricConfig {
    fn default() -> Self {
        Self {
            fingerprint_secret: "SECRET_SALT".to_string(),
            qr_secret: "QR_SECRET".to_string(),
            qr_namespace: "ATTENDIFY".to_string(),
            fingerprint_len: 32,
            qr_token_len: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub strict: crate::detector::DetectParams,
    pub relaxed: crate::detector::DetectParams,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            strict: crate::detector::DetectParams::strict(),
            relaxed: crate::detector::DetectParams::relaxed(),
        }
    }
}
