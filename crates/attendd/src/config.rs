use attend_core::CoreConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: an optional TOML file, then `ATTEND_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Play images from this directory instead of opening the camera.
    pub image_dir: Option<PathBuf>,
    /// Loop `image_dir` playback.
    pub image_loop: bool,
    /// SCRFD detection model.
    pub model_path: PathBuf,
    /// Pause between frame-loop iterations.
    pub frame_interval_ms: u64,
    /// Location tag recorded with every attempt.
    pub location: String,
    /// Minimum eye-patch contrast for an open eye.
    pub eye_min_stddev: f32,
    pub core: CoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_home = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home().join(".local/share"))
            .join("attendify");
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            image_dir: None,
            image_loop: true,
            model_path: data_home.join("models/det_10g.onnx"),
            frame_interval_ms: 33,
            location: attend_core::guard::DEFAULT_LOCATION.to_string(),
            eye_min_stddev: 18.0,
            core: CoreConfig {
                data_dir: Some(data_home),
                ..CoreConfig::default()
            },
        }
    }
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

impl Config {
    /// `$ATTEND_CONFIG`, else `$XDG_CONFIG_HOME/attendify/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var("ATTEND_CONFIG") {
            return PathBuf::from(p);
        }
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home().join(".config"))
            .join("attendify/config.toml")
    }

    /// Load the default file (missing is fine) and apply the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&Self::default_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        // The daemon always persists; a `[core]` table without `data_dir`
        // keeps the default location.
        if config.core.data_dir.is_none() {
            config.core.data_dir = Self::default().core.data_dir;
        }
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply `ATTEND_*` overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ATTEND_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ATTEND_IMAGE_DIR") {
            self.image_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ATTEND_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("ATTEND_DATA_DIR") {
            self.core.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ATTEND_LOCATION") {
            self.location = v;
        }
        self.frame_interval_ms = parsed(&var, "ATTEND_FRAME_INTERVAL_MS", self.frame_interval_ms);
        self.core.recognition.match_threshold = parsed(
            &var,
            "ATTEND_MATCH_THRESHOLD",
            self.core.recognition.match_threshold,
        );
        self.core.guard.max_attempts =
            parsed(&var, "ATTEND_MAX_ATTEMPTS", self.core.guard.max_attempts);
        self.core.guard.window_secs =
            parsed(&var, "ATTEND_RATE_WINDOW_SECS", self.core.guard.window_secs);
        self.core.liveness.required_blinks = parsed(
            &var,
            "ATTEND_REQUIRED_BLINKS",
            self.core.liveness.required_blinks,
        );
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            current
        }),
        None => current,
    }
}
