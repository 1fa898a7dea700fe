//! Frame sources consumed by the capture worker.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no images in {0}")]
    EmptyDirectory(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that yields frames on demand: a camera, a recording, a fixture.
///
/// `Ok(None)` means the source is exhausted. A source is owned by exactly one
/// reader and releases its device when dropped.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Short human-readable name for logs.
    fn describe(&self) -> String;
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Plays the images of a directory in name order, optionally looping.
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    looping: bool,
    sequence: u64,
}

impl ImageDirSource {
    pub fn open(dir: &Path, looping: bool) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir).map_err(|e| CameraError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|x| x.to_str())
                    .is_some_and(|x| IMAGE_EXTENSIONS.contains(&x.to_ascii_lowercase().as_str()))
            })
            .collect();
        if files.is_empty() {
            return Err(CameraError::EmptyDirectory(dir.display().to_string()));
        }
        files.sort();
        tracing::info!(dir = %dir.display(), images = files.len(), looping, "opened image directory");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
            looping,
            sequence: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.next >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.next = 0;
        }
        let path = &self.files[self.next];
        self.next += 1;

        let image = image::open(path)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_luma8();
        let frame = Frame::new(image, self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}
