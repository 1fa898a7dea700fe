use thiserror::Error;

/// Failures surfaced by enrollment, verification and marking.
///
/// Detection never produces one of these: a frame without faces is routine
/// and yields empty results instead.
#[derive(Error, Debug)]
pub enum AttendError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("only {found} usable face samples, need at least {required}")]
    InsufficientSamples { found: usize, required: usize },
    #[error("face recognition is not available")]
    RecognitionUnavailable,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("attendance already marked today for {0}")]
    AlreadyMarked(String),
    #[error("face verification is required")]
    FaceRequired,
    #[error("invalid QR token")]
    InvalidQrToken,
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),
}

/// Persistence failures for the gallery, model and attendance log.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model: {0}")]
    Model(#[from] crate::matcher::MatcherError),
    #[error("attendance log: {0}")]
    Csv(#[from] csv::Error),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
