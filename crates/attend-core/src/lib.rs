//! attend-core: multi-factor attendance verification.
//!
//! Face detection (SCRFD via ONNX Runtime) and LBPH-style matching against
//! an enrolled gallery, blink liveness, simulated fingerprint and daily QR
//! factors, a sliding-window rate guard, and a once-per-day attendance
//! ledger, tied together by [`AttendanceCore`].

pub mod biometric;
pub mod clock;
pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod eyes;
pub mod gallery;
pub mod guard;
pub mod importer;
pub mod ledger;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod scrfd;
pub mod session;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::CoreConfig;
pub use context::AttendanceCore;
pub use error::{AttendError, StorageError};
pub use pipeline::{FaceResult, FrameResult};
pub use types::{AnomalyEvent, AnomalyKind, AttendanceRecord, BoundingBox, FaceMatch, Factors};
