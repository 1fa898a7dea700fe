use crate::config::Config;
use crate::engine::{self, Capture};
use attend_core::{AttendError, AttendanceCore};
use image::GrayImage;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.campus.Attendance";
pub const OBJECT_PATH: &str = "/org/campus/Attendance1";

/// JSON reply carried by every method: `{success, message, data?}`.
fn reply(success: bool, message: impl Into<String>, data: Option<Value>) -> String {
    let mut body = json!({ "success": success, "message": message.into() });
    if let Some(data) = data {
        body["data"] = data;
    }
    body.to_string()
}

fn to_value<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn outcome<T: Serialize>(result: Result<T, AttendError>, ok: impl FnOnce(&T) -> String) -> String {
    match result {
        Ok(v) => reply(true, ok(&v), Some(to_value(&v))),
        Err(e) => reply(false, e.to_string(), None),
    }
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.campus.Attendance
/// Object path: /org/campus/Attendance1
pub struct AttendanceService {
    core: Arc<AttendanceCore>,
    capture: Arc<Capture>,
    config: Arc<Config>,
    samples: Mutex<Vec<GrayImage>>,
}

impl AttendanceService {
    pub fn new(core: Arc<AttendanceCore>, capture: Arc<Capture>, config: Arc<Config>) -> Self {
        Self {
            core,
            capture,
            config,
            samples: Mutex::new(Vec::new()),
        }
    }

    fn samples(&self) -> std::sync::MutexGuard<'_, Vec<GrayImage>> {
        self.samples.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run blocking core work off the async executor.
    async fn blocking<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<AttendanceCore>) -> T + Send + 'static,
    {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || f(core))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))
    }
}

#[interface(name = "org.campus.Attendance1")]
impl AttendanceService {
    // --- Session ---

    /// Start the capture session on the configured source.
    async fn start_session(&self) -> String {
        if self.capture.is_running() {
            return reply(true, "session already running", None);
        }
        let config = self.config.clone();
        let opened = tokio::task::spawn_blocking(move || engine::open_source(&config)).await;
        let source = match opened {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => return reply(false, e.to_string(), None),
            Err(e) => return reply(false, format!("worker task failed: {e}"), None),
        };
        match self.capture.start(source) {
            Ok(_) => reply(true, "session started", None),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    async fn stop_session(&self) -> String {
        let capture = self.capture.clone();
        let stopped = tokio::task::spawn_blocking(move || capture.stop())
            .await
            .unwrap_or(false);
        let message = if stopped { "session stopped" } else { "no session running" };
        reply(true, message, None)
    }

    /// Last processed frame: faces and liveness.
    async fn latest_frame(&self) -> String {
        match self.capture.latest_result() {
            Some(r) => reply(true, format!("frame {}", r.sequence), Some(to_value(&r))),
            None => reply(false, "no frame processed yet", None),
        }
    }

    // --- Enrollment ---

    /// Add the latest frame to the enrollment buffer.
    async fn capture_sample(&self) -> String {
        let Some(frame) = self.capture.latest_frame() else {
            return reply(false, "no frame available; start a session first", None);
        };
        let limit = self.core.config().recognition.max_samples_per_identity;
        let mut samples = self.samples();
        if samples.len() >= limit {
            return reply(false, format!("sample buffer full ({limit})"), None);
        }
        samples.push(frame.image);
        let count = samples.len();
        reply(true, format!("{count} samples buffered"), Some(json!(count)))
    }

    async fn clear_samples(&self) -> String {
        self.samples().clear();
        reply(true, "sample buffer cleared", Some(json!(0)))
    }

    /// Enroll from the sample buffer. The buffer is consumed only on success.
    async fn enroll(&self, identity_id: String, display_name: String, department: String) -> String {
        let frames = self.samples().clone();
        tracing::info!(identity = %identity_id, frames = frames.len(), "enroll requested");
        let result = self
            .blocking(move |core| core.enroll(&identity_id, &display_name, &department, &frames))
            .await;
        match result {
            Ok(Ok(e)) => {
                self.samples().clear();
                reply(
                    true,
                    format!("enrolled with {} samples", e.samples),
                    Some(json!({ "label": e.label, "samples": e.samples })),
                )
            }
            Ok(Err(e)) => reply(false, e.to_string(), None),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    async fn import_folder(&self, path: String) -> String {
        tracing::info!(path, "import requested");
        let result = self
            .blocking(move |core| core.import_folder(&PathBuf::from(path)))
            .await;
        match result {
            Ok(r) => outcome(r, |s| {
                format!("imported {}, skipped {}", s.imported.len(), s.skipped.len())
            }),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    // --- Verification ---

    async fn scan_fingerprint(&self) -> String {
        match self.blocking(|core| core.scan_fingerprint()).await {
            Ok(r) => outcome(r, |a| {
                if a.factors.fingerprint {
                    "fingerprint verified".to_string()
                } else {
                    "fingerprint did not match".to_string()
                }
            }),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    async fn scan_qr(&self, payload: String) -> String {
        match self.blocking(move |core| core.scan_qr(&payload)).await {
            Ok(r) => outcome(r, |_| "QR verified".to_string()),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    /// Today's QR payload for an identity.
    async fn daily_qr(&self, identity_id: String) -> String {
        if self.core.recognizer().identity(&identity_id).is_none() {
            return reply(false, format!("unknown identity: {identity_id}"), None);
        }
        let qr = self.core.daily_qr(&identity_id);
        reply(true, qr.payload.clone(), Some(json!({ "payload": qr.payload, "token": qr.token })))
    }

    /// Commit the current attempt.
    async fn mark(&self) -> String {
        let location = self.config.location.clone();
        let result = self.blocking(move |core| core.mark_current(&location)).await;
        match result {
            Ok(r) => outcome(r, |rec| {
                format!(
                    "attendance marked for {} (score {})",
                    rec.identity_id, rec.verification_score
                )
            }),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    async fn reset(&self) -> String {
        match self.blocking(|core| core.reset()).await {
            Ok(()) => reply(true, "attempt reset", None),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    async fn attempt(&self) -> String {
        match self.blocking(|core| core.attempt()).await {
            Ok(attempt) => reply(true, format!("{:?}", attempt.state), Some(to_value(&attempt))),
            Err(e) => reply(false, e.to_string(), None),
        }
    }

    // --- Reports ---

    async fn today(&self) -> String {
        let records = self.core.records_today();
        reply(true, format!("{} present", records.len()), Some(to_value(&records)))
    }

    async fn anomalies(&self, count: u32) -> String {
        let events = self.core.recent_anomalies(count as usize);
        reply(true, format!("{} anomalies", events.len()), Some(to_value(&events)))
    }

    async fn status(&self) -> String {
        let stats = self.core.statistics();
        reply(
            true,
            "ok",
            Some(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "session_running": self.capture.is_running(),
                "recognition_available": self.core.recognition_available(),
                "samples_buffered": self.samples().len(),
                "statistics": stats,
            })),
        )
    }

    /// Emitted for every processed frame that contains a face.
    #[zbus(signal)]
    pub async fn frame_processed(emitter: &SignalEmitter<'_>, result: &str) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::detector::{DetectParams, DetectorBackend, DetectorError};
    use attend_core::eyes::ContrastEyeDetector;
    use attend_core::{BoundingBox, CoreConfig, SystemClock};
    use std::time::Duration;

    struct NoFaces;

    impl DetectorBackend for NoFaces {
        fn detect(
            &mut self,
            _: &GrayImage,
            _: &DetectParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    fn service() -> AttendanceService {
        let core = AttendanceCore::open(
            CoreConfig::default(),
            Arc::new(SystemClock),
            Box::new(NoFaces),
            Box::new(ContrastEyeDetector::default()),
        )
        .unwrap();
        let core = Arc::new(core);
        let capture = Arc::new(Capture::new(core.clone(), Duration::from_millis(1)));
        AttendanceService::new(core, capture, Arc::new(Config::default()))
    }

    fn parse(reply: String) -> Value {
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_verification_calls_run_off_the_executor() {
        let svc = service();
        let here = std::thread::current().id();
        let worker = svc.blocking(|_| std::thread::current().id()).await.unwrap();
        assert_ne!(worker, here);

        let v = parse(svc.attempt().await);
        assert_eq!(v["data"]["state"], "PENDING");

        let v = parse(svc.scan_fingerprint().await);
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "face verification is required");

        let v = parse(svc.scan_qr("ATTENDIFY:S1:0000".into()).await);
        assert_eq!(v["success"], false);

        assert_eq!(parse(svc.reset().await)["success"], true);
    }

    #[test]
    fn test_reply_shape() {
        let v: Value = serde_json::from_str(&reply(false, "nope", None)).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "nope");
        assert!(v.get("data").is_none());

        let v: Value = serde_json::from_str(&reply(true, "ok", Some(json!(3)))).unwrap();
        assert_eq!(v["data"], 3);
    }

    #[test]
    fn test_outcome_maps_errors() {
        let r: Result<u8, AttendError> = Err(AttendError::FaceRequired);
        let v: Value = serde_json::from_str(&outcome(r, |_| String::new())).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "face verification is required");
    }
}
