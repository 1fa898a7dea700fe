//! [`AttendanceCore`]: the context object front-ends talk to.

use crate::biometric::{BiometricSimulator, DailyQr, QrRenderer, RenderError};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::detector::{DetectorBackend, EyeDetector, FaceDetector};
use crate::error::{AttendError, StorageError};
use crate::gallery::NewIdentity;
use crate::guard::AnomalyGuard;
use crate::importer::{self, ImportSummary, IMPORTED_DEPARTMENT};
use crate::ledger::{AttendanceLedger, Statistics};
use crate::liveness::{LivenessDetector, LivenessState};
use crate::matcher::LbphMatcher;
use crate::pipeline::{self, FrameResult};
use crate::recognizer::{Enrollment, FaceRecognizer};
use crate::session::{Factor, VerificationAttempt, VerificationSession};
use crate::store::GalleryFiles;
use crate::types::{AnomalyEvent, AttendanceRecord, EnrolledIdentity, Factors};
use chrono::NaiveDate;
use image::GrayImage;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// State touched by every frame and by the factor/mark calls.
struct Verification {
    session: VerificationSession,
    liveness: LivenessDetector,
    eyes: Box<dyn EyeDetector>,
}

/// Owns the gallery/recognizer, guard, ledger and the live verification
/// attempt. Safe to share across the capture worker and request handlers.
pub struct AttendanceCore {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    recognizer: FaceRecognizer,
    biometric: BiometricSimulator,
    guard: AnomalyGuard,
    ledger: AttendanceLedger,
    verification: Mutex<Verification>,
}

impl AttendanceCore {
    /// Build the core, loading persisted state from `config.data_dir` when set.
    pub fn open(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        detector: Box<dyn DetectorBackend>,
        eyes: Box<dyn EyeDetector>,
    ) -> Result<Self, StorageError> {
        let detector =
            FaceDetector::with_params(detector, config.detection.strict, config.detection.relaxed);
        let matcher = Box::new(LbphMatcher::default());

        let (recognizer, ledger) = match &config.data_dir {
            Some(dir) => (
                FaceRecognizer::open(
                    config.recognition.clone(),
                    detector,
                    GalleryFiles::new(dir),
                    matcher,
                )?,
                AttendanceLedger::open(clock.clone(), dir)?,
            ),
            None => (
                FaceRecognizer::new(config.recognition.clone(), detector, matcher),
                AttendanceLedger::in_memory(clock.clone()),
            ),
        };

        Ok(Self {
            biometric: BiometricSimulator::new(config.biometric.clone()),
            guard: AnomalyGuard::new(config.guard.clone(), clock.clone()),
            verification: Mutex::new(Verification {
                session: VerificationSession::new(),
                liveness: LivenessDetector::new(config.liveness.clone()),
                eyes,
            }),
            recognizer,
            ledger,
            clock,
            config,
        })
    }

    fn verification(&self) -> MutexGuard<'_, Verification> {
        self.verification.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn recognizer(&self) -> &FaceRecognizer {
        &self.recognizer
    }

    pub fn biometric(&self) -> &BiometricSimulator {
        &self.biometric
    }

    pub fn guard(&self) -> &AnomalyGuard {
        &self.guard
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    fn new_identity(&self, identity_id: &str, display_name: &str, department: &str) -> NewIdentity {
        NewIdentity {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            department: department.to_string(),
            fingerprint_hash: self.biometric.fingerprint(identity_id),
            enrolled_at: self.clock.now(),
        }
    }

    // --- Enrollment ---

    pub fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        department: &str,
        frames: &[GrayImage],
    ) -> Result<Enrollment, AttendError> {
        let identity = self.new_identity(identity_id, display_name, department);
        self.recognizer.enroll(identity, frames)
    }

    pub fn import_folder(&self, root: &Path) -> Result<ImportSummary, AttendError> {
        importer::import_folder(
            root,
            &self.recognizer,
            &|id, name| self.new_identity(id, name, IMPORTED_DEPARTMENT),
            self.config.recognition.max_samples_per_identity,
        )
    }

    pub fn identities(&self) -> Vec<EnrolledIdentity> {
        self.recognizer.identities()
    }

    pub fn recognition_available(&self) -> bool {
        self.recognizer.snapshot().is_available()
    }

    // --- Frame loop ---

    /// Run one frame through detection, recognition and liveness, and feed
    /// the result into the current attempt.
    pub fn process_frame(&self, sequence: u64, image: &GrayImage) -> FrameResult {
        let mut v = self.verification();
        let Verification {
            session,
            liveness,
            eyes,
        } = &mut *v;

        let result =
            pipeline::process_frame(sequence, image, &self.recognizer, eyes.as_mut(), liveness);

        if let Some(face) = result.recognized() {
            session.on_face(&face.as_match());
        }
        if result.liveness.verified
            && !session.attempt().factors.liveness
            && session.add_factor(Factor::Liveness).is_ok()
        {
            tracing::info!(identity = ?session.identity_id(), "liveness verified");
        }
        result
    }

    // --- Verification factors ---

    pub fn attempt(&self) -> VerificationAttempt {
        self.verification().session.attempt().clone()
    }

    pub fn liveness(&self) -> LivenessState {
        self.verification().liveness.state()
    }

    /// Simulated fingerprint scan for the attempt's identity.
    pub fn scan_fingerprint(&self) -> Result<VerificationAttempt, AttendError> {
        let mut v = self.verification();
        let identity_id = v
            .session
            .identity_id()
            .map(str::to_string)
            .ok_or(AttendError::FaceRequired)?;
        let stored = self
            .recognizer
            .identity(&identity_id)
            .map(|i| i.fingerprint_hash)
            .unwrap_or_default();
        let scanned = self.biometric.fingerprint(&identity_id);
        if self.biometric.verify_fingerprint(&scanned, &stored) {
            v.session.add_factor(Factor::Fingerprint)?;
            tracing::info!(identity = %identity_id, "fingerprint verified");
        } else {
            tracing::warn!(identity = %identity_id, "fingerprint mismatch");
        }
        Ok(v.session.attempt().clone())
    }

    /// Check a scanned QR payload against the attempt's identity.
    pub fn scan_qr(&self, payload: &str) -> Result<VerificationAttempt, AttendError> {
        let mut v = self.verification();
        let identity_id = v
            .session
            .identity_id()
            .map(str::to_string)
            .ok_or(AttendError::FaceRequired)?;
        if !self
            .biometric
            .verify_qr(payload, &identity_id, self.clock.today())
        {
            tracing::warn!(identity = %identity_id, "QR token rejected");
            return Err(AttendError::InvalidQrToken);
        }
        v.session.add_factor(Factor::Qr)?;
        tracing::info!(identity = %identity_id, "QR verified");
        Ok(v.session.attempt().clone())
    }

    pub fn daily_qr(&self, identity_id: &str) -> DailyQr {
        self.biometric.daily_qr(identity_id, self.clock.today())
    }

    pub fn daily_qr_image(
        &self,
        identity_id: &str,
        renderer: &dyn QrRenderer,
    ) -> Result<(Vec<u8>, String), RenderError> {
        self.biometric
            .daily_qr_image(identity_id, self.clock.today(), renderer)
    }

    // --- Marking ---

    /// Commit the current attempt. Liveness counters restart after a
    /// successful mark; a refused attempt stays visible until `reset`.
    pub fn mark_current(&self, location: &str) -> Result<AttendanceRecord, AttendError> {
        let mut v = self.verification();
        let Some(identity_id) = v.session.identity_id().map(str::to_string) else {
            return Err(AttendError::FaceRequired);
        };
        let factors = v.session.attempt().factors;
        let outcome = self.ledger.mark(&identity_id, factors, location, &self.guard);
        v.session.finish(&outcome);
        if outcome.is_ok() {
            v.liveness.reset();
        }
        outcome
    }

    /// Mark an identity directly with externally verified factors.
    pub fn mark(
        &self,
        identity_id: &str,
        factors: Factors,
        location: &str,
    ) -> Result<AttendanceRecord, AttendError> {
        self.ledger.mark(identity_id, factors, location, &self.guard)
    }

    /// Clear the attempt and liveness. Committed records are untouched.
    pub fn reset(&self) {
        let mut v = self.verification();
        v.session.reset();
        v.liveness.reset();
        tracing::debug!("verification attempt reset");
    }

    // --- Reports ---

    pub fn records_today(&self) -> Vec<AttendanceRecord> {
        self.ledger.records_on(self.clock.today())
    }

    pub fn records_on(&self, date: NaiveDate) -> Vec<AttendanceRecord> {
        self.ledger.records_on(date)
    }

    pub fn recent_anomalies(&self, count: usize) -> Vec<AnomalyEvent> {
        self.guard.recent_anomalies(count)
    }

    pub fn statistics(&self) -> Statistics {
        let enrolled = self.recognizer.snapshot().gallery().len();
        self.ledger.statistics(enrolled, &self.guard)
    }

    /// Flush gallery and model. Attendance is already durable per mark.
    pub fn save(&self) -> Result<(), StorageError> {
        self.recognizer.save()
    }
}
