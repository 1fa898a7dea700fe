//! The in-progress verification attempt.
//!
//! `Pending` until a frame recognizes someone, then `FaceMatched` while the
//! optional factors accumulate, and finally `Committed` or `Rejected` once a
//! mark is tried. Only [`VerificationSession::reset`] leaves a final state.

use crate::error::AttendError;
use crate::types::{AttendanceRecord, FaceMatch, Factors};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Pending,
    FaceMatched,
    Committed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub state: AttemptState,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub factors: Factors,
    pub score: u8,
    /// Why the last mark was refused.
    pub reason: Option<String>,
}

impl Default for VerificationAttempt {
    fn default() -> Self {
        Self {
            state: AttemptState::Pending,
            identity_id: None,
            display_name: None,
            factors: Factors::default(),
            score: 0,
            reason: None,
        }
    }
}

/// A simulated or checked factor that can be added to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Liveness,
    Fingerprint,
    Qr,
}

#[derive(Debug, Default)]
pub struct VerificationSession {
    attempt: VerificationAttempt,
}

impl VerificationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> &VerificationAttempt {
        &self.attempt
    }

    /// Identity the attempt is bound to, once a face matched.
    pub fn identity_id(&self) -> Option<&str> {
        self.attempt.identity_id.as_deref()
    }

    /// The first recognized face binds the attempt. Later faces, including
    /// other identities, do not rebind it.
    pub fn on_face(&mut self, face: &FaceMatch) -> bool {
        if self.attempt.state != AttemptState::Pending {
            return false;
        }
        let Some(id) = face.identity_id.clone() else {
            return false;
        };
        tracing::debug!(identity = %id, confidence = face.confidence, "attempt bound to face");
        self.attempt.identity_id = Some(id);
        self.attempt.display_name = face.display_name.clone();
        self.attempt.state = AttemptState::FaceMatched;
        self.attempt.factors.face = true;
        self.refresh_score();
        true
    }

    /// Set a factor flag. Flags never clear except through `reset`.
    pub fn add_factor(&mut self, factor: Factor) -> Result<(), AttendError> {
        if self.attempt.state != AttemptState::FaceMatched {
            return Err(AttendError::FaceRequired);
        }
        let flags = &mut self.attempt.factors;
        match factor {
            Factor::Liveness => flags.liveness = true,
            Factor::Fingerprint => flags.fingerprint = true,
            Factor::Qr => flags.qr = true,
        }
        self.refresh_score();
        Ok(())
    }

    /// Record the ledger's answer to a mark of this attempt.
    pub fn finish(&mut self, outcome: &Result<AttendanceRecord, AttendError>) {
        match outcome {
            Ok(_) => {
                self.attempt.state = AttemptState::Committed;
                self.attempt.reason = None;
            }
            Err(e) => {
                self.attempt.state = AttemptState::Rejected;
                self.attempt.reason = Some(e.to_string());
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempt = VerificationAttempt::default();
    }

    fn refresh_score(&mut self) {
        self.attempt.score = self.attempt.factors.score();
    }
}
