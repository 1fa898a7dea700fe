//! Simulated biometric factors: a stable fingerprint template and a QR token
//! that rotates once per calendar day.
//!
//! Not a security boundary; the hashes only make the demo factors
//! deterministic and day-bound.

use crate::config::BiometricConfig;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("QR rendering failed: {0}")]
pub struct RenderError(pub String);

/// Renders a payload string as a scannable 2D barcode image.
pub trait QrRenderer {
    fn render(&self, payload: &str) -> Result<Vec<u8>, RenderError>;
}

/// Today's QR credential for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyQr {
    /// `NAMESPACE:identity_id:token`
    pub payload: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct BiometricSimulator {
    config: BiometricConfig,
}

impl BiometricSimulator {
    pub fn new(config: BiometricConfig) -> Self {
        Self { config }
    }

    /// Stable fingerprint template for an identity.
    pub fn fingerprint(&self, identity_id: &str) -> String {
        truncated_sha256(
            &[identity_id, &self.config.fingerprint_secret],
            self.config.fingerprint_len,
        )
    }

    /// A simulated scan matches the stored template iff it was produced for
    /// the same identity.
    pub fn verify_fingerprint(&self, scanned: &str, stored: &str) -> bool {
        !stored.is_empty() && scanned == stored
    }

    pub fn qr_token(&self, identity_id: &str, date: NaiveDate) -> String {
        let day = date.format("%Y-%m-%d").to_string();
        truncated_sha256(
            &[identity_id, &day, &self.config.qr_secret],
            self.config.qr_token_len,
        )
    }

    pub fn daily_qr(&self, identity_id: &str, date: NaiveDate) -> DailyQr {
        let token = self.qr_token(identity_id, date);
        DailyQr {
            payload: format!("{}:{}:{}", self.config.qr_namespace, identity_id, token),
            token,
        }
    }

    /// Today's QR rendered to image bytes, plus its token.
    pub fn daily_qr_image(
        &self,
        identity_id: &str,
        date: NaiveDate,
        renderer: &dyn QrRenderer,
    ) -> Result<(Vec<u8>, String), RenderError> {
        let qr = self.daily_qr(identity_id, date);
        let image = renderer.render(&qr.payload)?;
        Ok((image, qr.token))
    }

    /// Check a scanned payload against `identity_id` for the given day.
    pub fn verify_qr(&self, payload: &str, identity_id: &str, today: NaiveDate) -> bool {
        let mut parts = payload.splitn(3, ':');
        let (Some(namespace), Some(id), Some(token)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if namespace != self.config.qr_namespace || id != identity_id {
            return false;
        }
        token == self.qr_token(identity_id, today)
    }
}

fn truncated_sha256(parts: &[&str], len: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(len);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> BiometricSimulator {
        BiometricSimulator::new(BiometricConfig::default())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let s = sim();
        assert_eq!(s.fingerprint("S1"), s.fingerprint("S1"));
        assert_ne!(s.fingerprint("S1"), s.fingerprint("S2"));
        assert_eq!(s.fingerprint("S1").len(), 32);
    }

    #[test]
    fn test_fingerprint_depends_on_secret() {
        let other = BiometricSimulator::new(BiometricConfig {
            fingerprint_secret: "other".into(),
            ..BiometricConfig::default()
        });
        assert_ne!(sim().fingerprint("S1"), other.fingerprint("S1"));
    }

    #[test]
    fn test_qr_payload_format() {
        let qr = sim().daily_qr("S1", day(19));
        assert_eq!(qr.token.len(), 16);
        assert_eq!(qr.payload, format!("ATTENDIFY:S1:{}", qr.token));
    }

    #[test]
    fn test_qr_verifies_same_day_only() {
        let s = sim();
        let qr = s.daily_qr("S1", day(19));
        assert!(s.verify_qr(&qr.payload, "S1", day(19)));
        assert!(!s.verify_qr(&qr.payload, "S1", day(20)));
        assert!(!s.verify_qr(&qr.payload, "S1", day(18)));
    }

    #[test]
    fn test_qr_rejects_wrong_identity_and_namespace() {
        let s = sim();
        let qr = s.daily_qr("S1", day(19));
        assert!(!s.verify_qr(&qr.payload, "S2", day(19)));
        let forged = qr.payload.replace("ATTENDIFY", "OTHER");
        assert!(!s.verify_qr(&forged, "S1", day(19)));
        assert!(!s.verify_qr("garbage", "S1", day(19)));
        assert!(!s.verify_qr("ATTENDIFY:S1", "S1", day(19)));
    }

    #[test]
    fn test_qr_image_uses_renderer() {
        struct Echo;
        impl QrRenderer for Echo {
            fn render(&self, payload: &str) -> Result<Vec<u8>, RenderError> {
                Ok(payload.as_bytes().to_vec())
            }
        }
        let s = sim();
        let (bytes, token) = s.daily_qr_image("S1", day(19), &Echo).unwrap();
        assert_eq!(bytes, s.daily_qr("S1", day(19)).payload.into_bytes());
        assert_eq!(token, s.qr_token("S1", day(19)));
    }
}
