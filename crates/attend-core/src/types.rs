use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box without landmarks, as produced by cascade-style detectors.
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to an image of the given size.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clip(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// An enrolled person. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub display_name: String,
    #[serde(default)]
    pub department: String,
    /// Internal matcher label.
    pub label: u32,
    pub fingerprint_hash: String,
    pub enrolled_at: DateTime<Local>,
}

/// Verification factors collected for one attempt.
///
/// Flags only ever flip from `false` to `true` during an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factors {
    pub face: bool,
    pub liveness: bool,
    pub fingerprint: bool,
    pub qr: bool,
}

pub const FACE_WEIGHT: u8 = 30;
pub const LIVENESS_WEIGHT: u8 = 25;
pub const FINGERPRINT_WEIGHT: u8 = 25;
pub const QR_WEIGHT: u8 = 20;

impl Factors {
    pub fn face_only() -> Self {
        Self {
            face: true,
            ..Self::default()
        }
    }

    /// Weighted multi-factor score in `0..=100`.
    pub fn score(&self) -> u8 {
        let weight = |on: bool, w: u8| if on { w } else { 0 };
        weight(self.face, FACE_WEIGHT)
            + weight(self.liveness, LIVENESS_WEIGHT)
            + weight(self.fingerprint, FINGERPRINT_WEIGHT)
            + weight(self.qr, QR_WEIGHT)
    }
}

/// One committed attendance mark. At most one per `(identity_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub date: NaiveDate,
    pub marked_at: DateTime<Local>,
    pub verification_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    RateLimit,
    LocationAnomaly,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::RateLimit => f.write_str("RATE_LIMIT"),
            AnomalyKind::LocationAnomaly => f.write_str("LOCATION_ANOMALY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub identity_id: String,
    pub kind: AnomalyKind,
    pub description: String,
    pub timestamp: DateTime<Local>,
}

/// Outcome of recognizing one face region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// `max(0, 100 - distance)`, zero when there is no match.
    pub confidence: u8,
}

impl FaceMatch {
    pub fn unknown() -> Self {
        Self {
            identity_id: None,
            display_name: None,
            confidence: 0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_weights_sum_to_100() {
        let all = Factors {
            face: true,
            liveness: true,
            fingerprint: true,
            qr: true,
        };
        assert_eq!(all.score(), 100);
        assert_eq!(Factors::default().score(), 0);
        assert_eq!(Factors::face_only().score(), 30);
    }

    #[test]
    fn test_score_monotonic_in_every_flag() {
        for bits in 0u8..16 {
            let f = Factors {
                face: bits & 1 != 0,
                liveness: bits & 2 != 0,
                fingerprint: bits & 4 != 0,
                qr: bits & 8 != 0,
            };
            let base = f.score();
            assert!(base <= 100);
            for flip in 0..4 {
                let mut g = f;
                match flip {
                    0 => g.face = true,
                    1 => g.liveness = true,
                    2 => g.fingerprint = true,
                    _ => g.qr = true,
                }
                assert!(g.score() >= base, "{f:?} -> {g:?}");
            }
        }
    }

    #[test]
    fn test_clip_inside() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 40.0, 1.0);
        assert_eq!(b.clip(100, 100), Some((10, 20, 30, 40)));
    }

    #[test]
    fn test_clip_partially_outside() {
        let b = BoundingBox::new(-5.0, 90.0, 20.0, 20.0, 1.0);
        assert_eq!(b.clip(100, 100), Some((0, 90, 15, 10)));
    }

    #[test]
    fn test_clip_fully_outside() {
        let b = BoundingBox::new(200.0, 200.0, 20.0, 20.0, 1.0);
        assert_eq!(b.clip(100, 100), None);
    }

    #[test]
    fn test_anomaly_kind_display() {
        assert_eq!(AnomalyKind::RateLimit.to_string(), "RATE_LIMIT");
        assert_eq!(AnomalyKind::LocationAnomaly.to_string(), "LOCATION_ANOMALY");
    }
}
