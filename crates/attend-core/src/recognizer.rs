//! Face recognizer: two-stage detection plus gallery matching.
//!
//! The gallery and the trained matcher live together in an immutable
//! [`ModelSnapshot`]. Recognition clones the current `Arc` and never blocks
//! on enrollment; enrollment builds the next snapshot on a copy of the
//! matcher and swaps it in once training and persistence are done.

use crate::config::RecognitionConfig;
use crate::detector::FaceDetector;
use crate::error::{AttendError, StorageError};
use crate::gallery::{GalleryStore, NewIdentity};
use crate::matcher::MatcherBackend;
use crate::store::{GalleryFiles, ModelState};
use crate::types::{BoundingBox, EnrolledIdentity, FaceMatch};
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::sync::{Arc, Mutex, RwLock};

/// One consistent generation of gallery and matcher.
pub struct ModelSnapshot {
    gallery: GalleryStore,
    /// `None` when the stored model could not be loaded.
    matcher: Option<Box<dyn MatcherBackend>>,
}

impl ModelSnapshot {
    pub fn gallery(&self) -> &GalleryStore {
        &self.gallery
    }

    pub fn is_available(&self) -> bool {
        self.matcher.is_some()
    }
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub label: u32,
    pub samples: usize,
}

pub struct FaceRecognizer {
    config: RecognitionConfig,
    detector: Mutex<FaceDetector>,
    files: Option<GalleryFiles>,
    current: RwLock<Arc<ModelSnapshot>>,
    enroll_lock: Mutex<()>,
}

impl FaceRecognizer {
    /// Recognizer with an empty gallery and no persistence.
    pub fn new(
        config: RecognitionConfig,
        detector: FaceDetector,
        matcher: Box<dyn MatcherBackend>,
    ) -> Self {
        Self::with_snapshot(
            config,
            detector,
            None,
            ModelSnapshot {
                gallery: GalleryStore::new(),
                matcher: Some(matcher),
            },
        )
    }

    /// Load gallery and model from `files`.
    ///
    /// A missing or unreadable model leaves recognition unavailable: every
    /// face is reported as unknown and enrollment is refused, since training
    /// from scratch would silently drop the enrolled identities.
    pub fn open(
        config: RecognitionConfig,
        detector: FaceDetector,
        files: GalleryFiles,
        mut matcher: Box<dyn MatcherBackend>,
    ) -> Result<Self, StorageError> {
        let (gallery, state) = files.load(matcher.as_mut())?;
        let matcher = match state {
            ModelState::Fresh | ModelState::Loaded => Some(matcher),
            ModelState::Missing => {
                tracing::error!(path = %files.model_path().display(), "model file missing; recognition unavailable");
                None
            }
            ModelState::Corrupt(e) => {
                tracing::error!(error = %e, "model file unreadable; recognition unavailable");
                None
            }
        };
        tracing::info!(identities = gallery.len(), available = matcher.is_some(), "gallery loaded");
        Ok(Self::with_snapshot(
            config,
            detector,
            Some(files),
            ModelSnapshot { gallery, matcher },
        ))
    }

    fn with_snapshot(
        config: RecognitionConfig,
        detector: FaceDetector,
        files: Option<GalleryFiles>,
        snapshot: ModelSnapshot,
    ) -> Self {
        Self {
            config,
            detector: Mutex::new(detector),
            files,
            current: RwLock::new(Arc::new(snapshot)),
            enroll_lock: Mutex::new(()),
        }
    }

    /// The current model generation.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn identity(&self, identity_id: &str) -> Option<EnrolledIdentity> {
        self.snapshot().gallery.get(identity_id).cloned()
    }

    pub fn identities(&self) -> Vec<EnrolledIdentity> {
        self.snapshot().gallery.list().cloned().collect()
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<BoundingBox> {
        self.detector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .detect(image)
    }

    /// Crop, resize to the configured square and histogram-equalize.
    pub fn normalize(&self, image: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
        normalize(image, face, self.config.face_size)
    }

    /// Enroll a new identity from a batch of frames.
    ///
    /// The first detected face of each frame becomes a sample, up to the
    /// per-identity cap. The gallery is unchanged on any error.
    pub fn enroll(
        &self,
        identity: NewIdentity,
        frames: &[GrayImage],
    ) -> Result<Enrollment, AttendError> {
        let _enrolling = self.enroll_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.snapshot();

        if current.gallery.contains(&identity.identity_id) {
            return Err(AttendError::DuplicateIdentity(identity.identity_id));
        }
        let Some(matcher) = current.matcher.as_ref() else {
            return Err(AttendError::RecognitionUnavailable);
        };

        let samples = self.collect_samples(frames);
        if samples.len() < self.config.min_samples {
            tracing::info!(
                identity = %identity.identity_id,
                found = samples.len(),
                "enrollment rejected: not enough face samples"
            );
            return Err(AttendError::InsufficientSamples {
                found: samples.len(),
                required: self.config.min_samples,
            });
        }

        let mut gallery = current.gallery.clone();
        let identity_id = identity.identity_id.clone();
        let label = gallery.add(identity)?;
        let labels = vec![label; samples.len()];

        let mut next = matcher.snapshot();
        let trained = if next.is_trained() {
            next.update(&samples, &labels)
        } else {
            next.train(&samples, &labels)
        };
        if let Err(e) = trained {
            tracing::error!(error = %e, identity = %identity_id, "matcher training failed");
            return Err(AttendError::RecognitionUnavailable);
        }

        if let Some(files) = &self.files {
            if let Err(e) = files.save(&gallery, next.as_ref()) {
                tracing::error!(error = %e, "gallery save failed; keeping in-memory state");
            }
        }

        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(ModelSnapshot {
            gallery,
            matcher: Some(next),
        });
        tracing::info!(identity = %identity_id, label, samples = samples.len(), "identity enrolled");
        Ok(Enrollment {
            label,
            samples: samples.len(),
        })
    }

    fn collect_samples(&self, frames: &[GrayImage]) -> Vec<GrayImage> {
        let mut samples = Vec::new();
        for frame in frames {
            if samples.len() >= self.config.max_samples_per_identity {
                break;
            }
            let faces = self.detect(frame);
            match faces.first().and_then(|f| self.normalize(frame, f)) {
                Some(sample) => samples.push(sample),
                None => tracing::debug!("no usable face in enrollment frame"),
            }
        }
        samples
    }

    /// Identify one face region. An empty gallery or an unavailable matcher
    /// yields "no match" without querying the matcher.
    pub fn recognize(&self, image: &GrayImage, face: &BoundingBox) -> FaceMatch {
        let snapshot = self.snapshot();
        if snapshot.gallery.is_empty() {
            return FaceMatch::unknown();
        }
        let Some(matcher) = snapshot.matcher.as_ref() else {
            return FaceMatch::unknown();
        };
        let Some(sample) = self.normalize(image, face) else {
            return FaceMatch::unknown();
        };
        let Some((label, distance)) = matcher.predict(&sample) else {
            return FaceMatch::unknown();
        };

        if distance >= self.config.match_threshold {
            tracing::debug!(label, distance, "prediction above threshold");
            return FaceMatch::unknown();
        }
        match snapshot.gallery.resolve(label) {
            Some(identity) => FaceMatch {
                identity_id: Some(identity.identity_id.clone()),
                display_name: Some(identity.display_name.clone()),
                confidence: distance_to_confidence(distance),
            },
            None => {
                tracing::warn!(label, "matcher label has no gallery identity");
                FaceMatch::unknown()
            }
        }
    }

    /// Persist the current generation.
    pub fn save(&self) -> Result<(), StorageError> {
        let snapshot = self.snapshot();
        match (&self.files, &snapshot.matcher) {
            (Some(files), Some(matcher)) => files.save(&snapshot.gallery, matcher.as_ref()),
            _ => Ok(()),
        }
    }
}

/// `max(0, 100 - distance)`, rounded.
pub fn distance_to_confidence(distance: f64) -> u8 {
    (100.0 - distance).clamp(0.0, 100.0).round() as u8
}

pub fn normalize(image: &GrayImage, face: &BoundingBox, size: u32) -> Option<GrayImage> {
    let (x, y, w, h) = face.clip(image.width(), image.height())?;
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    let resized = if (w, h) == (size, size) {
        crop
    } else {
        imageops::resize(&crop, size, size, FilterType::Triangle)
    };
    Some(imageproc::contrast::equalize_histogram(&resized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectParams, DetectorBackend, DetectorError};
    use crate::matcher::LbphMatcher;
    use chrono::Local;
    use image::Luma;

    /// Reports one face covering the whole frame, unless the frame is flat.
    struct WholeFrame;

    impl DetectorBackend for WholeFrame {
        fn detect(
            &mut self,
            image: &GrayImage,
            _: &DetectParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            let first = image.get_pixel(0, 0).0[0];
            if image.pixels().all(|p| p.0[0] == first) {
                return Ok(Vec::new());
            }
            let (w, h) = image.dimensions();
            Ok(vec![BoundingBox::new(0.0, 0.0, w as f32, h as f32, 0.99)])
        }
    }

    fn texture(seed: u32, offset: u8) -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| {
            let mut v = x.wrapping_mul(7919) ^ y.wrapping_mul(104_729) ^ seed.wrapping_mul(31_337);
            v ^= v >> 13;
            v = v.wrapping_mul(0x5bd1_e995);
            v ^= v >> 15;
            Luma([40 + (v % 160) as u8 + offset])
        })
    }

    fn gradient() -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| Luma([((x + y) * 255 / 200) as u8]))
    }

    fn recognizer() -> FaceRecognizer {
        FaceRecognizer::new(
            RecognitionConfig::default(),
            FaceDetector::new(Box::new(WholeFrame)),
            Box::new(LbphMatcher::default()),
        )
    }

    fn identity(id: &str, name: &str) -> NewIdentity {
        NewIdentity {
            identity_id: id.into(),
            display_name: name.into(),
            department: String::new(),
            fingerprint_hash: "fp".into(),
            enrolled_at: Local::now(),
        }
    }

    fn whole(img: &GrayImage) -> BoundingBox {
        BoundingBox::new(0.0, 0.0, img.width() as f32, img.height() as f32, 1.0)
    }

    #[test]
    fn test_enroll_then_recognize_held_out() {
        let r = recognizer();
        let frames = [texture(1, 0), texture(1, 5), texture(1, 10)];
        let e = r.enroll(identity("S1", "Alice"), &frames).unwrap();
        assert_eq!(e, Enrollment { label: 0, samples: 3 });

        let held_out = texture(1, 20);
        let m = r.recognize(&held_out, &whole(&held_out));
        assert_eq!(m.identity_id.as_deref(), Some("S1"));
        assert_eq!(m.display_name.as_deref(), Some("Alice"));
        assert!(m.confidence > 0);
    }

    #[test]
    fn test_insufficient_samples_leaves_gallery_unchanged() {
        let r = recognizer();
        let black = GrayImage::new(100, 100);
        let frames = [texture(1, 0), black.clone(), texture(1, 5), black];
        let err = r.enroll(identity("S1", "Alice"), &frames).unwrap_err();
        assert!(matches!(
            err,
            AttendError::InsufficientSamples { found: 2, required: 3 }
        ));
        assert!(r.snapshot().gallery().is_empty());
        assert_eq!(r.snapshot().gallery().next_label(), 0);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let r = recognizer();
        let frames = [texture(1, 0), texture(1, 5), texture(1, 10)];
        r.enroll(identity("S1", "Alice"), &frames).unwrap();
        let err = r.enroll(identity("S1", "Again"), &frames).unwrap_err();
        assert!(matches!(err, AttendError::DuplicateIdentity(_)));
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let r = recognizer();
        let img = texture(1, 0);
        assert_eq!(r.recognize(&img, &whole(&img)), FaceMatch::unknown());
    }

    #[test]
    fn test_stranger_is_unknown() {
        let r = recognizer();
        r.enroll(identity("S1", "Alice"), &[texture(1, 0), texture(1, 5), texture(1, 10)])
            .unwrap();
        let stranger = gradient();
        assert!(!r.recognize(&stranger, &whole(&stranger)).is_match());
    }

    #[test]
    fn test_second_enrollment_updates_incrementally() {
        let r = recognizer();
        r.enroll(identity("S1", "Alice"), &[texture(1, 0), texture(1, 5), texture(1, 10)])
            .unwrap();
        let e = r
            .enroll(identity("S2", "Bob"), &[texture(2, 0), texture(2, 5), texture(2, 10)])
            .unwrap();
        assert_eq!(e.label, 1);

        let alice = texture(1, 15);
        let bob = texture(2, 15);
        assert_eq!(r.recognize(&alice, &whole(&alice)).identity_id.as_deref(), Some("S1"));
        assert_eq!(r.recognize(&bob, &whole(&bob)).identity_id.as_deref(), Some("S2"));
    }

    #[test]
    fn test_samples_capped_per_identity() {
        let r = recognizer();
        let frames: Vec<GrayImage> = (0..30).map(|i| texture(3, i as u8)).collect();
        let e = r.enroll(identity("S3", "Carol"), &frames).unwrap();
        assert_eq!(e.samples, 20);
    }

    #[test]
    fn test_persisted_model_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            FaceRecognizer::open(
                RecognitionConfig::default(),
                FaceDetector::new(Box::new(WholeFrame)),
                GalleryFiles::new(dir.path()),
                Box::new(LbphMatcher::default()),
            )
            .unwrap()
        };
        open()
            .enroll(identity("S1", "Alice"), &[texture(1, 0), texture(1, 5), texture(1, 10)])
            .unwrap();

        let reloaded = open();
        let img = texture(1, 20);
        assert_eq!(reloaded.recognize(&img, &whole(&img)).identity_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_missing_model_disables_enrollment() {
        let dir = tempfile::tempdir().unwrap();
        let files = GalleryFiles::new(dir.path());
        let r = FaceRecognizer::open(
            RecognitionConfig::default(),
            FaceDetector::new(Box::new(WholeFrame)),
            files.clone(),
            Box::new(LbphMatcher::default()),
        )
        .unwrap();
        r.enroll(identity("S1", "Alice"), &[texture(1, 0), texture(1, 5), texture(1, 10)])
            .unwrap();
        std::fs::remove_file(files.model_path()).unwrap();

        let degraded = FaceRecognizer::open(
            RecognitionConfig::default(),
            FaceDetector::new(Box::new(WholeFrame)),
            files,
            Box::new(LbphMatcher::default()),
        )
        .unwrap();
        assert!(!degraded.snapshot().is_available());
        let img = texture(1, 0);
        assert!(!degraded.recognize(&img, &whole(&img)).is_match());
        let err = degraded
            .enroll(identity("S2", "Bob"), &[texture(2, 0), texture(2, 5), texture(2, 10)])
            .unwrap_err();
        assert!(matches!(err, AttendError::RecognitionUnavailable));
    }

    #[test]
    fn test_confidence_mapping() {
        assert_eq!(distance_to_confidence(0.0), 100);
        assert_eq!(distance_to_confidence(79.6), 20);
        assert_eq!(distance_to_confidence(150.0), 0);
    }

    #[test]
    fn test_normalize_fixed_size() {
        let img = GrayImage::from_pixel(240, 180, Luma([90]));
        let face = BoundingBox::new(20.0, 10.0, 150.0, 150.0, 1.0);
        let s = normalize(&img, &face, 100).unwrap();
        assert_eq!(s.dimensions(), (100, 100));
        assert!(normalize(&img, &BoundingBox::new(500.0, 0.0, 10.0, 10.0, 1.0), 100).is_none());
    }
}
