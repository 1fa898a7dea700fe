//! Open-eye probe for blink liveness.
//!
//! An open eye shows a dark iris and pupil against the sclera, so the patch
//! around it has high intensity spread. A closed lid is mostly uniform skin.

use crate::detector::EyeDetector;
use crate::types::BoundingBox;
use image::GrayImage;

/// Eye patch width as a fraction of face width.
const EYE_REGION_WIDTH_RATIO: f32 = 0.25;
/// Eye patch height as a fraction of face height.
const EYE_REGION_HEIGHT_RATIO: f32 = 0.15;
/// Eye centres used when the detector gives no landmarks, as face-box fractions.
const FALLBACK_EYE_CENTRES: [(f32, f32); 2] = [(0.30, 0.38), (0.70, 0.38)];
const DEFAULT_MIN_STDDEV: f32 = 18.0;

#[derive(Debug, Clone)]
pub struct ContrastEyeDetector {
    min_stddev: f32,
}

impl Default for ContrastEyeDetector {
    fn default() -> Self {
        Self {
            min_stddev: DEFAULT_MIN_STDDEV,
        }
    }
}

impl ContrastEyeDetector {
    pub fn with_min_stddev(min_stddev: f32) -> Self {
        Self { min_stddev }
    }

    fn eye_centres(face: &BoundingBox) -> [(f32, f32); 2] {
        match face.landmarks {
            Some(lm) => [lm[0], lm[1]],
            None => FALLBACK_EYE_CENTRES
                .map(|(fx, fy)| (face.x + fx * face.width, face.y + fy * face.height)),
        }
    }
}

impl EyeDetector for ContrastEyeDetector {
    fn count_eyes(&mut self, image: &GrayImage, face: &BoundingBox) -> usize {
        let pw = (face.width * EYE_REGION_WIDTH_RATIO).max(2.0);
        let ph = (face.height * EYE_REGION_HEIGHT_RATIO).max(2.0);

        Self::eye_centres(face)
            .iter()
            .filter(|(cx, cy)| {
                let patch = BoundingBox::new(cx - pw / 2.0, cy - ph / 2.0, pw, ph, 1.0);
                patch_stddev(image, &patch).is_some_and(|sd| sd >= self.min_stddev)
            })
            .count()
    }
}

fn patch_stddev(image: &GrayImage, patch: &BoundingBox) -> Option<f32> {
    let (x, y, w, h) = patch.clip(image.width(), image.height())?;
    let n = (w * h) as f32;
    let mut sum = 0.0f32;
    let mut sum_sq = 0.0f32;
    for py in y..y + h {
        for px in x..x + w {
            let v = image.get_pixel(px, py).0[0] as f32;
            sum += v;
            sum_sq += v * v;
        }
    }
    let mean = sum / n;
    Some((sum_sq / n - mean * mean).max(0.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn face_image(open: [bool; 2]) -> GrayImage {
        let mut img = GrayImage::from_pixel(100, 100, Luma([150]));
        for (i, (fx, fy)) in FALLBACK_EYE_CENTRES.iter().enumerate() {
            if !open[i] {
                continue;
            }
            let (cx, cy) = (fx * 100.0, fy * 100.0);
            for y in 0..100u32 {
                for x in 0..100u32 {
                    let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
                    if d <= 6.0 {
                        img.put_pixel(x, y, Luma([30]));
                    }
                }
            }
        }
        img
    }

    fn face_box() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 100.0, 100.0, 1.0)
    }

    #[test]
    fn test_both_eyes_open() {
        let mut det = ContrastEyeDetector::default();
        assert_eq!(det.count_eyes(&face_image([true, true]), &face_box()), 2);
    }

    #[test]
    fn test_eyes_closed() {
        let mut det = ContrastEyeDetector::default();
        assert_eq!(det.count_eyes(&face_image([false, false]), &face_box()), 0);
    }

    #[test]
    fn test_one_eye_open() {
        let mut det = ContrastEyeDetector::default();
        assert_eq!(det.count_eyes(&face_image([true, false]), &face_box()), 1);
    }

    #[test]
    fn test_landmarks_override_fallback_centres() {
        let img = face_image([true, true]);
        let mut face = face_box();
        // Point both landmarks at flat cheek skin.
        face.landmarks = Some([(30.0, 80.0), (70.0, 80.0), (50.0, 60.0), (35.0, 90.0), (65.0, 90.0)]);
        let mut det = ContrastEyeDetector::default();
        assert_eq!(det.count_eyes(&img, &face), 0);
    }

    #[test]
    fn test_face_outside_image() {
        let mut det = ContrastEyeDetector::default();
        let face = BoundingBox::new(500.0, 500.0, 100.0, 100.0, 1.0);
        assert_eq!(det.count_eyes(&face_image([true, true]), &face), 0);
    }
}
