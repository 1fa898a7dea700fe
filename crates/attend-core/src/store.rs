//! Co-located persistence for the gallery (`gallery.json`) and the matcher
//! model (`model.bin`).
//!
//! Both are written to `.tmp` staging files first, then renamed model-first,
//! gallery-second. A crash between the renames leaves a model that knows one
//! label the gallery does not; that label resolves to nobody, so recognition
//! reports "no match" for it rather than a wrong identity.

use crate::error::StorageError;
use crate::gallery::GalleryStore;
use crate::matcher::MatcherBackend;
use std::path::{Path, PathBuf};

pub const GALLERY_FILE: &str = "gallery.json";
pub const MODEL_FILE: &str = "model.bin";

/// State of the matcher after [`GalleryFiles::load`].
#[derive(Debug)]
pub enum ModelState {
    /// Nothing on disk; the matcher is untouched.
    Fresh,
    Loaded,
    /// Gallery has identities but the model file is absent.
    Missing,
    Corrupt(StorageError),
}

#[derive(Debug, Clone)]
pub struct GalleryFiles {
    dir: PathBuf,
}

impl GalleryFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn gallery_path(&self) -> PathBuf {
        self.dir.join(GALLERY_FILE)
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    /// Persist gallery and model together.
    pub fn save(
        &self,
        gallery: &GalleryStore,
        model: &dyn MatcherBackend,
    ) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;

        let gallery_path = self.gallery_path();
        let gallery_tmp = staging(&gallery_path);
        let json = serde_json::to_vec_pretty(gallery)?;
        std::fs::write(&gallery_tmp, json).map_err(|e| StorageError::io(&gallery_tmp, e))?;

        if model.is_trained() {
            let model_path = self.model_path();
            let model_tmp = staging(&model_path);
            model.write(&model_tmp)?;
            std::fs::rename(&model_tmp, &model_path)
                .map_err(|e| StorageError::io(&model_path, e))?;
        }
        std::fs::rename(&gallery_tmp, &gallery_path)
            .map_err(|e| StorageError::io(&gallery_path, e))?;

        tracing::debug!(dir = %self.dir.display(), identities = gallery.len(), "gallery saved");
        Ok(())
    }

    /// Load the gallery and read the model into `model` when present.
    ///
    /// A missing or unreadable gallery file is an error only when it exists
    /// and cannot be parsed; the model's condition is reported separately.
    pub fn load(
        &self,
        model: &mut dyn MatcherBackend,
    ) -> Result<(GalleryStore, ModelState), StorageError> {
        let gallery_path = self.gallery_path();
        let model_path = self.model_path();

        let mut gallery = if gallery_path.exists() {
            let bytes =
                std::fs::read(&gallery_path).map_err(|e| StorageError::io(&gallery_path, e))?;
            serde_json::from_slice::<GalleryStore>(&bytes)?
        } else {
            GalleryStore::new()
        };
        gallery.repair_counter();

        let state = if model_path.exists() {
            match model.read(&model_path) {
                Ok(()) => ModelState::Loaded,
                Err(e) => ModelState::Corrupt(e.into()),
            }
        } else if gallery.is_empty() {
            ModelState::Fresh
        } else {
            ModelState::Missing
        };

        if matches!(state, ModelState::Loaded) {
            let orphans: Vec<u32> = model
                .labels()
                .into_iter()
                .filter(|l| gallery.resolve(*l).is_none())
                .collect();
            if !orphans.is_empty() {
                tracing::warn!(?orphans, "model labels without a gallery identity; they will never match");
            }
        }

        Ok((gallery, state))
    }
}

fn staging(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::NewIdentity;
    use crate::matcher::LbphMatcher;
    use chrono::Local;
    use image::{GrayImage, Luma};

    fn sample(v: u8) -> GrayImage {
        GrayImage::from_fn(20, 20, |x, y| Luma([v.wrapping_add((x * 3 + y * 5) as u8)]))
    }

    fn enrolled() -> (GalleryStore, LbphMatcher) {
        let mut g = GalleryStore::new();
        g.add(NewIdentity {
            identity_id: "S1".into(),
            display_name: "Alice".into(),
            department: "CS".into(),
            fingerprint_hash: "abc".into(),
            enrolled_at: Local::now(),
        })
        .unwrap();
        let mut m = LbphMatcher::default();
        m.train(&[sample(10)], &[0]).unwrap();
        (g, m)
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = GalleryFiles::new(dir.path());
        let (g, m) = enrolled();
        files.save(&g, &m).unwrap();
        assert!(!staging(&files.gallery_path()).exists());

        let mut m2 = LbphMatcher::default();
        let (g2, state) = files.load(&mut m2).unwrap();
        assert!(matches!(state, ModelState::Loaded));
        assert_eq!(g2.get("S1").unwrap().display_name, "Alice");
        assert_eq!(g2.next_label(), 1);
        assert_eq!(m2.sample_count(), 1);
    }

    #[test]
    fn test_load_empty_dir_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = LbphMatcher::default();
        let (g, state) = GalleryFiles::new(dir.path()).load(&mut m).unwrap();
        assert!(g.is_empty());
        assert!(matches!(state, ModelState::Fresh));
    }

    #[test]
    fn test_missing_model_reported() {
        let dir = tempfile::tempdir().unwrap();
        let files = GalleryFiles::new(dir.path());
        let (g, m) = enrolled();
        files.save(&g, &m).unwrap();
        std::fs::remove_file(files.model_path()).unwrap();

        let (_, state) = files.load(&mut LbphMatcher::default()).unwrap();
        assert!(matches!(state, ModelState::Missing));
    }

    #[test]
    fn test_corrupt_model_reported() {
        let dir = tempfile::tempdir().unwrap();
        let files = GalleryFiles::new(dir.path());
        let (g, m) = enrolled();
        files.save(&g, &m).unwrap();
        std::fs::write(files.model_path(), b"not a model").unwrap();

        let (g2, state) = files.load(&mut LbphMatcher::default()).unwrap();
        assert_eq!(g2.len(), 1);
        assert!(matches!(state, ModelState::Corrupt(_)));
    }
}
