//! Bulk enrollment from a folder-per-person photo tree.
//!
//! ```text
//! root/
//!   alice smith/  *.jpg | *.jpeg | *.png
//!   bob/          ...
//!   _unsorted/    skipped
//! ```

use crate::error::{AttendError, StorageError};
use crate::gallery::NewIdentity;
use crate::recognizer::FaceRecognizer;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const IMPORTED_DEPARTMENT: &str = "Imported";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Identity ids created.
    pub imported: Vec<String>,
    /// Folder names that produced no identity.
    pub skipped: Vec<String>,
}

/// Enroll every person folder under `root`. `new_identity` fills in the
/// fields the folder cannot provide from `(identity_id, display_name)`.
/// Images are read in name order until `max_faces` of them show a face.
pub fn import_folder(
    root: &Path,
    recognizer: &FaceRecognizer,
    new_identity: &dyn Fn(&str, &str) -> NewIdentity,
    max_faces: usize,
) -> Result<ImportSummary, AttendError> {
    let mut people: Vec<PathBuf> = std::fs::read_dir(root)
        .map_err(|e| StorageError::io(root, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter(|p| !folder_name(p).starts_with('_'))
        .collect();
    people.sort();

    let mut summary = ImportSummary::default();
    for folder in people {
        let folder_label = folder_name(&folder);
        let display_name = title_case(&folder_label);
        let gallery_len = recognizer.snapshot().gallery().len();
        let identity_id = imported_id(&display_name, gallery_len + 1);

        let frames = load_faces(&folder, recognizer, max_faces);
        let identity = new_identity(&identity_id, &display_name);
        match recognizer.enroll(identity, &frames) {
            Ok(e) => {
                tracing::info!(identity = %identity_id, name = %display_name, samples = e.samples, "imported");
                summary.imported.push(identity_id);
            }
            Err(AttendError::RecognitionUnavailable) => {
                return Err(AttendError::RecognitionUnavailable);
            }
            Err(e) => {
                tracing::info!(folder = %folder_label, error = %e, "import skipped");
                summary.skipped.push(folder_label);
            }
        }
    }
    Ok(summary)
}

fn folder_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn load_faces(folder: &Path, recognizer: &FaceRecognizer, limit: usize) -> Vec<GrayImage> {
    let Ok(entries) = std::fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| IMAGE_EXTENSIONS.contains(&x.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();

    files
        .iter()
        .filter_map(|p| match image::open(p) {
            Ok(img) => Some(img.to_luma8()),
            Err(e) => {
                tracing::debug!(path = %p.display(), error = %e, "unreadable image skipped");
                None
            }
        })
        .filter(|img| !recognizer.detect(img).is_empty())
        .take(limit)
        .collect()
}

/// Capitalize the first letter of every alphabetic run, lowercase the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

/// First three characters of the upper-cased name plus a 3-digit sequence.
pub fn imported_id(display_name: &str, sequence: usize) -> String {
    let prefix: String = display_name.to_uppercase().chars().take(3).collect();
    format!("{prefix}{sequence:03}")
}
