//! Enrolled identities and their matcher labels.

use crate::error::AttendError;
use crate::types::EnrolledIdentity;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity ↔ label mapping. Labels come from a persisted monotonic counter
/// and are never handed out twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryStore {
    identities: BTreeMap<String, EnrolledIdentity>,
    labels: BTreeMap<u32, String>,
    #[serde(default)]
    next_label: u32,
}

/// Fields supplied by the enrolling caller.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub department: String,
    pub fingerprint_hash: String,
    pub enrolled_at: DateTime<Local>,
}

impl GalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label the next `add` will assign.
    pub fn next_label(&self) -> u32 {
        self.next_label
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.identities.contains_key(identity_id)
    }

    /// Register an identity and allocate its label.
    pub fn add(&mut self, new: NewIdentity) -> Result<u32, AttendError> {
        if self.contains(&new.identity_id) {
            return Err(AttendError::DuplicateIdentity(new.identity_id));
        }
        let label = self.next_label;
        self.next_label += 1;
        self.labels.insert(label, new.identity_id.clone());
        self.identities.insert(
            new.identity_id.clone(),
            EnrolledIdentity {
                identity_id: new.identity_id,
                display_name: new.display_name,
                department: new.department,
                label,
                fingerprint_hash: new.fingerprint_hash,
                enrolled_at: new.enrolled_at,
            },
        );
        Ok(label)
    }

    pub fn resolve(&self, label: u32) -> Option<&EnrolledIdentity> {
        self.labels
            .get(&label)
            .and_then(|id| self.identities.get(id))
    }

    pub fn get(&self, identity_id: &str) -> Option<&EnrolledIdentity> {
        self.identities.get(identity_id)
    }

    pub fn list(&self) -> impl Iterator<Item = &EnrolledIdentity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Re-derive the counter after loading a file written without one, so
    /// it is always above every stored label.
    pub(crate) fn repair_counter(&mut self) {
        let floor = self.labels.keys().next_back().map_or(0, |l| l + 1);
        if self.next_label < floor {
            tracing::warn!(stored = self.next_label, floor, "gallery label counter behind labels; repaired");
            self.next_label = floor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_identity(id: &str) -> NewIdentity {
        NewIdentity {
            identity_id: id.into(),
            display_name: format!("Name {id}"),
            department: String::new(),
            fingerprint_hash: "fp".into(),
            enrolled_at: Local::now(),
        }
    }

    #[test]
    fn test_labels_start_at_zero_and_increase() {
        let mut g = GalleryStore::new();
        assert_eq!(g.add(new_identity("S1")).unwrap(), 0);
        assert_eq!(g.add(new_identity("S2")).unwrap(), 1);
        assert_eq!(g.next_label(), 2);
        assert_eq!(g.resolve(1).unwrap().identity_id, "S2");
        assert!(g.resolve(2).is_none());
    }

    #[test]
    fn test_duplicate_rejected_and_counter_untouched() {
        let mut g = GalleryStore::new();
        g.add(new_identity("S1")).unwrap();
        let err = g.add(new_identity("S1")).unwrap_err();
        assert!(matches!(err, AttendError::DuplicateIdentity(id) if id == "S1"));
        assert_eq!(g.next_label(), 1);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_repair_counter_after_legacy_load() {
        let json = r#"{"identities":{},"labels":{"4":"X"}}"#;
        let mut g: GalleryStore = serde_json::from_str(json).unwrap();
        g.repair_counter();
        assert_eq!(g.next_label(), 5);
    }
}
