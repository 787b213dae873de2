//! Resumable upload progress (`{asset_id}_upload.json`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::persist::{self, PersistError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadManifest {
    pub asset_id: String,
    /// Shard indices confirmed stored
    pub done: BTreeSet<usize>,
}

impl UploadManifest {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            done: BTreeSet::new(),
        }
    }

    /// Load progress for `asset_id`. A manifest left by a different asset
    /// under the same path is ignored.
    pub fn load(path: &Path, asset_id: &str) -> Result<Self, PersistError> {
        let manifest: Self = persist::read_json_or(path, || Self::new(asset_id))?;
        if manifest.asset_id != asset_id {
            log::warn!(
                "manifest {} belongs to {}, starting fresh",
                path.display(),
                manifest.asset_id
            );
            return Ok(Self::new(asset_id));
        }
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        persist::write_json_atomic(path, self)
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.done.contains(&index)
    }

    pub fn mark_done(&mut self, index: usize) -> bool {
        self.done.insert(index)
    }

    pub fn is_complete(&self, total: usize) -> bool {
        (0..total).all(|i| self.done.contains(&i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a_upload.json");

        let mut manifest = UploadManifest::load(&path, "a").unwrap();
        assert!(manifest.done.is_empty());
        manifest.mark_done(0);
        manifest.mark_done(2);
        manifest.save(&path).unwrap();

        let reloaded = UploadManifest::load(&path, "a").unwrap();
        assert!(reloaded.is_done(2));
        assert!(!reloaded.is_done(1));
        assert!(!reloaded.is_complete(3));

        let other = UploadManifest::load(&path, "b").unwrap();
        assert!(other.done.is_empty());
    }
}
