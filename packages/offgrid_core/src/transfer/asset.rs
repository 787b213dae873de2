//! Per-asset metadata files (`{asset_id}_meta.json`)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::placement::StorageMode;
use super::TransferError;
use crate::erasure::ErasureMeta;
use crate::persist;

/// `"asset-"` plus the first 16 hex digits of the content's SHA-256.
pub fn default_asset_id(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    format!("asset-{}", &digest[..16])
}

/// Asset ids become file names on hosts and here.
pub fn validate_asset_id(asset_id: &str) -> Result<(), TransferError> {
    let ok = !asset_id.is_empty()
        && asset_id.len() <= 200
        && !asset_id.starts_with('.')
        && asset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(TransferError::InvalidAsset(format!("bad asset id {:?}", asset_id)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMeta {
    #[serde(flatten)]
    pub mode: StorageMode,
    pub orig_len: usize,
    /// Present for erasure-coded assets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erasure: Option<ErasureMeta>,
}

/// What a downloader needs to find and rebuild an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub asset_id: String,
    pub meta: AssetMeta,
    /// Endpoint holding shard `i`
    pub endpoints: Vec<String>,
    pub created_ts: i64,
}

#[derive(Debug, Clone)]
pub struct AssetStore {
    dir: PathBuf,
}

impl AssetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self, asset_id: &str) -> PathBuf {
        self.dir.join(format!("{}_meta.json", asset_id))
    }

    pub fn manifest_path(&self, asset_id: &str) -> PathBuf {
        self.dir.join(format!("{}_upload.json", asset_id))
    }

    pub fn save(&self, record: &AssetRecord) -> Result<(), TransferError> {
        validate_asset_id(&record.asset_id)?;
        persist::write_json_atomic(&self.meta_path(&record.asset_id), record)?;
        Ok(())
    }

    pub fn load(&self, asset_id: &str) -> Result<AssetRecord, TransferError> {
        validate_asset_id(asset_id)?;
        let path = self.meta_path(asset_id);
        if !path.exists() {
            return Err(TransferError::InvalidAsset(format!("no metadata for {}", asset_id)));
        }
        Ok(persist::read_json(&path)?)
    }
}
