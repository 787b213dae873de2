//! Signed usage receipts and Merkle-rooted batches
//!
//! Hosts write one receipt per job into `receipts/`. A batch is every
//! unsettled receipt in file order plus the Merkle root over them; once a
//! batch is settled its files move to `receipts/settled/`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::{validate_name, LedgerError};
use crate::identity::{verify_b64, IdentityError, NodeIdentity};
use crate::persist;

pub const RECEIPT_VERSION: &str = "0.2";
const SETTLED_DIR: &str = "settled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Units are millions of inference tokens
    Compute,
    /// Units are GB-hours
    Storage,
    /// Units are GB moved
    Transfer,
}

impl std::str::FromStr for ResourceType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compute" => Ok(ResourceType::Compute),
            "storage" => Ok(ResourceType::Storage),
            "transfer" => Ok(ResourceType::Transfer),
            other => Err(LedgerError::InvalidName(format!("unknown resource type {}", other))),
        }
    }
}

/// Receipt fields covered by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptBody {
    pub version: String,
    pub cluster_id: String,
    pub ts: i64,
    pub node_id: String,
    pub job_id: String,
    pub resource_type: ResourceType,
    pub units: f64,
    #[serde(default)]
    pub metrics: serde_json::Value,
    pub nonce: u32,
    pub sig_algo: String,
    pub verify_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReceipt {
    #[serde(flatten)]
    pub body: ReceiptBody,
    pub sig: String,
}

impl UsageReceipt {
    pub fn verify(&self) -> Result<(), LedgerError> {
        let payload = persist::canonical_json(&self.body)?;
        verify_b64(&self.body.verify_key, &payload, &self.sig).map_err(|e| match e {
            IdentityError::AuthenticationFailed(m) => LedgerError::InvalidSignature(m),
            other => LedgerError::Identity(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptBatch {
    pub version: String,
    pub cluster_id: String,
    pub count: usize,
    pub root: String,
    pub items: Vec<UsageReceipt>,
    /// File names the items were read from, for archiving
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Pairwise SHA-256 Merkle root over hex leaves. An odd node is carried up
/// unchanged; the empty tree hashes to `sha256("empty")`.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return sha256_hex(b"empty");
    }
    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            match pair {
                [a, b] => next.push(sha256_hex(format!("{}{}", a, b).as_bytes())),
                [odd] => next.push(odd.clone()),
                _ => {}
            }
        }
        level = next;
    }
    level.swap_remove(0)
}

/// Leaf hash of a receipt.
pub fn receipt_leaf(receipt: &UsageReceipt) -> Result<String, LedgerError> {
    Ok(sha256_hex(&persist::canonical_json(receipt)?))
}

pub struct ReceiptStore {
    dir: PathBuf,
    cluster_id: String,
}

impl ReceiptStore {
    pub fn new(dir: impl Into<PathBuf>, cluster_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            cluster_id: cluster_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create_usage_receipt(
        &self,
        identity: &NodeIdentity,
        node_id: &str,
        job_id: &str,
        resource_type: ResourceType,
        units: f64,
        metrics: serde_json::Value,
    ) -> Result<UsageReceipt, LedgerError> {
        validate_name(job_id)?;
        if !units.is_finite() || units < 0.0 {
            return Err(LedgerError::InvalidAmount(format!("units={}", units)));
        }
        let body = ReceiptBody {
            version: RECEIPT_VERSION.to_string(),
            cluster_id: self.cluster_id.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
            node_id: node_id.to_string(),
            job_id: job_id.to_string(),
            resource_type,
            units,
            metrics,
            nonce: rand::thread_rng().gen_range(0..i32::MAX as u32),
            sig_algo: "Ed25519".to_string(),
            verify_key: identity.verify_key_b64(),
        };
        let sig = identity.sign_b64(&persist::canonical_json(&body)?);
        let receipt = UsageReceipt { body, sig };

        let name = format!("{}_{}.json", receipt.body.ts, job_id);
        persist::write_json_atomic(&self.dir.join(name), &receipt)?;
        log::debug!("receipt {} for node {}: {} {:?}", job_id, node_id, units, resource_type);
        Ok(receipt)
    }

    fn pending_files(&self) -> Result<Vec<String>, LedgerError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| LedgerError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::Io(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Up to `limit` unsettled receipts, oldest first, with their root.
    pub fn export_batch(&self, limit: usize) -> Result<ReceiptBatch, LedgerError> {
        let mut files = self.pending_files()?;
        files.truncate(limit);

        let mut items = Vec::with_capacity(files.len());
        let mut leaves = Vec::with_capacity(files.len());
        for name in &files {
            let receipt: UsageReceipt = persist::read_json(&self.dir.join(name))?;
            leaves.push(receipt_leaf(&receipt)?);
            items.push(receipt);
        }

        Ok(ReceiptBatch {
            version: RECEIPT_VERSION.to_string(),
            cluster_id: self.cluster_id.clone(),
            count: items.len(),
            root: merkle_root(&leaves),
            items,
            files,
        })
    }

    /// Move a settled batch's receipts out of the pending set.
    pub fn archive(&self, batch: &ReceiptBatch) -> Result<(), LedgerError> {
        let settled = self.dir.join(SETTLED_DIR);
        std::fs::create_dir_all(&settled).map_err(|e| LedgerError::Io(e.to_string()))?;
        for name in &batch.files {
            validate_name(name)?;
            let from = self.dir.join(name);
            if from.exists() {
                std::fs::rename(&from, settled.join(name)).map_err(|e| LedgerError::Io(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_shapes() {
        assert_eq!(merkle_root(&[]), sha256_hex(b"empty"));

        let a = sha256_hex(b"a");
        let b = sha256_hex(b"b");
        let c = sha256_hex(b"c");
        assert_eq!(merkle_root(&[a.clone()]), a);

        let ab = sha256_hex(format!("{}{}", a, b).as_bytes());
        assert_eq!(merkle_root(&[a.clone(), b.clone()]), ab);

        // odd node carried up
        let abc = sha256_hex(format!("{}{}", ab, c).as_bytes());
        assert_eq!(merkle_root(&[a, b, c]), abc);
    }

    #[test]
    fn test_receipts_signed_and_batched() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path().join("receipts"), "cluster-local");
        let node = NodeIdentity::generate("node-a");

        let r1 = store
            .create_usage_receipt(&node, "node-a", "job-1", ResourceType::Compute, 2.0, serde_json::json!({}))
            .unwrap();
        r1.verify().unwrap();
        store
            .create_usage_receipt(&node, "node-a", "job-2", ResourceType::Storage, 1.5, serde_json::json!({"gb": 1}))
            .unwrap();

        let batch = store.export_batch(100).unwrap();
        assert_eq!(batch.count, 2);
        assert_eq!(batch.files.len(), 2);
        let leaves: Vec<String> = batch.items.iter().map(|r| receipt_leaf(r).unwrap()).collect();
        assert_eq!(batch.root, merkle_root(&leaves));

        assert_eq!(store.export_batch(1).unwrap().count, 1);

        store.archive(&batch).unwrap();
        assert_eq!(store.export_batch(100).unwrap().count, 0);
    }

    #[test]
    fn test_tampered_receipt_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path(), "c");
        let node = NodeIdentity::generate("node-a");
        let mut receipt = store
            .create_usage_receipt(&node, "node-a", "job-1", ResourceType::Transfer, 1.0, serde_json::json!({}))
            .unwrap();
        receipt.body.units = 100.0;
        assert!(matches!(receipt.verify(), Err(LedgerError::InvalidSignature(_))));
    }

    #[test]
    fn test_job_id_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path(), "c");
        let node = NodeIdentity::generate("node-a");
        assert!(store
            .create_usage_receipt(&node, "node-a", "../evil", ResourceType::Compute, 1.0, serde_json::json!({}))
            .is_err());
    }
}
