//! Per-node hash chain of settlement blocks
//!
//! Blocks live in `ledger/` as `{ts}_{hash}.json`. Each links to the newest
//! block this node knew of when it was appended. Chains from different nodes
//! are unioned file-by-file; diverging parents are never reconciled.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::{validate_name, LedgerError};
use crate::persist;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBlock {
    /// Unix milliseconds
    pub ts: i64,
    pub parent: Option<String>,
    pub merkle_root: String,
    pub count: usize,
    pub hash: String,
}

#[derive(Serialize)]
struct BlockHeader<'a> {
    ts: i64,
    parent: &'a Option<String>,
    merkle_root: &'a str,
    count: usize,
}

impl LedgerBlock {
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let header = BlockHeader {
            ts: self.ts,
            parent: &self.parent,
            merkle_root: &self.merkle_root,
            count: self.count,
        };
        Ok(hex::encode(Sha256::digest(&persist::canonical_json(&header)?)))
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.json", self.ts, self.hash)
    }
}

pub struct LocalDag {
    dir: PathBuf,
}

impl LocalDag {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Block file names, oldest first.
    pub fn list_blocks(&self) -> Result<Vec<String>, LedgerError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| LedgerError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::Io(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !name.ends_with(".tmp") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn read_block(&self, name: &str) -> Result<LedgerBlock, LedgerError> {
        validate_name(name)?;
        Ok(persist::read_json(&self.dir.join(name))?)
    }

    pub fn last_hash(&self) -> Result<Option<String>, LedgerError> {
        match self.list_blocks()?.last() {
            Some(name) => Ok(Some(self.read_block(name)?.hash)),
            None => Ok(None),
        }
    }

    /// The block recording the batch with this merkle root, if any.
    pub fn find_block(&self, merkle_root: &str) -> Result<Option<LedgerBlock>, LedgerError> {
        for name in self.list_blocks()? {
            let block = self.read_block(&name)?;
            if block.merkle_root == merkle_root {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Append a block for a settled receipt batch.
    pub fn append_block(&self, merkle_root: &str, count: usize) -> Result<LedgerBlock, LedgerError> {
        let mut block = LedgerBlock {
            ts: chrono::Utc::now().timestamp_millis(),
            parent: self.last_hash()?,
            merkle_root: merkle_root.to_string(),
            count,
            hash: String::new(),
        };
        block.hash = block.compute_hash()?;
        persist::write_json_atomic(&self.dir.join(block.file_name()), &block)?;
        log::info!("ledger block {} appended ({} receipts)", block.hash, count);
        Ok(block)
    }

    /// Accept a block from a peer. Returns `false` if already held.
    ///
    /// The hash must match the header and the name must be the block's own
    /// `{ts}_{hash}.json`.
    pub fn insert_block(&self, name: &str, block: &LedgerBlock) -> Result<bool, LedgerError> {
        validate_name(name)?;
        let expected = block.compute_hash()?;
        if expected != block.hash {
            log::warn!("security: rejected block {} with bad hash", name);
            return Err(LedgerError::InvalidBlock(format!(
                "{}: hash {} does not match header {}",
                name, block.hash, expected
            )));
        }
        if name != block.file_name() {
            return Err(LedgerError::InvalidBlock(format!(
                "{} does not match block name {}",
                name,
                block.file_name()
            )));
        }
        let path = self.dir.join(name);
        if path.exists() {
            return Ok(false);
        }
        persist::write_json_atomic(&path, block)?;
        Ok(true)
    }

    /// Union another ledger directory into this one. Returns blocks added.
    pub fn merge_from_dir(&self, other: &Path) -> Result<usize, LedgerError> {
        let source = LocalDag::new(other);
        let mut added = 0;
        for name in source.list_blocks()? {
            let block = source.read_block(&name)?;
            match self.insert_block(&name, &block) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(LedgerError::InvalidBlock(reason)) => {
                    log::warn!("skipping invalid block: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}
