//! Host shard service
//!
//! The storage side of the transfer protocol: a node that accepts sealed
//! shards over HTTP, keeps them on disk and serves them back. It also
//! publishes its keys and prices and records usage receipts for jobs it runs.

pub mod server;

pub use server::{routes, HostState};

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::persist::{self, PersistError};
use crate::transfer::validate_asset_id;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Shard payloads on disk, one directory per asset.
#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
}

impl ShardStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_path(&self, asset_id: &str, index: usize) -> Result<PathBuf, HostError> {
        validate_asset_id(asset_id).map_err(|e| HostError::InvalidRequest(e.to_string()))?;
        Ok(self.dir.join(asset_id).join(format!("shard_{:02}.bin", index)))
    }

    /// Store a shard, replacing any earlier copy of the same slot.
    pub fn put(&self, asset_id: &str, index: usize, data: &[u8]) -> Result<(), HostError> {
        let path = self.shard_path(asset_id, index)?;
        persist::write_bytes_atomic(&path, data)?;
        log::debug!("stored shard {} of {} ({} bytes)", index, asset_id, data.len());
        Ok(())
    }

    pub fn get(&self, asset_id: &str, index: usize) -> Result<Option<Vec<u8>>, HostError> {
        let path = self.shard_path(asset_id, index)?;
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map(Some)
            .map_err(|e| HostError::Io(format!("{}: {}", path.display(), e)))
    }
}
