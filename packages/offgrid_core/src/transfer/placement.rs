//! Storage modes and shard-to-endpoint assignment

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::TransferError;
use crate::erasure::{choose_k_n, ErasureParams, PlacementTarget};

/// How an asset is spread over hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StorageMode {
    /// `n` coded shards, any `k` reconstruct
    Erasure(ErasureParams),
    /// the whole object stored `copies` times
    Replication { copies: usize },
}

impl StorageMode {
    /// Size a mode for `host_count` hosts. Falls back to replication when
    /// there are too few hosts for a `k < n` code.
    pub fn for_hosts(host_count: usize, target: PlacementTarget, shard_size: usize) -> Result<Self, TransferError> {
        let (k, n) = choose_k_n(host_count, target);
        if k >= n {
            return Ok(StorageMode::Replication { copies: n.max(1) });
        }
        Ok(StorageMode::Erasure(ErasureParams::new(k, n, shard_size)?))
    }

    /// Number of shards (or copies) an upload produces.
    pub fn shard_count(&self) -> usize {
        match self {
            StorageMode::Erasure(params) => params.n,
            StorageMode::Replication { copies } => *copies,
        }
    }

    /// Shards a download must open to reconstruct.
    pub fn needed(&self) -> usize {
        match self {
            StorageMode::Erasure(params) => params.k,
            StorageMode::Replication { .. } => 1,
        }
    }

    /// Durability acks required: distinct hosts in the plan, capped at `k`
    /// for erasure or `copies` for replication.
    pub fn durability_quorum(&self, assignments: &[String]) -> usize {
        let distinct = assignments.iter().collect::<BTreeSet<_>>().len();
        let cap = match self {
            StorageMode::Erasure(params) => params.k,
            StorageMode::Replication { copies } => *copies,
        };
        distinct.min(cap)
    }
}

/// Endpoint for each shard index.
///
/// With fewer endpoints than shards the endpoints are reused round-robin,
/// otherwise the first `shard_count` endpoints each take one shard.
pub fn plan_assignments(mode: &StorageMode, endpoints: &[String]) -> Result<Vec<String>, TransferError> {
    if endpoints.is_empty() {
        return Err(TransferError::NoEndpoints("no storage endpoints known".to_string()));
    }
    if let StorageMode::Replication { copies: 0 } = mode {
        return Err(TransferError::InvalidAsset("replication needs at least one copy".to_string()));
    }
    Ok((0..mode.shard_count())
        .map(|i| endpoints[i % endpoints.len()].clone())
        .collect())
}
