//! Node configuration and on-disk layout
//!
//! A node is configured by one JSON document. Every field has a default, so
//! an empty `{}` (or a missing file) yields a working single-node setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::erasure::{ErasureParams, PlacementTarget, DEFAULT_K, DEFAULT_N, DEFAULT_SHARD_SIZE};
use crate::ledger::PriceSheet;
use crate::persist::{self, PersistError};
use crate::transfer::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub host: HostConfig,
    pub transfer: TransferConfig,
    pub quorum: QuorumConfig,
    pub gossip: GossipConfig,
    pub settlement: SettlementConfig,
}

impl NodeConfig {
    /// Load `path`, or the defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = persist::read_json_or(path, Self::default)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        persist::write_json_atomic(path, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.erasure_params()?;
        let rate = self.settlement.reserve_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::Invalid(format!("reserve_rate {} outside [0, 1]", rate)));
        }
        self.host.prices.validate().map_err(ConfigError::Invalid)?;
        if self.host.max_concurrent_stores == 0 {
            return Err(ConfigError::Invalid("max_concurrent_stores must be positive".into()));
        }
        Ok(())
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(self.data_dir.clone().unwrap_or_else(|| PathBuf::from("./data")))
    }
}

/// The host shard service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub bind: String,
    /// Concurrent `/store` writes before callers are told to back off
    pub max_concurrent_stores: usize,
    pub retry_after_secs: u64,
    pub prices: PriceSheet,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8710".to_string(),
            max_concurrent_stores: 4,
            retry_after_secs: 2,
            prices: PriceSheet::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub k: usize,
    pub n: usize,
    pub shard_size: usize,
    /// Used to size `(k, n)` from the directory when `k`/`n` are not forced
    pub target: PlacementTarget,
    pub window: usize,
    pub request_timeout_secs: u64,
    pub upload_retry: RetryConfig,
    pub download_retry: RetryConfig,
    /// Durability weight an upload must reach; defaults to the placement's
    pub upload_required: Option<f64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            n: DEFAULT_N,
            shard_size: DEFAULT_SHARD_SIZE,
            target: PlacementTarget::Balanced,
            window: crate::transfer::DEFAULT_WINDOW,
            request_timeout_secs: 30,
            upload_retry: RetryConfig::from(RetryPolicy::upload()),
            download_retry: RetryConfig::from(RetryPolicy::download()),
            upload_required: None,
        }
    }
}

impl TransferConfig {
    pub fn erasure_params(&self) -> Result<ErasureParams, ConfigError> {
        ErasureParams::new(self.k, self.n, self.shard_size).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_tries: u32,
    pub base_ms: u64,
    pub jitter_ms: u64,
}

impl From<RetryPolicy> for RetryConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_tries: policy.max_tries,
            base_ms: policy.base.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_tries: config.max_tries.max(1),
            base: Duration::from_millis(config.base_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Distinct witness signatures a transaction needs to finalize
    pub tx_quorum_m: usize,
    pub finalizer_interval_secs: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            tx_quorum_m: 2,
            finalizer_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub bind: String,
    /// Base URLs of peers to pull from
    pub peers: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8720".to_string(),
            peers: Vec::new(),
            interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub cluster_id: String,
    /// Fraction of each gross reward credited to the system account
    pub reserve_rate: f64,
    /// Witnesses required on settlement mint transactions; 1 finalizes at once
    pub quorum_m: usize,
    pub batch_limit: usize,
    pub interval_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            cluster_id: "cluster-local".to_string(),
            reserve_rate: 0.01,
            quorum_m: 2,
            batch_limit: 1000,
            interval_secs: 30,
        }
    }
}

/// Every persisted path, derived from one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keystore(&self) -> PathBuf {
        self.root.join("keys").join("node.json")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.root.join("shards")
    }

    pub fn directory(&self) -> PathBuf {
        self.root.join("discovery").join("mesh_hosts.json")
    }

    pub fn quorum_records(&self) -> PathBuf {
        self.root.join("quorum.json")
    }

    pub fn quorum_log(&self) -> PathBuf {
        self.root.join("quorum_log.json")
    }

    pub fn quorum_policy(&self) -> PathBuf {
        self.root.join("quorum_policy.json")
    }

    pub fn tx_pool(&self) -> PathBuf {
        self.root.join("txpool.json")
    }

    pub fn tx_log(&self) -> PathBuf {
        self.root.join("txlog.json")
    }

    pub fn balances(&self) -> PathBuf {
        self.root.join("balances.json")
    }

    pub fn reputation(&self) -> PathBuf {
        self.root.join("reputation.json")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.root.join("receipts")
    }

    pub fn settled_batches(&self) -> PathBuf {
        self.root.join("settled_batches.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.host.max_concurrent_stores, 4);
        assert_eq!(config.settlement.reserve_rate, 0.01);
        assert_eq!(config.transfer.upload_retry.base_ms, 400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"transfer": {"k": 6, "n": 10}, "gossip": {"peers": ["http://p:8720"]}}"#)
                .unwrap();
        assert_eq!(config.transfer.erasure_params().unwrap().k, 6);
        assert_eq!(config.transfer.shard_size, DEFAULT_SHARD_SIZE);
        assert_eq!(config.gossip.peers.len(), 1);
        assert_eq!(config.gossip.interval_secs, 30);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"transfer": {"k": 5, "n": 5}}"#).unwrap();
        assert!(matches!(NodeConfig::load_or_default(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, r#"{"settlement": {"reserve_rate": 1.5}}"#).unwrap();
        assert!(NodeConfig::load_or_default(&path).is_err());

        std::fs::write(&path, r#"{"host": {"prices": {"per_gb_hour": -0.5}}}"#).unwrap();
        assert!(matches!(NodeConfig::load_or_default(&path), Err(ConfigError::Invalid(_))));

        let missing = NodeConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, NodeConfig::default());
    }

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::new("/var/offgrid");
        assert_eq!(layout.tx_pool(), PathBuf::from("/var/offgrid/txpool.json"));
        assert_eq!(
            layout.directory(),
            PathBuf::from("/var/offgrid/discovery/mesh_hosts.json")
        );
    }
}
