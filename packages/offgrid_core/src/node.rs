//! Wiring a node's stores and services from its configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, DataLayout, NodeConfig};
use crate::gossip::{GossipClient, GossipDaemon, GossipError, GossipState};
use crate::host::{HostState, ShardStore};
use crate::identity::{IdentityError, NodeIdentity};
use crate::ledger::{
    AnnouncePrices, AutoFinalizer, BalanceBook, Ledger, LedgerError, LocalDag, ReceiptStore, Settler,
};
use crate::quorum::{PolicyStore, QuorumEngine};
use crate::reputation::ReputationBook;
use crate::transfer::{
    AssetStore, Downloader, EndpointDirectory, HttpTransport, ShardTransport, TransferError, Uploader,
};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// One node's persistent state, opened from a data directory.
pub struct Node {
    pub config: NodeConfig,
    pub layout: DataLayout,
    pub identity: Arc<NodeIdentity>,
    pub quorum: Arc<QuorumEngine>,
    pub ledger: Arc<Ledger>,
    pub reputation: Arc<ReputationBook>,
    pub directory: EndpointDirectory,
    pub assets: AssetStore,
}

impl Node {
    /// Open (creating the identity if needed) the node described by `config`.
    ///
    /// Without a configured `node_id` the identity is generated under
    /// `fallback_id`.
    pub fn open(config: NodeConfig, fallback_id: &str) -> Result<Self, NodeError> {
        config.validate()?;
        let layout = config.layout();
        let node_id = config.node_id.clone().unwrap_or_else(|| fallback_id.to_string());
        let identity = Arc::new(NodeIdentity::load_or_generate(&layout.keystore(), &node_id)?);

        let quorum = Arc::new(QuorumEngine::new(
            layout.quorum_records(),
            layout.quorum_log(),
            PolicyStore::new(layout.quorum_policy()),
        ));
        let ledger = Arc::new(Ledger::new(
            layout.tx_pool(),
            layout.tx_log(),
            BalanceBook::new(layout.balances()),
        ));

        Ok(Self {
            reputation: Arc::new(ReputationBook::new(layout.reputation())),
            directory: EndpointDirectory::new(layout.directory()),
            assets: AssetStore::new(layout.assets_dir()),
            identity,
            quorum,
            ledger,
            layout,
            config,
        })
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    pub fn http_transport(&self) -> Result<Arc<dyn ShardTransport>, NodeError> {
        Ok(Arc::new(HttpTransport::with_timeout(self.config.transfer.request_timeout())?))
    }

    pub fn uploader(&self, transport: Arc<dyn ShardTransport>) -> Uploader {
        let transfer = &self.config.transfer;
        let uploader = Uploader::new(Arc::clone(&self.identity), transport, self.assets.clone())
            .with_quorum(Arc::clone(&self.quorum))
            .with_reputation(Arc::clone(&self.reputation))
            .with_retry(transfer.upload_retry.into())
            .with_window(transfer.window);
        match transfer.upload_required {
            Some(required) => uploader.with_required(required),
            None => uploader,
        }
    }

    pub fn downloader(&self, transport: Arc<dyn ShardTransport>) -> Downloader {
        let transfer = &self.config.transfer;
        Downloader::new(Arc::clone(&self.identity), transport, self.assets.clone())
            .with_reputation(Arc::clone(&self.reputation))
            .with_retry(transfer.download_retry.into())
            .with_window(transfer.window)
    }

    pub fn dag(&self) -> LocalDag {
        LocalDag::new(self.layout.ledger_dir())
    }

    pub fn receipts(&self) -> ReceiptStore {
        ReceiptStore::new(self.layout.receipts_dir(), self.config.settlement.cluster_id.clone())
    }

    pub fn host_state(&self) -> HostState {
        HostState::new(
            Arc::clone(&self.identity),
            &self.config.host,
            ShardStore::new(self.layout.shards_dir()),
            self.receipts(),
        )
    }

    pub fn gossip_state(&self) -> GossipState {
        GossipState::new(self.dag(), Arc::clone(&self.ledger), Arc::clone(&self.reputation))
    }

    pub fn gossip_daemon(&self) -> Result<GossipDaemon, NodeError> {
        let gossip = &self.config.gossip;
        let client = GossipClient::new(Duration::from_secs(gossip.timeout_secs.max(1)))?;
        Ok(GossipDaemon::new(
            Arc::new(self.gossip_state()),
            client,
            gossip.peers.clone(),
            Duration::from_secs(gossip.interval_secs.max(1)),
        ))
    }

    /// Settlement priced from the hosts' own `/announce`, resolved through
    /// the endpoint directory.
    pub fn settler(&self, transport: Arc<dyn ShardTransport>) -> Result<Settler, NodeError> {
        let hosts: HashMap<String, String> = self
            .directory
            .node_endpoints()
            .map_err(TransferError::from)?;
        Ok(Settler::new(
            self.receipts(),
            self.dag(),
            Arc::clone(&self.ledger),
            Arc::clone(&self.identity),
            Arc::new(AnnouncePrices::new(hosts, transport)),
            self.config.settlement.clone(),
            self.layout.settled_batches(),
        ))
    }

    pub fn finalizer(&self) -> AutoFinalizer {
        AutoFinalizer::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.quorum),
            self.config.quorum.tx_quorum_m,
            Duration::from_secs(self.config.quorum.finalizer_interval_secs.max(1)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_identity_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..NodeConfig::default()
        };

        let first = Node::open(config.clone(), "node-x").unwrap();
        assert_eq!(first.node_id(), "node-x");
        assert!(first.layout.keystore().exists());

        let second = Node::open(config, "other-name").unwrap();
        assert_eq!(second.node_id(), "node-x");
        assert_eq!(
            second.identity.verify_key_b64(),
            first.identity.verify_key_b64()
        );
    }
}
