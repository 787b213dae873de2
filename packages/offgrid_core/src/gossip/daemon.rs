//! Periodic gossip loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::client::{GossipClient, PullReport};
use super::server::routes;
use super::state::GossipState;
use super::GossipError;

/// Serves this node's state and pulls every peer on a fixed interval.
pub struct GossipDaemon {
    state: Arc<GossipState>,
    client: GossipClient,
    peers: Vec<String>,
    interval: Duration,
}

impl GossipDaemon {
    pub fn new(state: Arc<GossipState>, client: GossipClient, peers: Vec<String>, interval: Duration) -> Self {
        Self {
            state,
            client,
            peers,
            interval,
        }
    }

    pub fn state(&self) -> &Arc<GossipState> {
        &self.state
    }

    /// One round over all peers, in order.
    pub async fn pull_all(&self) -> Vec<PullReport> {
        let mut reports = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            reports.push(self.client.pull_from_peer(peer, &self.state).await);
        }
        reports
    }

    /// Bind the gossip routes on `bind` and start serving in the background.
    pub fn serve(&self, bind: SocketAddr) -> Result<SocketAddr, GossipError> {
        let (addr, server) = warp::serve(routes(Arc::clone(&self.state)))
            .try_bind_ephemeral(bind)
            .map_err(|e| GossipError::Network(format!("bind {}: {}", bind, e)))?;
        tokio::spawn(server);
        log::info!("gossip listening on http://{}", addr);
        Ok(addr)
    }

    /// Serve and pull forever. Only returns if the listener cannot be bound.
    pub async fn run(self, bind: SocketAddr) -> Result<(), GossipError> {
        self.serve(bind)?;
        log::info!(
            "gossip pulling {} peer(s) every {}s",
            self.peers.len(),
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.pull_all().await;
        }
    }
}
