//! Pulling state from gossip peers

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::state::GossipState;
use super::GossipError;
use crate::ledger::{Balances, LedgerBlock, PoolMerge, Transaction};
use crate::reputation::ReputationTable;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct BlockList {
    blocks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WitnessReply {
    result: PoolMerge,
}

/// What one pull from one peer changed locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullReport {
    pub peer: String,
    pub blocks_added: usize,
    pub balance_conflicts: usize,
    pub rep_changed: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct GossipClient {
    client: Client,
}

impl GossipClient {
    pub fn new(timeout: Duration) -> Result<Self, GossipError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| GossipError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(peer: &str, path: &str) -> String {
        format!("{}/gossip/{}", peer.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(&self, peer: &str, path: &str, query: &[(&str, &str)]) -> Result<T, GossipError> {
        let response = self
            .client
            .get(Self::url(peer, path))
            .query(query)
            .send()
            .await
            .map_err(|e| GossipError::Network(e.to_string()))?;
        decode(response).await
    }

    pub async fn blocks(&self, peer: &str) -> Result<Vec<String>, GossipError> {
        let list: BlockList = self.get(peer, "blocks", &[]).await?;
        Ok(list.blocks)
    }

    pub async fn block(&self, peer: &str, name: &str) -> Result<LedgerBlock, GossipError> {
        self.get(peer, "block", &[("name", name)]).await
    }

    pub async fn balances(&self, peer: &str) -> Result<Balances, GossipError> {
        self.get(peer, "balances", &[]).await
    }

    pub async fn reputation(&self, peer: &str) -> Result<ReputationTable, GossipError> {
        self.get(peer, "rep", &[]).await
    }

    pub async fn tx_pool(&self, peer: &str) -> Result<Vec<Transaction>, GossipError> {
        self.get(peer, "tx_pool", &[]).await
    }

    /// Push a transaction to a peer's pool so it can add its witness.
    pub async fn push_tx(&self, peer: &str, tx: &Transaction) -> Result<PoolMerge, GossipError> {
        let response = self
            .client
            .post(Self::url(peer, "tx_witness"))
            .json(tx)
            .send()
            .await
            .map_err(|e| GossipError::Network(e.to_string()))?;
        let reply: WitnessReply = decode(response).await?;
        Ok(reply.result)
    }

    /// Pull blocks, balances and reputation from `peer` and merge them into
    /// `state`.
    ///
    /// Each resource is independent: a failure on one is recorded in the
    /// report and the others are still pulled.
    pub async fn pull_from_peer(&self, peer: &str, state: &GossipState) -> PullReport {
        let mut report = PullReport {
            peer: peer.to_string(),
            ..Default::default()
        };

        match self.pull_blocks(peer, state, &mut report).await {
            Ok(added) => report.blocks_added = added,
            Err(e) => report.errors.push(format!("blocks: {}", e)),
        }

        match self.balances(peer).await {
            Ok(remote) => match state.merge_balances(&remote) {
                Ok(merged) => report.balance_conflicts = merged.conflicts.len(),
                Err(e) => report.errors.push(format!("balances: {}", e)),
            },
            Err(e) => report.errors.push(format!("balances: {}", e)),
        }

        match self.reputation(peer).await {
            Ok(remote) => match state.merge_reputation(&remote) {
                Ok((_, changed)) => report.rep_changed = changed,
                Err(e) => report.errors.push(format!("rep: {}", e)),
            },
            Err(e) => report.errors.push(format!("rep: {}", e)),
        }

        for e in &report.errors {
            log::warn!("gossip pull from {}: {}", peer, e);
        }
        log::info!(
            "gossip pull from {}: +{} blocks, {} balance conflicts, {} rep changes",
            peer,
            report.blocks_added,
            report.balance_conflicts,
            report.rep_changed
        );
        report
    }

    async fn pull_blocks(&self, peer: &str, state: &GossipState, report: &mut PullReport) -> Result<usize, GossipError> {
        let held: HashSet<String> = state.block_names()?.into_iter().collect();
        let mut added = 0;
        for name in self.blocks(peer).await? {
            if held.contains(&name) {
                continue;
            }
            let result = match self.block(peer, &name).await {
                Ok(block) if block.file_name() == name => state.append_block(&block),
                Ok(_) => Err(GossipError::InvalidResponse(format!("block {} served under another name", name))),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("block {}: {}", name, e)),
            }
        }
        Ok(added)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GossipError> {
    let status = response.status();
    if !status.is_success() {
        return Err(GossipError::Http {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    response
        .json()
        .await
        .map_err(|e| GossipError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::routes;
    use crate::gossip::state::tests::state_in;
    use crate::identity::NodeIdentity;
    use crate::ledger::Account;
    use crate::reputation::Reputation;
    use std::sync::Arc;

    fn serve(state: Arc<GossipState>) -> String {
        let (addr, server) = warp::serve(routes(state)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_pull_merges_all_resources() {
        let remote_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(state_in(remote_dir.path()));
        let local = state_in(local_dir.path());

        remote.dag().append_block("r1", 1).unwrap();
        remote.dag().append_block("r2", 4).unwrap();
        remote.ledger().balances().credit(&Account::named("A"), 7.0).unwrap();
        remote.ledger().balances().credit(&Account::named("B"), 2.0).unwrap();
        remote
            .merge_reputation(&[("http://h".to_string(), Reputation { hits: 3, misses: 1 })].into())
            .unwrap();
        local.ledger().balances().credit(&Account::named("A"), 5.0).unwrap();

        let peer = serve(Arc::clone(&remote));
        let client = GossipClient::new(Duration::from_secs(5)).unwrap();

        let report = client.pull_from_peer(&peer, &local).await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.blocks_added, 2);
        assert_eq!(report.balance_conflicts, 1);
        assert_eq!(report.rep_changed, 1);

        let balances = local.balances().unwrap();
        assert_eq!(balances[&Account::named("A")], 7.0);
        assert_eq!(balances[&Account::named("B")], 2.0);
        assert_eq!(local.block_names().unwrap(), remote.block_names().unwrap());

        let again = client.pull_from_peer(&peer, &local).await;
        assert_eq!(again.blocks_added, 0);
        assert_eq!(again.balance_conflicts, 0);
        assert_eq!(again.rep_changed, 0);
    }

    #[tokio::test]
    async fn test_push_tx_reaches_peer_pool() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(state_in(dir.path()));
        let peer = serve(Arc::clone(&remote));
        let client = GossipClient::new(Duration::from_secs(5)).unwrap();

        let tx = Transaction::create_signed(
            &NodeIdentity::generate("author"),
            Account::Mint,
            Account::named("A"),
            1.0,
            0.0,
            7,
            serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(client.push_tx(&peer, &tx).await.unwrap(), PoolMerge::Added);
        assert_eq!(client.tx_pool(&peer).await.unwrap()[0].id, tx.id);
        assert_eq!(
            client.push_tx(&peer, &tx).await.unwrap(),
            PoolMerge::Merged { new_witnesses: 0 }
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let local = state_in(dir.path());
        let client = GossipClient::new(Duration::from_millis(500)).unwrap();
        let report = client.pull_from_peer("http://127.0.0.1:9", &local).await;
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.blocks_added, 0);
    }
}
