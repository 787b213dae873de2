//! The local state a node gossips

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::merge::{self, BalanceConflict};
use super::GossipError;
use crate::ledger::{Balances, Ledger, LedgerBlock, LocalDag, PoolMerge, Transaction};
use crate::reputation::{ReputationBook, ReputationTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceMergeReport {
    pub balances: Balances,
    pub conflicts: Vec<BalanceConflict>,
}

/// Ledger blocks, balances, reputation and the transaction pool of one node.
pub struct GossipState {
    dag: LocalDag,
    ledger: Arc<Ledger>,
    reputation: Arc<ReputationBook>,
}

impl GossipState {
    pub fn new(dag: LocalDag, ledger: Arc<Ledger>, reputation: Arc<ReputationBook>) -> Self {
        Self {
            dag,
            ledger,
            reputation,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn dag(&self) -> &LocalDag {
        &self.dag
    }

    pub fn block_names(&self) -> Result<Vec<String>, GossipError> {
        Ok(self.dag.list_blocks()?)
    }

    pub fn block(&self, name: &str) -> Result<LedgerBlock, GossipError> {
        Ok(self.dag.read_block(name)?)
    }

    /// Store a block under its own name. `false` if it was already held.
    pub fn append_block(&self, block: &LedgerBlock) -> Result<bool, GossipError> {
        let added = self.dag.insert_block(&block.file_name(), block)?;
        if added {
            log::info!("gossip: new ledger block {}", block.hash);
        }
        Ok(added)
    }

    pub fn balances(&self) -> Result<Balances, GossipError> {
        Ok(self.ledger.balances().load()?)
    }

    pub fn merge_balances(&self, remote: &Balances) -> Result<BalanceMergeReport, GossipError> {
        let (balances, conflicts) = self.ledger.balances().update(|local| {
            let conflicts = merge::merge_balances(local, remote);
            (local.clone(), conflicts)
        })?;
        for c in &conflicts {
            log::info!(
                "gossip: balance conflict on {}: local {} remote {} -> {}",
                c.account,
                c.local,
                c.remote,
                c.chosen
            );
        }
        Ok(BalanceMergeReport { balances, conflicts })
    }

    pub fn reputation(&self) -> Result<ReputationTable, GossipError> {
        Ok(self.reputation.load()?)
    }

    pub fn merge_reputation(&self, remote: &ReputationTable) -> Result<(ReputationTable, usize), GossipError> {
        Ok(self.reputation.update(|local| {
            let changed = merge::merge_reputation(local, remote);
            (local.clone(), changed)
        })?)
    }

    pub fn tx_pool(&self) -> Result<Vec<Transaction>, GossipError> {
        Ok(self.ledger.pool()?)
    }

    /// Merge a pushed transaction into the pool, uniting witness sets.
    pub fn tx_witness(&self, tx: Transaction) -> Result<PoolMerge, GossipError> {
        let id = tx.id.clone();
        let outcome = self.ledger.merge_pool_entry(tx)?;
        log::debug!("gossip: tx {} {:?}", id, outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::ledger::{Account, BalanceBook};

    pub(crate) fn state_in(dir: &std::path::Path) -> GossipState {
        let ledger = Arc::new(Ledger::new(
            dir.join("txpool.json"),
            dir.join("txlog.json"),
            BalanceBook::new(dir.join("balances.json")),
        ));
        GossipState::new(
            LocalDag::new(dir.join("ledger")),
            ledger,
            Arc::new(ReputationBook::new(dir.join("reputation.json"))),
        )
    }

    #[test]
    fn test_balance_merge_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.ledger().balances().credit(&Account::named("A"), 5.0).unwrap();

        let remote: Balances = [(Account::named("A"), 7.0), (Account::named("B"), 2.0)]
            .into_iter()
            .collect();
        let report = state.merge_balances(&remote).unwrap();
        assert_eq!(report.conflicts.len(), 1);

        let stored = state.balances().unwrap();
        assert_eq!(stored[&Account::named("A")], 7.0);
        assert_eq!(stored[&Account::named("B")], 2.0);
        assert!(state.merge_balances(&remote).unwrap().conflicts.is_empty());
    }

    #[test]
    fn test_blocks_are_unioned_once() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let source = state_in(a.path());
        let sink = state_in(b.path());

        let block = source.dag().append_block("root-1", 3).unwrap();
        assert!(sink.append_block(&block).unwrap());
        assert!(!sink.append_block(&block).unwrap());
        assert_eq!(sink.block_names().unwrap(), vec![block.file_name()]);

        let mut forged = block.clone();
        forged.count = 99;
        assert!(sink.append_block(&forged).is_err());
    }

    #[test]
    fn test_tx_witness_merges_signatures() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let author = NodeIdentity::generate("author");
        let witness = NodeIdentity::generate("witness");

        let tx = Transaction::create_signed(
            &author,
            Account::Mint,
            Account::named("A"),
            1.0,
            0.0,
            1,
            serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(state.tx_witness(tx.clone()).unwrap(), PoolMerge::Added);

        let mut cosigned = tx.clone();
        cosigned
            .add_witness(crate::ledger::Witness::sign(&witness, &tx.id))
            .unwrap();
        assert_eq!(
            state.tx_witness(cosigned).unwrap(),
            PoolMerge::Merged { new_witnesses: 1 }
        );
        assert_eq!(state.tx_pool().unwrap()[0].witnesses.len(), 2);
    }
}
