//! Pending pool (`txpool.json`) and finalized log (`txlog.json`)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use super::{BalanceBook, LedgerError, Transaction, Witness};
use crate::identity::NodeIdentity;
use crate::persist::{self, PersistError};

/// Result of `Ledger::finalize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// Balances applied and the transaction moved to the log
    Finalized { id: String },
    /// Already in the log; nothing changed
    AlreadyFinalized,
    /// Not enough distinct valid witnesses yet
    QuorumNotMet { valid: usize, required: usize },
}

impl FinalizeOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, FinalizeOutcome::QuorumNotMet { .. })
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            FinalizeOutcome::QuorumNotMet { valid, required } => {
                Some(format!("quorum {}/{}", valid, required))
            }
            _ => None,
        }
    }
}

/// What happened when a gossiped transaction was merged into the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMerge {
    Added,
    Merged { new_witnesses: usize },
    AlreadyFinalized,
}

pub struct Ledger {
    pool_path: PathBuf,
    log_path: PathBuf,
    balances: BalanceBook,
    lock: Mutex<()>,
}

impl Ledger {
    pub fn new(pool_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>, balances: BalanceBook) -> Self {
        Self {
            pool_path: pool_path.into(),
            log_path: log_path.into(),
            balances,
            lock: Mutex::new(()),
        }
    }

    pub fn balances(&self) -> &BalanceBook {
        &self.balances
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, LedgerError> {
        self.lock
            .lock()
            .map_err(|e| LedgerError::Storage(PersistError::LockPoisoned(e.to_string())))
    }

    pub fn pool(&self) -> Result<Vec<Transaction>, LedgerError> {
        Ok(persist::read_json_or(&self.pool_path, Vec::new)?)
    }

    pub fn log(&self) -> Result<Vec<Transaction>, LedgerError> {
        Ok(persist::read_json_or(&self.log_path, Vec::new)?)
    }

    pub fn pool_get(&self, id: &str) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.pool()?.into_iter().find(|t| t.id == id))
    }

    pub fn is_finalized(&self, id: &str) -> Result<bool, LedgerError> {
        Ok(self.log()?.iter().any(|t| t.id == id))
    }

    /// Insert or replace (by id) a pending transaction.
    pub fn pool_add_or_update(&self, tx: Transaction) -> Result<(), LedgerError> {
        tx.verify_id()?;
        let _guard = self.lock()?;
        let mut pool = self.pool()?;
        match pool.iter_mut().find(|t| t.id == tx.id) {
            Some(existing) => *existing = tx,
            None => pool.push(tx),
        }
        persist::write_json_atomic(&self.pool_path, &pool)?;
        Ok(())
    }

    /// Insert or replace several pending transactions in one write.
    pub fn pool_extend(&self, txs: Vec<Transaction>) -> Result<(), LedgerError> {
        for tx in &txs {
            tx.verify_id()?;
        }
        let _guard = self.lock()?;
        let mut pool = self.pool()?;
        for tx in txs {
            match pool.iter_mut().find(|t| t.id == tx.id) {
                Some(existing) => *existing = tx,
                None => pool.push(tx),
            }
        }
        persist::write_json_atomic(&self.pool_path, &pool)?;
        Ok(())
    }

    /// Add this node's signature to a pooled transaction.
    pub fn witness(&self, id: &str, identity: &NodeIdentity) -> Result<Transaction, LedgerError> {
        let _guard = self.lock()?;
        let mut pool = self.pool()?;
        let tx = pool
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| LedgerError::UnknownTransaction(id.to_string()))?;
        if tx.add_witness(Witness::sign(identity, id))? {
            log::info!("witnessed tx {} as {}", id, identity.node_id());
        }
        let updated = tx.clone();
        persist::write_json_atomic(&self.pool_path, &pool)?;
        Ok(updated)
    }

    /// Merge a transaction received from a peer: unknown ones are added if
    /// their id matches their body, known ones gain the union of witnesses.
    pub fn merge_pool_entry(&self, incoming: Transaction) -> Result<PoolMerge, LedgerError> {
        incoming.verify_id()?;
        let _guard = self.lock()?;
        if self.log()?.iter().any(|t| t.id == incoming.id) {
            return Ok(PoolMerge::AlreadyFinalized);
        }
        let mut pool = self.pool()?;
        let result = match pool.iter_mut().find(|t| t.id == incoming.id) {
            Some(existing) => PoolMerge::Merged {
                new_witnesses: existing.merge_witnesses(&incoming),
            },
            None => {
                let mut incoming = incoming;
                incoming.retain_valid_witnesses();
                pool.push(incoming);
                PoolMerge::Added
            }
        };
        persist::write_json_atomic(&self.pool_path, &pool)?;
        Ok(result)
    }

    /// Finalize a pooled transaction once `quorum_m` distinct keys have
    /// validly witnessed it.
    ///
    /// Balances are applied at most once per id: a transaction already in
    /// the log reports `AlreadyFinalized`. Insufficient funds leave it pending.
    pub fn finalize(&self, id: &str, quorum_m: usize) -> Result<FinalizeOutcome, LedgerError> {
        let _guard = self.lock()?;
        let mut pool = self.pool()?;
        let mut entries = self.log()?;
        let in_log = entries.iter().any(|t| t.id == id);

        let position = match pool.iter().position(|t| t.id == id) {
            Some(p) => p,
            None if in_log => return Ok(FinalizeOutcome::AlreadyFinalized),
            None => return Err(LedgerError::UnknownTransaction(id.to_string())),
        };

        let valid = pool[position].valid_witness_count();
        if valid < quorum_m {
            log::debug!("tx {} quorum not met: {}/{}", id, valid, quorum_m);
            return Ok(FinalizeOutcome::QuorumNotMet {
                valid,
                required: quorum_m,
            });
        }

        if in_log {
            pool.remove(position);
            persist::write_json_atomic(&self.pool_path, &pool)?;
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        // the balance book records applied ids, so a retry after a failed
        // log write does not apply twice
        let tx = pool.remove(position);
        if !self.balances.apply_transaction(&tx)? {
            log::warn!("tx {} balances already applied, completing finalization", id);
        }
        entries.push(tx);
        persist::write_json_atomic(&self.log_path, &entries)?;
        persist::write_json_atomic(&self.pool_path, &pool)?;
        log::info!("tx {} finalized with {} witnesses", id, valid);
        Ok(FinalizeOutcome::Finalized { id: id.to_string() })
    }
}
