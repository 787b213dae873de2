//! Periodic quorum-driven finalization of pooled transactions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{FinalizeOutcome, Ledger, LedgerError, Transaction};
use crate::quorum::{QuorumEngine, QuorumKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizerTick {
    pub examined: usize,
    pub finalized: Vec<String>,
    pub pending: Vec<String>,
    /// Transactions that failed this tick, with the error. They stay pooled.
    #[serde(default)]
    pub errors: BTreeMap<String, String>,
}

/// Feeds each pooled transaction's witnesses into the quorum engine as
/// acks and finalizes the ones whose quorum record has closed.
pub struct AutoFinalizer {
    ledger: Arc<Ledger>,
    quorum: Arc<QuorumEngine>,
    quorum_m: usize,
    interval: Duration,
}

impl AutoFinalizer {
    pub fn new(ledger: Arc<Ledger>, quorum: Arc<QuorumEngine>, quorum_m: usize, interval: Duration) -> Self {
        Self {
            ledger,
            quorum,
            quorum_m,
            interval,
        }
    }

    /// One pass over the pool. A failure on one transaction is recorded in
    /// `errors` and the pass moves on to the next.
    pub fn tick(&self) -> Result<FinalizerTick, LedgerError> {
        let pool = self.ledger.pool()?;
        let mut report = FinalizerTick {
            examined: pool.len(),
            ..Default::default()
        };

        for tx in pool {
            let id = tx.id.clone();
            match self.process(tx) {
                Ok(Some(finalized)) => report.finalized.push(finalized),
                Ok(None) => report.pending.push(id),
                Err(LedgerError::InsufficientFunds { account, needed, available }) => {
                    log::warn!("tx {} left pending: {} has {} of {}", id, account, available, needed);
                    report.pending.push(id);
                }
                Err(e) => {
                    log::warn!("finalizer: tx {} failed: {}", id, e);
                    report.errors.insert(id, e.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Ack the transaction's witnesses and finalize it if its quorum has
    /// closed. `Some(id)` when it was finalized by this call.
    fn process(&self, tx: Transaction) -> Result<Option<String>, LedgerError> {
        let meta = serde_json::json!({
            "ts": tx.body.ts,
            "src": tx.body.src,
            "dst": tx.body.dst,
        });
        let record = self
            .quorum
            .create_or_get(&tx.id, &QuorumKind::Transaction, self.quorum_m as f64, meta)?;

        // acks keep the time a witness was first seen, so decay runs from there
        for witness in &tx.witnesses {
            if record.acks.iter().any(|a| a.signer_id == witness.verify_key) {
                continue;
            }
            if witness.is_valid_for(&tx.id) {
                self.quorum
                    .add_ack(&tx.id, &QuorumKind::Transaction, &witness.verify_key)?;
            } else {
                log::warn!("security: ignoring invalid witness {} on tx {}", witness.verify_key, tx.id);
            }
        }

        if !self.quorum.is_finalized(&tx.id, &QuorumKind::Transaction)? {
            return Ok(None);
        }
        match self.ledger.finalize(&tx.id, self.quorum_m)? {
            FinalizeOutcome::Finalized { id } => Ok(Some(id)),
            FinalizeOutcome::AlreadyFinalized => Ok(None),
            FinalizeOutcome::QuorumNotMet { .. } => Ok(None),
        }
    }

    /// Tick forever. Errors are logged and the loop continues.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.tick() {
                Ok(report) if !report.finalized.is_empty() || !report.errors.is_empty() => {
                    log::info!(
                        "finalizer: {} finalized, {} pending, {} failed",
                        report.finalized.len(),
                        report.pending.len(),
                        report.errors.len()
                    );
                }
                Ok(_) => {}
                Err(e) => log::warn!("finalizer tick failed: {}", e),
            }
        }
    }
}
