//! Witnessed transaction ledger and resource settlement
//!
//! - `Transaction` / `Witness`: content-addressed, co-signed transfers
//! - `Ledger`: pending pool, finalized log and quorum-gated finalization
//! - `BalanceBook`: balances mutated by finalization and the wallet primitives
//! - `ReceiptStore` / `Settler`: usage receipts priced into rewards
//! - `LocalDag`: this node's chain of settlement blocks
//! - `AutoFinalizer`: periodic finalization driven by the quorum engine

pub mod account;
pub mod balances;
pub mod dag;
pub mod finalizer;
pub mod receipts;
pub mod settlement;
pub mod transaction;
pub mod txlog;

pub use account::Account;
pub use balances::{default_balances, BalanceBook, Balances, TransferReceipt, DEFAULT_FEE_RATE};
pub use dag::{LedgerBlock, LocalDag};
pub use finalizer::{AutoFinalizer, FinalizerTick};
pub use receipts::{merkle_root, ReceiptBatch, ReceiptStore, ResourceType, UsageReceipt};
pub use settlement::{
    settle_from_batch, AnnouncePrices, CycleReport, PriceSheet, PriceSource, SettlementItem,
    SettlementReport, Settler, StaticPrices,
};
pub use transaction::{Transaction, TxBody, Witness};
pub use txlog::{FinalizeOutcome, Ledger, PoolMerge};

use thiserror::Error;

use crate::identity::IdentityError;
use crate::persist::PersistError;
use crate::quorum::QuorumError;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),

    #[error("Insufficient funds in {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: String,
        needed: f64,
        available: f64,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// File and id names that are safe to join onto a data directory.
pub fn validate_name(name: &str) -> Result<(), LedgerError> {
    let ok = !name.is_empty()
        && name.len() <= 200
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(LedgerError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("1700000000000_abcdef.json").is_ok());
        assert!(validate_name("job-1.2_x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(".hidden").is_err());
    }
}
