//! Peer-to-peer state reconciliation
//!
//! Peers periodically pull each other's ledger blocks, balances and
//! reputation and merge them locally. There is no coordinator and no voting:
//! blocks are unioned by name, balances and reputation counters merge by
//! element-wise maximum. Pending transactions travel the other way, pushed to
//! peers so they can add witnesses.

pub mod client;
pub mod daemon;
pub mod merge;
pub mod server;
pub mod state;

pub use client::{GossipClient, PullReport};
pub use daemon::GossipDaemon;
pub use merge::{merge_balances, merge_reputation, BalanceConflict};
pub use server::routes;
pub use state::{BalanceMergeReport, GossipState};

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::persist::PersistError;

#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
