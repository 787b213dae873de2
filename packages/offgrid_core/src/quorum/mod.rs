//! Weighted, time-decaying quorum accumulation
//!
//! A quorum record collects acknowledgments from distinct signers until the
//! sum of their effective weights reaches `required`, at which point it is
//! finalized exactly once. Upload durability and transaction finalization
//! both sit on top of this.

pub mod engine;
pub mod policy;

pub use engine::{Ack, AckOutcome, FinalizeLogEntry, QuorumEngine, QuorumRecord, RecordSummary};
pub use policy::{GlobalPolicy, KindPolicy, PolicyStore, QuorumPolicy, ResolvedPolicy};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::PersistError;

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
}

/// What a quorum record is counting toward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QuorumKind {
    /// Durability witnesses for a stored asset
    Upload,
    /// Witness signatures on a ledger transaction
    Transaction,
    Job,
    Custom(String),
}

impl QuorumKind {
    pub fn as_str(&self) -> &str {
        match self {
            QuorumKind::Upload => "upload",
            QuorumKind::Transaction => "token",
            QuorumKind::Job => "job",
            QuorumKind::Custom(name) => name,
        }
    }
}

impl From<&str> for QuorumKind {
    fn from(s: &str) -> Self {
        match s {
            "upload" => QuorumKind::Upload,
            "token" => QuorumKind::Transaction,
            "job" => QuorumKind::Job,
            other => QuorumKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for QuorumKind {
    fn from(s: String) -> Self {
        QuorumKind::from(s.as_str())
    }
}

impl From<QuorumKind> for String {
    fn from(kind: QuorumKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for QuorumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time as fractional unix seconds.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_form() {
        assert_eq!(QuorumKind::Transaction.to_string(), "token");
        assert_eq!(QuorumKind::from("upload"), QuorumKind::Upload);
        assert_eq!(QuorumKind::from("pinning"), QuorumKind::Custom("pinning".to_string()));

        let json = serde_json::to_string(&QuorumKind::Job).unwrap();
        assert_eq!(json, "\"job\"");
        let back: QuorumKind = serde_json::from_str("\"token\"").unwrap();
        assert_eq!(back, QuorumKind::Transaction);
    }
}
