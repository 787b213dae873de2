// Offgrid - Erasure-coded storage and settlement for intermittently connected nodes

pub mod config;
pub mod erasure;
pub mod gossip;
pub mod host;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod persist;
pub mod quorum;
pub mod reputation;
pub mod transfer;

pub use config::{DataLayout, NodeConfig};
pub use node::{Node, NodeError};
