//! The host-daemon surface the transfer engine talks to

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::TransferError;
use crate::identity::PublicKeys;
use crate::ledger::PriceSheet;

/// Body of `POST /store`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub asset_id: String,
    pub index: usize,
    /// base64 of the sealed-box JSON
    pub data_b64: String,
}

/// Body of `GET /fetch` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub data_b64: String,
}

/// Body of `GET /announce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: String,
    pub active: bool,
    #[serde(default)]
    pub prices: PriceSheet,
}

/// Body of `GET /quote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quote: f64,
}

/// A way of reaching storage hosts. Every call carries its own timeout.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn public_keys(&self, endpoint: &str) -> Result<PublicKeys, TransferError>;

    async fn store(&self, endpoint: &str, request: &StoreRequest) -> Result<(), TransferError>;

    /// Returns the stored `data_b64`.
    async fn fetch(&self, endpoint: &str, asset_id: &str, index: usize) -> Result<String, TransferError>;

    async fn announce(&self, endpoint: &str) -> Result<Announcement, TransferError>;

    async fn quote(&self, endpoint: &str, resource_type: &str, size: f64) -> Result<f64, TransferError>;
}
