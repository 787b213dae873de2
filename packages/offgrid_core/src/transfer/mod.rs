//! Encrypted, resumable shard transfer
//!
//! Uploads encode an asset, seal every shard for the endpoint that will hold
//! it and push the shards through a bounded window of workers with retry.
//! Each confirmed store is a durability ack in the quorum engine. Downloads
//! pull shards back until enough are open to decode.

pub mod asset;
pub mod directory;
pub mod downloader;
pub mod http;
pub mod manifest;
pub mod placement;
pub mod retry;
pub mod simulated;
pub mod transport;
pub mod uploader;

pub use asset::{default_asset_id, validate_asset_id, AssetRecord, AssetStore};
pub use directory::{DirectoryEntry, EndpointDirectory, TransportKind};
pub use downloader::{DownloadReport, Downloader};
pub use http::HttpTransport;
pub use manifest::UploadManifest;
pub use placement::{plan_assignments, StorageMode};
pub use retry::RetryPolicy;
pub use simulated::SimulatedNetwork;
pub use transport::{Announcement, FetchResponse, ShardTransport, StoreRequest};
pub use uploader::{ShardFailure, UploadReport, Uploader};

use thiserror::Error;

use crate::erasure::CodecError;
use crate::identity::IdentityError;
use crate::persist::PersistError;
use crate::quorum::QuorumError;

/// Shards in flight at once.
pub const DEFAULT_WINDOW: usize = 8;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Endpoint busy, retry after {retry_after_secs}s")]
    Busy { retry_after_secs: u64 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Insufficient shards: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("No endpoints available: {0}")]
    NoEndpoints(String),

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Identity error: {0}")]
    Identity(IdentityError),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),
}

impl TransferError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Timeout(_) | TransferError::Busy { .. } => true,
            TransferError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<IdentityError> for TransferError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::AuthenticationFailed(m) => TransferError::AuthenticationFailed(m),
            other => TransferError::Identity(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransferError::Network("reset".into()).is_transient());
        assert!(TransferError::Busy { retry_after_secs: 2 }.is_transient());
        assert!(TransferError::Http { status: 503, message: String::new() }.is_transient());
        assert!(!TransferError::Http { status: 400, message: String::new() }.is_transient());
        assert!(!TransferError::AuthenticationFailed("tag".into()).is_transient());
        assert!(!TransferError::NotFound("shard".into()).is_transient());
    }

    #[test]
    fn test_aead_failure_maps_to_authentication() {
        let err: TransferError = IdentityError::AuthenticationFailed("tag".into()).into();
        assert!(matches!(err, TransferError::AuthenticationFailed(_)));
        let err: TransferError = IdentityError::InvalidKeyMaterial("len".into()).into();
        assert!(matches!(err, TransferError::Identity(_)));
    }
}
