//! Node identity and end-to-end shard encryption
//!
//! - `NodeIdentity`: Ed25519 signing + X25519 key-agreement keypairs for a node
//! - `PublicKeys`: the published half, served at `/pubkeys`
//! - `SessionKey`: per-peer AEAD key derived by ECDH + HKDF

pub mod keys;
pub mod session;

pub use keys::{verify_b64, NodeIdentity, PublicKeys};
pub use session::{shard_aad, SealedBox, SessionKey};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub(crate) fn decode_b64(text: &str) -> Result<Vec<u8>, IdentityError> {
    STANDARD
        .decode(text)
        .map_err(|e| IdentityError::InvalidKeyMaterial(format!("bad base64: {}", e)))
}

pub(crate) fn decode_b64_array<const N: usize>(text: &str) -> Result<[u8; N], IdentityError> {
    let bytes = decode_b64(text)?;
    bytes.as_slice().try_into().map_err(|_| {
        IdentityError::InvalidKeyMaterial(format!("expected {} bytes, got {}", N, bytes.len()))
    })
}
