//! Per-node cryptographic identity
//!
//! Each node has:
//! - An Ed25519 signing keypair (witness signatures, usage receipts)
//! - An X25519 key-agreement keypair (ECDH for shard encryption keys)
//! - A node id string (persisted alongside the keys)

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};
use zeroize::Zeroize;

use super::{decode_b64_array, encode_b64, IdentityError};
use crate::persist;

/// Serializable form of a NodeIdentity (for persistence).
/// Secret keys are stored as raw bytes. Zeroized on drop.
#[derive(Serialize, Deserialize)]
struct NodeIdentityStore {
    node_id: String,
    signing_key_bytes: [u8; 32],
    dh_key_bytes: [u8; 32],
}

impl Drop for NodeIdentityStore {
    fn drop(&mut self) {
        self.signing_key_bytes.zeroize();
        self.dh_key_bytes.zeroize();
    }
}

/// Published keys of a node, as served by `GET /pubkeys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeys {
    pub node_id: String,
    /// Ed25519 verifying key, base64
    pub signing_verify_key: String,
    /// X25519 public key, base64
    pub key_exchange_public_key: String,
}

impl PublicKeys {
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let bytes: [u8; 32] = decode_b64_array(&self.signing_verify_key)?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidKeyMaterial(e.to_string()))
    }

    pub fn key_exchange_key(&self) -> Result<X25519PublicKey, IdentityError> {
        let bytes: [u8; 32] = decode_b64_array(&self.key_exchange_public_key)?;
        Ok(X25519PublicKey::from(bytes))
    }
}

/// A node's cryptographic identity.
pub struct NodeIdentity {
    node_id: String,
    signing_key: SigningKey,
    dh_secret: X25519Secret,
}

impl NodeIdentity {
    /// Generate a new identity (first boot).
    pub fn generate(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            signing_key: SigningKey::generate(&mut OsRng),
            dh_secret: X25519Secret::random_from_rng(OsRng),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn dh_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.dh_secret)
    }

    /// Perform X25519 ECDH with a peer's public key.
    pub fn dh_agree(&self, peer_public: &X25519PublicKey) -> [u8; 32] {
        self.dh_secret.diffie_hellman(peer_public).to_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Signature as base64, the form carried in witnesses and receipts.
    pub fn sign_b64(&self, data: &[u8]) -> String {
        encode_b64(&self.sign(data).to_bytes())
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.verifying_key().verify(data, signature).is_ok()
    }

    /// Ed25519 verifying key as base64.
    pub fn verify_key_b64(&self) -> String {
        encode_b64(&self.verifying_key().to_bytes())
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            node_id: self.node_id.clone(),
            signing_verify_key: self.verify_key_b64(),
            key_exchange_public_key: encode_b64(&self.dh_public().to_bytes()),
        }
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read(path).map_err(|e| IdentityError::IoError(e.to_string()))?;
        let store: NodeIdentityStore = serde_json::from_slice(&data)
            .map_err(|e| IdentityError::DeserializationError(e.to_string()))?;

        Ok(Self {
            node_id: store.node_id.clone(),
            signing_key: SigningKey::from_bytes(&store.signing_key_bytes),
            dh_secret: X25519Secret::from(store.dh_key_bytes),
        })
    }

    /// Persist to a JSON keystore file.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let store = NodeIdentityStore {
            node_id: self.node_id.clone(),
            signing_key_bytes: self.signing_key.to_bytes(),
            dh_key_bytes: self.dh_secret.to_bytes(),
        };
        persist::write_json_atomic(path, &store).map_err(|e| IdentityError::IoError(e.to_string()))
    }

    /// Load from path if it exists, otherwise generate and save.
    pub fn load_or_generate(path: &Path, node_id: &str) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate(node_id);
            identity.save(path)?;
            log::info!("generated identity for node {} at {}", node_id, path.display());
            Ok(identity)
        }
    }
}

/// Verify a base64 Ed25519 signature against a base64 verifying key.
pub fn verify_b64(verify_key: &str, message: &[u8], signature: &str) -> Result<(), IdentityError> {
    let key_bytes: [u8; 32] = decode_b64_array(verify_key)?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| IdentityError::InvalidKeyMaterial(e.to_string()))?;
    let sig_bytes: [u8; 64] = decode_b64_array(signature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(message, &signature)
        .map_err(|_| IdentityError::AuthenticationFailed("signature does not verify".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity() {
        let id = NodeIdentity::generate("node-a");
        assert_eq!(id.node_id(), "node-a");
        assert_ne!(id.verifying_key().to_bytes(), [0u8; 32]);
        assert_ne!(id.dh_public().to_bytes(), [0u8; 32]);
    }

    #[test]
    fn test_sign_and_verify() {
        let id = NodeIdentity::generate("node-a");
        let sig = id.sign(b"hello");
        assert!(id.verify(b"hello", &sig));
        assert!(!id.verify(b"wrong message", &sig));
    }

    #[test]
    fn test_verify_b64() {
        let id = NodeIdentity::generate("node-a");
        let other = NodeIdentity::generate("node-b");
        let sig = id.sign_b64(b"tx-id");

        assert!(verify_b64(&id.verify_key_b64(), b"tx-id", &sig).is_ok());
        assert!(matches!(
            verify_b64(&id.verify_key_b64(), b"other", &sig),
            Err(IdentityError::AuthenticationFailed(_))
        ));
        assert!(verify_b64(&other.verify_key_b64(), b"tx-id", &sig).is_err());
        assert!(matches!(
            verify_b64("not base64!", b"tx-id", &sig),
            Err(IdentityError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_ecdh_agreement() {
        let alice = NodeIdentity::generate("alice");
        let bob = NodeIdentity::generate("bob");
        assert_eq!(alice.dh_agree(&bob.dh_public()), bob.dh_agree(&alice.dh_public()));
    }

    #[test]
    fn test_public_keys_decode() {
        let id = NodeIdentity::generate("node-a");
        let published = id.public_keys();
        assert_eq!(published.node_id, "node-a");
        assert_eq!(published.verifying_key().unwrap(), id.verifying_key());
        assert_eq!(published.key_exchange_key().unwrap().to_bytes(), id.dh_public().to_bytes());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.json");

        let original = NodeIdentity::generate("node-a");
        original.save(&path).unwrap();
        let loaded = NodeIdentity::load(&path).unwrap();

        assert_eq!(loaded.node_id(), "node-a");
        assert_eq!(loaded.public_keys(), original.public_keys());
        let sig = loaded.sign(b"persistence test");
        assert!(original.verify(b"persistence test", &sig));
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");

        let first = NodeIdentity::load_or_generate(&path, "node-a").unwrap();
        assert!(path.exists());
        let second = NodeIdentity::load_or_generate(&path, "ignored").unwrap();
        assert_eq!(first.public_keys(), second.public_keys());
    }
}
