//! Per-peer AEAD sessions for shard payloads
//!
//! The key for a peer is X25519(own secret, peer public) expanded with
//! HKDF-SHA256. Every sealed box carries a fresh random nonce, and the
//! caller-supplied associated data binds the ciphertext to its context
//! (for shards, `"{asset_id}:{index}"`).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{decode_b64, decode_b64_array, encode_b64, IdentityError, NodeIdentity, PublicKeys};

const HKDF_SALT: &[u8] = b"offgrid-net";
const HKDF_INFO: &[u8] = b"e2ee";

/// Associated data binding a shard ciphertext to its slot.
pub fn shard_aad(asset_id: &str, index: usize) -> String {
    format!("{}:{}", asset_id, index)
}

/// Nonce + ciphertext, both base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub nonce: String,
    pub ciphertext: String,
}

impl SealedBox {
    /// Wire form: base64 of the JSON document (the `data_b64` field).
    pub fn to_b64(&self) -> Result<String, IdentityError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    pub fn from_b64(data_b64: &str) -> Result<Self, IdentityError> {
        let json = decode_b64(data_b64)?;
        serde_json::from_slice(&json).map_err(|e| IdentityError::DeserializationError(e.to_string()))
    }
}

/// Symmetric key shared with one peer. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; 32],
}

impl SessionKey {
    pub fn derive(identity: &NodeIdentity, peer: &X25519PublicKey) -> Result<Self, IdentityError> {
        let mut shared = identity.dh_agree(peer);
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &shared);
        shared.zeroize();

        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| IdentityError::CryptoError(e.to_string()))?;
        Ok(Self { key })
    }

    /// Derive from a peer's published `/pubkeys` document.
    pub fn for_peer(identity: &NodeIdentity, peer: &PublicKeys) -> Result<Self, IdentityError> {
        Self::derive(identity, &peer.key_exchange_key()?)
    }

    fn cipher(&self) -> Result<Aes256Gcm, IdentityError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| IdentityError::CryptoError(e.to_string()))
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox, IdentityError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
            .map_err(|e| IdentityError::CryptoError(e.to_string()))?;

        Ok(SealedBox {
            nonce: encode_b64(&nonce_bytes),
            ciphertext: encode_b64(&ciphertext),
        })
    }

    /// Open a sealed box. A wrong key, tampered ciphertext or mismatched
    /// associated data all surface as `AuthenticationFailed`.
    pub fn open(&self, sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let nonce_bytes: [u8; 12] = decode_b64_array(&sealed.nonce)?;
        let ciphertext = decode_b64(&sealed.ciphertext)?;

        self.cipher()?
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| IdentityError::AuthenticationFailed("AEAD tag mismatch".to_string()))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (NodeIdentity, NodeIdentity) {
        (NodeIdentity::generate("client"), NodeIdentity::generate("host"))
    }

    #[test]
    fn test_both_sides_derive_same_key() {
        let (client, host) = pair();
        let a = SessionKey::derive(&client, &host.dh_public()).unwrap();
        let b = SessionKey::derive(&host, &client.dh_public()).unwrap();

        let sealed = a.seal(b"shard bytes", b"asset:0").unwrap();
        assert_eq!(b.open(&sealed, b"asset:0").unwrap(), b"shard bytes");
    }

    #[test]
    fn test_aad_binds_slot() {
        let (client, host) = pair();
        let key = SessionKey::for_peer(&client, &host.public_keys()).unwrap();

        let aad = shard_aad("asset-1", 3);
        assert_eq!(aad, "asset-1:3");
        let sealed = key.seal(b"payload", aad.as_bytes()).unwrap();

        let swapped = shard_aad("asset-1", 4);
        assert!(matches!(
            key.open(&sealed, swapped.as_bytes()),
            Err(IdentityError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (client, host) = pair();
        let key = SessionKey::derive(&client, &host.dh_public()).unwrap();
        let mut sealed = key.seal(b"payload", b"a:0").unwrap();

        let mut raw = decode_b64(&sealed.ciphertext).unwrap();
        raw[0] ^= 0x01;
        sealed.ciphertext = encode_b64(&raw);
        assert!(matches!(
            key.open(&sealed, b"a:0"),
            Err(IdentityError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_wrong_peer_rejected() {
        let (client, host) = pair();
        let stranger = NodeIdentity::generate("stranger");
        let key = SessionKey::derive(&client, &host.dh_public()).unwrap();
        let other = SessionKey::derive(&client, &stranger.dh_public()).unwrap();

        let sealed = key.seal(b"payload", b"a:0").unwrap();
        assert!(other.open(&sealed, b"a:0").is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let (client, host) = pair();
        let key = SessionKey::derive(&client, &host.dh_public()).unwrap();
        let a = key.seal(b"same", b"x").unwrap();
        let b = key.seal(b"same", b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wire_form_roundtrip() {
        let (client, host) = pair();
        let key = SessionKey::derive(&client, &host.dh_public()).unwrap();
        let sealed = key.seal(b"payload", b"a:1").unwrap();

        let wire = sealed.to_b64().unwrap();
        let back = SealedBox::from_b64(&wire).unwrap();
        assert_eq!(key.open(&back, b"a:1").unwrap(), b"payload");
        assert!(SealedBox::from_b64("%%%").is_err());
    }
}
