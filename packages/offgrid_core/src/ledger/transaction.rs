//! Witnessed transactions
//!
//! A transaction id is the SHA-256 hex of the compact, key-sorted JSON body.
//! Witnesses sign the id's ASCII bytes; the author's own signature is the
//! first witness.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::{Account, LedgerError};
use crate::identity::{verify_b64, NodeIdentity};
use crate::persist;

pub const TX_VERSION: &str = "0.11";

/// The hashed part of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxBody {
    pub version: String,
    /// Creation time, unix milliseconds
    pub ts: i64,
    pub src: Account,
    pub dst: Account,
    pub amount: f64,
    pub fee: f64,
    pub nonce: u64,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl TxBody {
    pub fn hash(&self) -> Result<String, LedgerError> {
        let canonical = persist::canonical_json(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Witness {
    /// Ed25519 verifying key, base64
    pub verify_key: String,
    /// Signature over the transaction id, base64
    pub signature: String,
    /// The transaction id this witness signed
    pub hash: String,
}

impl Witness {
    pub fn sign(identity: &NodeIdentity, tx_id: &str) -> Self {
        Self {
            verify_key: identity.verify_key_b64(),
            signature: identity.sign_b64(tx_id.as_bytes()),
            hash: tx_id.to_string(),
        }
    }

    pub fn is_valid_for(&self, tx_id: &str) -> bool {
        self.hash == tx_id && verify_b64(&self.verify_key, tx_id.as_bytes(), &self.signature).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(flatten)]
    pub body: TxBody,
    pub id: String,
    #[serde(default)]
    pub witnesses: Vec<Witness>,
}

impl Transaction {
    /// Build an unsigned transaction stamped with the current time.
    pub fn new(
        src: Account,
        dst: Account,
        amount: f64,
        fee: f64,
        nonce: u64,
        meta: serde_json::Value,
    ) -> Result<Self, LedgerError> {
        if !amount.is_finite() || amount < 0.0 || !fee.is_finite() || fee < 0.0 {
            return Err(LedgerError::InvalidAmount(format!(
                "amount={} fee={}",
                amount, fee
            )));
        }
        let body = TxBody {
            version: TX_VERSION.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            src,
            dst,
            amount,
            fee,
            nonce,
            meta,
        };
        let id = body.hash()?;
        Ok(Self {
            body,
            id,
            witnesses: Vec::new(),
        })
    }

    /// Build a transaction carrying the author's signature as first witness.
    pub fn create_signed(
        identity: &NodeIdentity,
        src: Account,
        dst: Account,
        amount: f64,
        fee: f64,
        nonce: u64,
        meta: serde_json::Value,
    ) -> Result<Self, LedgerError> {
        let mut tx = Self::new(src, dst, amount, fee, nonce, meta)?;
        let witness = Witness::sign(identity, &tx.id);
        tx.witnesses.push(witness);
        Ok(tx)
    }

    /// Check that `id` is the hash of the body.
    pub fn verify_id(&self) -> Result<(), LedgerError> {
        let expected = self.body.hash()?;
        if expected != self.id {
            return Err(LedgerError::HashMismatch {
                expected,
                got: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Add a witness. Returns `false` if that key already has a verifying
    /// signature here. A signature that does not verify is rejected.
    pub fn add_witness(&mut self, witness: Witness) -> Result<bool, LedgerError> {
        if witness.hash != self.id {
            return Err(LedgerError::HashMismatch {
                expected: self.id.clone(),
                got: witness.hash,
            });
        }
        if !witness.is_valid_for(&self.id) {
            log::warn!("security: rejected witness on tx {} from {}", self.id, witness.verify_key);
            return Err(LedgerError::InvalidSignature(witness.verify_key));
        }
        let id = self.id.clone();
        if self
            .witnesses
            .iter()
            .any(|w| w.verify_key == witness.verify_key && w.is_valid_for(&id))
        {
            return Ok(false);
        }
        // drop stale entries squatting on this key
        self.witnesses.retain(|w| w.verify_key != witness.verify_key);
        self.witnesses.push(witness);
        Ok(true)
    }

    /// Number of distinct keys with a verifying signature over `id`.
    pub fn valid_witness_count(&self) -> usize {
        let mut seen = HashSet::new();
        for w in &self.witnesses {
            if seen.contains(&w.verify_key) {
                continue;
            }
            if w.is_valid_for(&self.id) {
                seen.insert(w.verify_key.clone());
            } else {
                log::warn!("security: invalid witness signature on tx {} from {}", self.id, w.verify_key);
            }
        }
        seen.len()
    }

    /// Union of witness sets keyed by `(verify_key, signature)`. Witnesses
    /// that do not verify against `id` are skipped.
    /// Returns the number of witnesses added.
    pub fn merge_witnesses(&mut self, other: &Transaction) -> usize {
        let mut added = 0;
        for w in &other.witnesses {
            let known = self
                .witnesses
                .iter()
                .any(|mine| mine.verify_key == w.verify_key && mine.signature == w.signature);
            if known {
                continue;
            }
            if !w.is_valid_for(&self.id) {
                log::warn!("security: dropped invalid witness on tx {} from {}", self.id, w.verify_key);
                continue;
            }
            self.witnesses.push(w.clone());
            added += 1;
        }
        added
    }

    /// Remove witnesses that do not verify against `id`. Returns how many were removed.
    pub fn retain_valid_witnesses(&mut self) -> usize {
        let id = self.id.clone();
        let before = self.witnesses.len();
        self.witnesses.retain(|w| w.is_valid_for(&id));
        let removed = before - self.witnesses.len();
        if removed > 0 {
            log::warn!("security: dropped {} invalid witnesses on tx {}", removed, self.id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &NodeIdentity) -> Transaction {
        Transaction::create_signed(
            identity,
            Account::Mint,
            Account::named("alice"),
            10.0,
            0.1,
            1,
            serde_json::json!({"note": "test"}),
        )
        .unwrap()
    }

    #[test]
    fn test_id_is_body_hash() {
        let author = NodeIdentity::generate("a");
        let tx = sample(&author);
        assert_eq!(tx.id.len(), 64);
        tx.verify_id().unwrap();

        let mut tampered = tx.clone();
        tampered.body.amount = 1000.0;
        assert!(matches!(tampered.verify_id(), Err(LedgerError::HashMismatch { .. })));
    }

    #[test]
    fn test_id_ignores_witnesses() {
        let author = NodeIdentity::generate("a");
        let mut tx = sample(&author);
        let before = tx.id.clone();
        tx.add_witness(Witness::sign(&NodeIdentity::generate("b"), &tx.id)).unwrap();
        assert_eq!(tx.body.hash().unwrap(), before);
    }

    #[test]
    fn test_author_is_first_witness() {
        let author = NodeIdentity::generate("a");
        let tx = sample(&author);
        assert_eq!(tx.witnesses.len(), 1);
        assert_eq!(tx.witnesses[0].verify_key, author.verify_key_b64());
        assert_eq!(tx.valid_witness_count(), 1);
    }

    #[test]
    fn test_duplicate_witness_is_noop() {
        let author = NodeIdentity::generate("a");
        let mut tx = sample(&author);
        let again = Witness::sign(&author, &tx.id);
        assert!(!tx.add_witness(again).unwrap());
        assert_eq!(tx.witnesses.len(), 1);
    }

    #[test]
    fn test_witness_for_other_tx_rejected() {
        let author = NodeIdentity::generate("a");
        let mut tx = sample(&author);
        let stray = Witness::sign(&NodeIdentity::generate("b"), "deadbeef");
        assert!(matches!(tx.add_witness(stray), Err(LedgerError::HashMismatch { .. })));
    }

    #[test]
    fn test_forged_witness_rejected() {
        let author = NodeIdentity::generate("a");
        let mut tx = sample(&author);
        let mut forged = Witness::sign(&NodeIdentity::generate("b"), &tx.id);
        forged.verify_key = NodeIdentity::generate("c").verify_key_b64();
        let result = tx.add_witness(forged);
        assert!(matches!(result, Err(LedgerError::InvalidSignature(_))));
        assert_eq!(tx.witnesses.len(), 1);
        assert_eq!(tx.valid_witness_count(), 1);
    }

    #[test]
    fn test_forged_witness_cannot_squat_on_key() {
        let author = NodeIdentity::generate("a");
        let victim = NodeIdentity::generate("b");
        let mut tx = sample(&author);

        let mut forged = Witness::sign(&NodeIdentity::generate("c"), &tx.id);
        forged.verify_key = victim.verify_key_b64();
        let mut gossiped = tx.clone();
        gossiped.witnesses.push(forged.clone());
        assert_eq!(tx.merge_witnesses(&gossiped), 0);

        // a squatter already in the list is replaced by the genuine signature
        tx.witnesses.push(forged);
        assert!(tx.add_witness(Witness::sign(&victim, &tx.id)).unwrap());
        assert_eq!(tx.witnesses.len(), 2);
        assert_eq!(tx.valid_witness_count(), 2);
    }

    #[test]
    fn test_merge_witnesses_is_union() {
        let author = NodeIdentity::generate("a");
        let mut local = sample(&author);
        let mut remote = local.clone();
        remote
            .add_witness(Witness::sign(&NodeIdentity::generate("b"), &remote.id))
            .unwrap();

        assert_eq!(local.merge_witnesses(&remote), 1);
        assert_eq!(local.merge_witnesses(&remote), 0);
        assert_eq!(local.valid_witness_count(), 2);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let result = Transaction::new(
            Account::named("a"),
            Account::named("b"),
            -1.0,
            0.0,
            0,
            serde_json::Value::Null,
        );
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
    }

    #[test]
    fn test_wire_shape_is_flat() {
        let author = NodeIdentity::generate("a");
        let tx = sample(&author);
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["src"], "mint");
        assert_eq!(value["dst"], "alice");
        assert!(value["id"].is_string());
        assert!(value["witnesses"].is_array());
        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, tx);
    }
}
