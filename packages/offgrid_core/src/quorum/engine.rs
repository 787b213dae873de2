//! File-backed quorum records and finalize log

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use super::policy::{PolicyStore, ResolvedPolicy};
use super::{now_secs, QuorumError, QuorumKind};
use crate::persist::{self, PersistError};

/// One signer's acknowledgment. Re-acking replaces `ts` and `weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub signer_id: String,
    pub ts: f64,
    /// Base weight resolved from policy when the ack was (last) recorded
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumRecord {
    pub id: String,
    pub kind: QuorumKind,
    pub required: f64,
    pub acks: Vec<Ack>,
    pub finalized: bool,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub created_ts: f64,
}

impl QuorumRecord {
    fn new(id: &str, kind: &QuorumKind, required: f64, meta: serde_json::Value, now: f64) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.clone(),
            required,
            acks: Vec::new(),
            finalized: false,
            meta,
            created_ts: now,
        }
    }

    /// Sum of effective weights at `now`.
    pub fn sum_weight(&self, policy: &ResolvedPolicy, now: f64) -> f64 {
        self.acks
            .iter()
            .map(|a| policy.effective_weight(a.weight, now - a.ts))
            .sum()
    }
}

/// Result of `add_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckOutcome {
    pub finalized: bool,
    /// True only on the call that flipped the record to finalized
    pub newly_finalized: bool,
    pub sum_w: f64,
    pub required: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeLogEntry {
    pub id: String,
    pub kind: QuorumKind,
    pub sum_w: f64,
    pub required: f64,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub finalized_ts: f64,
}

/// A record together with its current effective weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    #[serde(flatten)]
    pub record: QuorumRecord,
    pub sum_w: f64,
}

/// Quorum accumulator over `quorum.json` / `quorum_log.json`.
///
/// Every mutating call is a whole-file read-modify-write under `lock`.
#[derive(Debug)]
pub struct QuorumEngine {
    records_path: PathBuf,
    log_path: PathBuf,
    policy: PolicyStore,
    lock: Mutex<()>,
}

impl QuorumEngine {
    pub fn new(records_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>, policy: PolicyStore) -> Self {
        Self {
            records_path: records_path.into(),
            log_path: log_path.into(),
            policy,
            lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, QuorumError> {
        self.lock
            .lock()
            .map_err(|e| QuorumError::Storage(PersistError::LockPoisoned(e.to_string())))
    }

    fn load_records(&self) -> Result<Vec<QuorumRecord>, QuorumError> {
        Ok(persist::read_json_or(&self.records_path, Vec::new)?)
    }

    fn save_records(&self, records: &[QuorumRecord]) -> Result<(), QuorumError> {
        Ok(persist::write_json_atomic(&self.records_path, records)?)
    }

    /// Return the record for `(id, kind)`, creating it if absent.
    ///
    /// An existing record keeps its original `required` and `meta`.
    pub fn create_or_get(
        &self,
        id: &str,
        kind: &QuorumKind,
        required: f64,
        meta: serde_json::Value,
    ) -> Result<QuorumRecord, QuorumError> {
        let _guard = self.lock()?;
        let mut records = self.load_records()?;
        if let Some(existing) = records.iter().find(|r| r.id == id && &r.kind == kind) {
            return Ok(existing.clone());
        }
        let record = QuorumRecord::new(id, kind, required, meta, now_secs());
        records.push(record.clone());
        self.save_records(&records)?;
        log::debug!("quorum record {}/{} created, required={}", kind, id, required);
        Ok(record)
    }

    pub fn add_ack(&self, id: &str, kind: &QuorumKind, signer_id: &str) -> Result<AckOutcome, QuorumError> {
        self.add_ack_at(id, kind, signer_id, now_secs())
    }

    /// `add_ack` evaluated at an explicit time.
    pub fn add_ack_at(
        &self,
        id: &str,
        kind: &QuorumKind,
        signer_id: &str,
        now: f64,
    ) -> Result<AckOutcome, QuorumError> {
        let _guard = self.lock()?;
        let policy = self.policy.policy_for(kind)?;
        let mut records = self.load_records()?;

        let position = match records.iter().position(|r| r.id == id && &r.kind == kind) {
            Some(p) => p,
            None => {
                records.push(QuorumRecord::new(id, kind, 1.0, serde_json::json!({}), now));
                records.len() - 1
            }
        };
        let record = &mut records[position];

        let weight = policy.base_weight(signer_id);
        match record.acks.iter_mut().find(|a| a.signer_id == signer_id) {
            Some(ack) => {
                ack.ts = now;
                ack.weight = weight;
            }
            None => record.acks.push(Ack {
                signer_id: signer_id.to_string(),
                ts: now,
                weight,
            }),
        }

        let sum_w = record.sum_weight(&policy, now);
        let mut newly_finalized = false;
        if !record.finalized && sum_w >= record.required {
            record.finalized = true;
            newly_finalized = true;

            let mut log: Vec<FinalizeLogEntry> = persist::read_json_or(&self.log_path, Vec::new)?;
            log.push(FinalizeLogEntry {
                id: record.id.clone(),
                kind: record.kind.clone(),
                sum_w,
                required: record.required,
                meta: record.meta.clone(),
                finalized_ts: now,
            });
            persist::write_json_atomic(&self.log_path, &log)?;
            log::info!(
                "quorum {}/{} finalized: {:.3} >= {}",
                record.kind,
                record.id,
                sum_w,
                record.required
            );
        }

        let outcome = AckOutcome {
            finalized: record.finalized,
            newly_finalized,
            sum_w,
            required: record.required,
        };
        self.save_records(&records)?;
        Ok(outcome)
    }

    pub fn is_finalized(&self, id: &str, kind: &QuorumKind) -> Result<bool, QuorumError> {
        Ok(self.get_record(id, kind)?.map(|r| r.finalized).unwrap_or(false))
    }

    pub fn get_record(&self, id: &str, kind: &QuorumKind) -> Result<Option<QuorumRecord>, QuorumError> {
        let records = self.load_records()?;
        Ok(records.into_iter().find(|r| r.id == id && &r.kind == kind))
    }

    pub fn list_records(&self, kind: Option<&QuorumKind>) -> Result<Vec<RecordSummary>, QuorumError> {
        self.list_records_at(kind, now_secs())
    }

    /// Records (optionally of one kind) with their effective weight at `now`.
    pub fn list_records_at(
        &self,
        kind: Option<&QuorumKind>,
        now: f64,
    ) -> Result<Vec<RecordSummary>, QuorumError> {
        let policy = self.policy.load()?;
        let records = self.load_records()?;
        Ok(records
            .into_iter()
            .filter(|r| kind.map_or(true, |k| &r.kind == k))
            .map(|record| {
                let sum_w = record.sum_weight(&policy.resolve(&record.kind), now);
                RecordSummary { record, sum_w }
            })
            .collect())
    }

    pub fn finalize_log(&self) -> Result<Vec<FinalizeLogEntry>, QuorumError> {
        Ok(persist::read_json_or(&self.log_path, Vec::new)?)
    }
}
