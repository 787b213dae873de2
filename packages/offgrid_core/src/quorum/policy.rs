//! Quorum weighting policy
//!
//! The policy file is written by an external feed and read on every
//! evaluation, so decay and age limits take effect retroactively.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{QuorumError, QuorumKind};
use crate::persist::{self, PersistError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalPolicy {
    pub weight_default: f64,
    /// signer id -> base weight
    pub weights: BTreeMap<String, f64>,
    /// 0 disables decay
    pub decay_half_life_s: f64,
    /// 0 means acks never expire
    pub max_age_s: f64,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self {
            weight_default: 1.0,
            weights: BTreeMap::new(),
            decay_half_life_s: 0.0,
            max_age_s: 0.0,
        }
    }
}

/// Per-kind overrides; unset fields fall through to the global policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_default: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub weights: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decay_half_life_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_s: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumPolicy {
    pub global: GlobalPolicy,
    pub kind_overrides: BTreeMap<String, KindPolicy>,
}

impl QuorumPolicy {
    /// Flatten global + kind override into the values used for evaluation.
    pub fn resolve(&self, kind: &QuorumKind) -> ResolvedPolicy {
        let g = &self.global;
        let o = self.kind_overrides.get(kind.as_str());

        let mut weights = g.weights.clone();
        if let Some(o) = o {
            weights.extend(o.weights.iter().map(|(k, v)| (k.clone(), *v)));
        }
        ResolvedPolicy {
            weight_default: o.and_then(|o| o.weight_default).unwrap_or(g.weight_default),
            weights,
            decay_half_life_s: o
                .and_then(|o| o.decay_half_life_s)
                .unwrap_or(g.decay_half_life_s),
            max_age_s: o.and_then(|o| o.max_age_s).unwrap_or(g.max_age_s),
        }
    }
}

/// Policy values in force for one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub weight_default: f64,
    pub weights: BTreeMap<String, f64>,
    pub decay_half_life_s: f64,
    pub max_age_s: f64,
}

impl ResolvedPolicy {
    /// Signer override, else the kind/global default.
    pub fn base_weight(&self, signer_id: &str) -> f64 {
        self.weights.get(signer_id).copied().unwrap_or(self.weight_default)
    }

    /// `base * 0.5^(age / half_life)`, or zero once older than `max_age`.
    pub fn effective_weight(&self, base: f64, age_s: f64) -> f64 {
        let age = age_s.max(0.0);
        if self.max_age_s > 0.0 && age > self.max_age_s {
            return 0.0;
        }
        if self.decay_half_life_s > 0.0 && age > 0.0 {
            return base * 0.5f64.powf(age / self.decay_half_life_s);
        }
        base
    }
}

/// File-backed policy with the feed's write operations.
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<QuorumPolicy, QuorumError> {
        Ok(persist::read_json_or(&self.path, QuorumPolicy::default)?)
    }

    pub fn policy_for(&self, kind: &QuorumKind) -> Result<ResolvedPolicy, QuorumError> {
        Ok(self.load()?.resolve(kind))
    }

    /// Patch the global section. `weights_patch` entries are merged in.
    pub fn set_policy(
        &self,
        weight_default: Option<f64>,
        decay_half_life_s: Option<f64>,
        max_age_s: Option<f64>,
        weights_patch: &BTreeMap<String, f64>,
    ) -> Result<QuorumPolicy, QuorumError> {
        for value in [weight_default, decay_half_life_s, max_age_s].into_iter().flatten() {
            check_non_negative(value)?;
        }
        for value in weights_patch.values() {
            check_non_negative(*value)?;
        }

        let _guard = self.lock()?;
        let mut policy = self.load()?;
        if let Some(w) = weight_default {
            policy.global.weight_default = w;
        }
        if let Some(h) = decay_half_life_s {
            policy.global.decay_half_life_s = h;
        }
        if let Some(m) = max_age_s {
            policy.global.max_age_s = m;
        }
        policy
            .global
            .weights
            .extend(weights_patch.iter().map(|(k, v)| (k.clone(), *v)));
        persist::write_json_atomic(&self.path, &policy)?;
        log::info!("quorum policy updated: {:?}", policy.global);
        Ok(policy)
    }

    /// Patch one kind's overrides.
    pub fn set_kind_policy(&self, kind: &QuorumKind, patch: KindPolicy) -> Result<QuorumPolicy, QuorumError> {
        for value in [patch.weight_default, patch.decay_half_life_s, patch.max_age_s]
            .into_iter()
            .flatten()
        {
            check_non_negative(value)?;
        }

        let _guard = self.lock()?;
        let mut policy = self.load()?;
        let entry = policy.kind_overrides.entry(kind.to_string()).or_default();
        if patch.weight_default.is_some() {
            entry.weight_default = patch.weight_default;
        }
        if patch.decay_half_life_s.is_some() {
            entry.decay_half_life_s = patch.decay_half_life_s;
        }
        if patch.max_age_s.is_some() {
            entry.max_age_s = patch.max_age_s;
        }
        entry.weights.extend(patch.weights);
        persist::write_json_atomic(&self.path, &policy)?;
        log::info!("quorum policy for kind {} updated", kind);
        Ok(policy)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, QuorumError> {
        self.lock
            .lock()
            .map_err(|e| QuorumError::Storage(PersistError::LockPoisoned(e.to_string())))
    }
}

fn check_non_negative(value: f64) -> Result<(), QuorumError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(QuorumError::InvalidPolicy(format!(
            "expected a non-negative number, got {}",
            value
        )))
    }
}
