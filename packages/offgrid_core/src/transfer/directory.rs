//! Discovery map of reachable hosts (`discovery/mesh_hosts.json`)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::persist::{self, PersistError};

/// Half-life of a sighting, in seconds.
const AVAILABILITY_HALF_LIFE_S: f64 = 60.0;

/// Link a host was last heard over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    File,
    Lora,
    Ble,
    Udp,
    #[serde(other)]
    Unknown,
}

impl TransportKind {
    /// Prior reliability of the link type.
    pub fn score(&self) -> f64 {
        match self {
            TransportKind::File => 1.2,
            TransportKind::Lora => 1.1,
            TransportKind::Ble => 1.05,
            TransportKind::Udp | TransportKind::Unknown => 1.0,
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "file" => TransportKind::File,
            "lora" => TransportKind::Lora,
            "ble" => TransportKind::Ble,
            "udp" => TransportKind::Udp,
            _ => TransportKind::Unknown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub node_id: String,
    pub via: TransportKind,
    /// Unix seconds
    pub last_seen: i64,
}

impl DirectoryEntry {
    /// `via_score * 0.5^(age/60)`
    pub fn availability(&self, now: i64) -> f64 {
        let age = (now - self.last_seen).max(0) as f64;
        self.via.score() * 0.5f64.powf(age / AVAILABILITY_HALF_LIFE_S)
    }
}

pub type DirectoryMap = BTreeMap<String, DirectoryEntry>;

#[derive(Debug)]
pub struct EndpointDirectory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EndpointDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<DirectoryMap, PersistError> {
        persist::read_json_or(&self.path, DirectoryMap::new)
    }

    /// Upsert a sighting. `last_seen` defaults to now.
    pub fn merge_entry(
        &self,
        endpoint: &str,
        node_id: &str,
        via: TransportKind,
        last_seen: Option<i64>,
    ) -> Result<DirectoryEntry, PersistError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| PersistError::LockPoisoned(e.to_string()))?;
        let mut map = self.load()?;
        let entry = DirectoryEntry {
            node_id: node_id.to_string(),
            via,
            last_seen: last_seen.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        };
        map.insert(endpoint.to_string(), entry.clone());
        persist::write_json_atomic(&self.path, &map)?;
        log::debug!("directory: {} ({}) via {:?}", endpoint, node_id, via);
        Ok(entry)
    }

    /// Endpoints with their availability, best first.
    pub fn ranked(&self, now: i64) -> Result<Vec<(String, f64)>, PersistError> {
        let mut scored: Vec<(String, f64)> = self
            .load()?
            .into_iter()
            .map(|(endpoint, entry)| {
                let score = entry.availability(now);
                (endpoint, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(scored)
    }

    /// Endpoints ordered by current availability.
    pub fn endpoints(&self) -> Result<Vec<String>, PersistError> {
        Ok(self
            .ranked(chrono::Utc::now().timestamp())?
            .into_iter()
            .map(|(endpoint, _)| endpoint)
            .collect())
    }

    /// node id -> endpoint, for price lookups.
    pub fn node_endpoints(&self) -> Result<HashMap<String, String>, PersistError> {
        Ok(self
            .load()?
            .into_iter()
            .map(|(endpoint, entry)| (entry.node_id, endpoint))
            .collect())
    }
}
