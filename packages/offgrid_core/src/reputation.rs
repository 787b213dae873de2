//! Per-endpoint hit/miss counters (`reputation.json`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::persist::{self, PersistError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reputation {
    pub hits: u64,
    pub misses: u64,
}

impl Reputation {
    /// Fraction of successful interactions; unknown endpoints score 0.5.
    pub fn score(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.5
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub type ReputationTable = BTreeMap<String, Reputation>;

#[derive(Debug)]
pub struct ReputationBook {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ReputationBook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ReputationTable, PersistError> {
        persist::read_json_or(&self.path, ReputationTable::new)
    }

    pub fn get(&self, endpoint: &str) -> Result<Reputation, PersistError> {
        Ok(self.load()?.get(endpoint).copied().unwrap_or_default())
    }

    pub fn record_hit(&self, endpoint: &str) -> Result<(), PersistError> {
        self.update(|table| table.entry(endpoint.to_string()).or_default().hits += 1)
    }

    pub fn record_miss(&self, endpoint: &str) -> Result<(), PersistError> {
        self.update(|table| table.entry(endpoint.to_string()).or_default().misses += 1)
    }

    /// Read-modify-write under the book's lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ReputationTable) -> R) -> Result<R, PersistError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| PersistError::LockPoisoned(e.to_string()))?;
        let mut table = self.load()?;
        let result = f(&mut table);
        persist::write_json_atomic(&self.path, &table)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_and_misses_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let book = ReputationBook::new(dir.path().join("reputation.json"));

        book.record_hit("http://a").unwrap();
        book.record_hit("http://a").unwrap();
        book.record_miss("http://a").unwrap();

        let rep = book.get("http://a").unwrap();
        assert_eq!(rep, Reputation { hits: 2, misses: 1 });
        assert!((rep.score() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(book.get("http://unknown").unwrap().score(), 0.5);
    }
}
