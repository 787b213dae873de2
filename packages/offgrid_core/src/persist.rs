//! JSON file persistence
//!
//! Every store in this crate is a whole-file JSON document. Reads of a missing
//! file fall back to a caller-provided default; writes go to a sibling `.tmp`
//! file first and are renamed into place so a killed process never leaves a
//! half-written document behind.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Read a JSON document, returning `default()` when the file does not exist.
pub fn read_json_or<T, F>(path: &Path, default: F) -> Result<T, PersistError>
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    if !path.exists() {
        return Ok(default());
    }
    let data = std::fs::read(path).map_err(|e| PersistError::IoError(e.to_string()))?;
    serde_json::from_slice(&data).map_err(|e| {
        PersistError::DeserializationError(format!("{}: {}", path.display(), e))
    })
}

/// Read a JSON document that must exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let data = std::fs::read(path)
        .map_err(|e| PersistError::IoError(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&data).map_err(|e| {
        PersistError::DeserializationError(format!("{}: {}", path.display(), e))
    })
}

/// Write a JSON document atomically (temp file + rename).
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| PersistError::SerializationError(e.to_string()))?;
    write_bytes_atomic(path, &json)
}

/// Write raw bytes atomically (temp file + rename).
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PersistError::IoError(e.to_string()))?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, bytes).map_err(|e| PersistError::IoError(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| PersistError::IoError(e.to_string()))?;
    Ok(())
}

/// Serialize a value as compact JSON with object keys sorted.
///
/// Used wherever bytes are hashed or signed, so two nodes produce the same
/// digest for the same logical document.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, PersistError> {
    let value = serde_json::to_value(value)
        .map_err(|e| PersistError::SerializationError(e.to_string()))?;
    serde_json::to_vec(&sorted(value)).map_err(|e| PersistError::SerializationError(e.to_string()))
}

// Rebuild objects in key order; insertion order must not leak into digests
// even if serde_json's `preserve_order` feature is unified in.
fn sorted(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (key, inner) in entries {
                out.insert(key, sorted(inner));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sorted).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let value: Vec<u32> = read_json_or(&path, || vec![7]).unwrap();
        assert_eq!(value, vec![7]);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        let mut doc = HashMap::new();
        doc.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &doc).unwrap();

        let loaded: HashMap<String, u32> = read_json(&path).unwrap();
        assert_eq!(loaded, doc);
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result: Result<Vec<u32>, _> = read_json_or(&path, Vec::new);
        assert!(matches!(result, Err(PersistError::DeserializationError(_))));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Doc {
            zeta: u8,
            alpha: u8,
        }
        let bytes = canonical_json(&Doc { zeta: 1, alpha: 2 }).unwrap();
        assert_eq!(bytes, br#"{"alpha":2,"zeta":1}"#.to_vec());
    }
}
