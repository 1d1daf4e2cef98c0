//! Small persistent key-value cache.
//!
//! Backs fast caches (provider health snapshots, realtime session hints) that
//! are nice to keep across restarts but never authoritative — the SQL store
//! owns all durable state. When no directory is configured the store runs
//! purely in memory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::error::{AgentError, Result};

enum Backing {
    Memory(Mutex<HashMap<String, Value>>),
    Disk(PathBuf),
}

pub struct KvStore {
    backing: Backing,
}

impl KvStore {
    /// In-memory store; contents die with the process.
    pub fn memory() -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(HashMap::new())),
        }
    }

    /// Disk-backed store rooted at `dir`; one JSON file per key.
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| AgentError::Store(e.to_string()))?;
        Ok(Self {
            backing: Backing::Disk(dir),
        })
    }

    /// Choose disk when a directory is configured, memory otherwise.
    pub fn from_config(dir: Option<PathBuf>) -> Result<Self> {
        match dir {
            Some(d) if !d.as_os_str().is_empty() => Self::open(d),
            _ => Ok(Self::memory()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match &self.backing {
            Backing::Memory(map) => map.lock().unwrap().get(key).cloned(),
            Backing::Disk(dir) => {
                let path = dir.join(file_name(key));
                let raw = std::fs::read_to_string(path).ok()?;
                serde_json::from_str(&raw).ok()
            }
        }
    }

    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        match &self.backing {
            Backing::Memory(map) => {
                map.lock().unwrap().insert(key.to_string(), value.clone());
                Ok(())
            }
            Backing::Disk(dir) => {
                let path = dir.join(file_name(key));
                let tmp = path.with_extension("json.tmp");
                let raw = serde_json::to_string_pretty(value)
                    .map_err(|e| AgentError::Store(e.to_string()))?;
                std::fs::write(&tmp, raw).map_err(|e| AgentError::Store(e.to_string()))?;
                // rename is atomic on the same filesystem
                std::fs::rename(&tmp, &path).map_err(|e| AgentError::Store(e.to_string()))?;
                Ok(())
            }
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        match &self.backing {
            Backing::Memory(map) => {
                map.lock().unwrap().remove(key);
                Ok(())
            }
            Backing::Disk(dir) => {
                let path = dir.join(file_name(key));
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(key, error = %e, "kv delete failed");
                        return Err(AgentError::Store(e.to_string()));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Map an arbitrary key onto a safe file name.
fn file_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trip() {
        let kv = KvStore::memory();
        kv.put("a", &serde_json::json!({"n": 1})).unwrap();
        assert_eq!(kv.get("a").unwrap()["n"], 1);
        kv.delete("a").unwrap();
        assert!(kv.get("a").is_none());
    }

    #[test]
    fn disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path().to_path_buf()).unwrap();
        kv.put("health/openai", &serde_json::json!("ok")).unwrap();
        assert_eq!(kv.get("health/openai").unwrap(), "ok");
        kv.delete("health/openai").unwrap();
        assert!(kv.get("health/openai").is_none());
        // deleting a missing key is not an error
        kv.delete("health/openai").unwrap();
    }

    #[test]
    fn empty_dir_config_means_memory() {
        let kv = KvStore::from_config(Some(PathBuf::new())).unwrap();
        kv.put("k", &serde_json::json!(true)).unwrap();
        assert_eq!(kv.get("k").unwrap(), true);
    }
}
