//! Persisted key-value store
//!
//! Holds the small amount of state that must survive restarts: the bearer
//! token, per-task summaries, selected-task pointers, free-text fields and
//! derived templates. Values are JSON; the whole map is rewritten on every
//! mutation through a temp file and rename.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LocalStoreError {
    #[error("Local store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Local store value for '{key}' is not valid: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Local store lock poisoned")]
    Poisoned,
}

pub type LocalStoreResult<T> = Result<T, LocalStoreError>;

/// Namespaced key helpers. Everything task-scoped carries the task id.
pub mod keys {
    pub const TOKEN: &str = "token";
    pub const USER_INFO: &str = "userInfo";

    /// Summary written when a flow creates a task.
    pub fn task_summary(task_id: &str) -> String {
        format!("task_{task_id}")
    }

    pub fn task_prefix(task_id: &str) -> String {
        format!("task:{task_id}:")
    }

    pub fn task_field(task_id: &str, field: &str) -> String {
        format!("task:{task_id}:field:{field}")
    }

    pub fn task_template(task_id: &str) -> String {
        format!("task:{task_id}:template")
    }

    pub fn selected_task(page: &str) -> String {
        format!("selected_task:{page}")
    }
}

#[derive(Debug)]
pub struct LocalStore {
    path: Option<PathBuf>,
    entries: RwLock<Map<String, Value>>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Map::new()),
        }
    }

    /// Opens (or lazily creates) the store file. A corrupt file is logged and
    /// replaced by an empty map rather than blocking startup.
    pub fn open(path: impl AsRef<Path>) -> LocalStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("⚠️ Local store at {} is unreadable, starting empty: {}", path.display(), e);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(source) => return Err(LocalStoreError::Io { path, source }),
        };

        debug!("Local store opened at {} ({} keys)", path.display(), entries.len());
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> LocalStoreResult<Option<T>> {
        let entries = self.entries.read().map_err(|_| LocalStoreError::Poisoned)?;
        entries
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| LocalStoreError::Serde {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).and_then(Value::as_str).map(str::to_string))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> LocalStoreResult<()> {
        let value = serde_json::to_value(value).map_err(|source| LocalStoreError::Serde {
            key: key.to_string(),
            source,
        })?;
        let mut entries = self.entries.write().map_err(|_| LocalStoreError::Poisoned)?;
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    pub fn remove(&self, key: &str) -> LocalStoreResult<bool> {
        let mut entries = self.entries.write().map_err(|_| LocalStoreError::Poisoned)?;
        let removed = entries.remove(key).is_some();
        if removed {
            self.flush(&entries)?;
        }
        Ok(removed)
    }

    /// Removes every key starting with `prefix`; returns how many went.
    pub fn remove_prefix(&self, prefix: &str) -> LocalStoreResult<usize> {
        let mut entries = self.entries.write().map_err(|_| LocalStoreError::Poisoned)?;
        let doomed: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        if !doomed.is_empty() {
            self.flush(&entries)?;
        }
        Ok(doomed.len())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    fn flush(&self, entries: &Map<String, Value>) -> LocalStoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| LocalStoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(entries).map_err(|source| LocalStoreError::Serde {
            key: "*".to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Summary {
        keyword: String,
        platform: String,
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = LocalStore::open(&path).unwrap();
        store.set(keys::TOKEN, &"abc").unwrap();
        store
            .set(
                &keys::task_summary("t1"),
                &Summary {
                    keyword: "coffee".into(),
                    platform: "dy".into(),
                },
            )
            .unwrap();
        drop(store);

        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.get_string(keys::TOKEN).as_deref(), Some("abc"));
        let summary: Summary = reopened.get(&keys::task_summary("t1")).unwrap().unwrap();
        assert_eq!(summary.keyword, "coffee");
    }

    #[test]
    fn remove_prefix_only_touches_that_task() {
        let store = LocalStore::in_memory();
        store.set(&keys::task_field("t1", "intro"), &"hello").unwrap();
        store.set(&keys::task_template("t1"), &"tpl").unwrap();
        store.set(&keys::task_field("t10", "intro"), &"other").unwrap();

        assert_eq!(store.remove_prefix(&keys::task_prefix("t1")).unwrap(), 2);
        assert!(store.contains(&keys::task_field("t10", "intro")));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = LocalStore::open(&path).unwrap();
        assert!(!store.contains(keys::TOKEN));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let store = LocalStore::in_memory();
        store.set("n", &42).unwrap();
        assert!(matches!(store.get::<Summary>("n"), Err(LocalStoreError::Serde { .. })));
    }
}
