use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
/// Failure of the local key-value storage.
pub enum KvError {
    /// Reading or writing the backing file failed.
    #[error("local storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// A value could not be encoded.
    #[error("local storage encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One write of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Insert or overwrite `key`.
    Set {
        /// Entry name.
        key: String,
        /// Raw stored text.
        value: String,
    },
    /// Delete `key` if present.
    Remove {
        /// Entry name.
        key: String,
    },
}

impl KvOp {
    /// Set operation.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Remove operation.
    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }
}

/// Synchronous string-to-string storage that survives process restarts.
///
/// Values are raw text so that a corrupt entry can be detected (and ignored) by the reader
/// instead of failing the whole store.
pub trait KeyValueStore: Send + Sync {
    /// Raw value of `key`.
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Apply every operation or none of them.
    fn apply(&self, ops: Vec<KvOp>) -> Result<(), KvError>;

    /// Single-key [`KeyValueStore::apply`].
    fn set(&self, key: &str, value: String) -> Result<(), KvError> {
        self.apply(vec![KvOp::set(key, value)])
    }

    /// Single-key removal.
    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.apply(vec![KvOp::remove(key)])
    }
}

fn apply_ops(entries: &mut HashMap<String, String>, ops: Vec<KvOp>) {
    for op in ops {
        match op {
            KvOp::Set { key, value } => {
                entries.insert(key, value);
            }
            KvOp::Remove { key } => {
                entries.remove(&key);
            }
        }
    }
}

/// Volatile store, used by tests and by observers that do not need to survive a restart.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries().get(key).cloned())
    }

    fn apply(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        apply_ops(&mut self.entries(), ops);
        Ok(())
    }
}

/// Store persisted as one JSON object on disk.
///
/// Every batch rewrites a sibling temporary file and renames it over the target, so a crash
/// leaves either the old or the new content.
pub struct JsonFileKvStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileKvStore {
    /// Open the store, starting empty when the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, KvError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding corrupt local state");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), KvError> {
        let contents = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn apply(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        apply_ops(&mut next, ops);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}
