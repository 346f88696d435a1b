//! Key-value persistence shared by the quota gate, settings and the handoff
//! channel.
//!
//! Values are JSON. [`FileStore`] keeps one file per key under a root
//! directory and replaces files atomically; [`MemoryStore`] is the
//! in-process variant.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding for {key}: {source}")]
    Encoding {
        key: String,
        source: serde_json::Error,
    },
    #[error("store walk: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("store persist: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Get/set over JSON values with read-your-writes consistency for a single
/// process. No cross-process atomic update is offered.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    /// Remove `key`; returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
    /// Every key starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Typed helpers on top of [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|source| StoreError::Encoding {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let v = serde_json::to_value(value).map_err(|source| StoreError::Encoding {
            key: key.to_string(),
            source,
        })?;
        self.set(key, v)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

pub type SharedStore = Arc<dyn KeyValueStore>;

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// On-disk record; the key is stored alongside the value because file names
/// are hashes.
#[derive(Serialize, Deserialize)]
struct Entry {
    key: String,
    value: Value,
}

/// Directory-backed store rooted at `root`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory exists.
    pub fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.root.join("kv"))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe path for a key: `kv/<sha1[0..2]>/<sha1>.json`.
    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        let hash = hex::encode(hasher.finalize());
        self.root
            .join("kv")
            .join(&hash[0..2])
            .join(format!("{hash}.json"))
    }

    fn read_entry(path: &Path) -> Result<Entry, StoreError> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|source| StoreError::Encoding {
            key: path.display().to_string(),
            source,
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match Self::read_entry(&self.entry_path(key)) {
            Ok(entry) => Ok(Some(entry.value)),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent_dir)?;
        // Write to a temp file and rename so readers never see a partial entry.
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        let entry = Entry {
            key: key.to_string(),
            value,
        };
        serde_json::to_writer(&tmp, &entry).map_err(|source| StoreError::Encoding {
            key: key.to_string(),
            source,
        })?;
        tmp.persist(&path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join("kv");
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut keys = vec![];
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            // A concurrent remove between listing and reading is not an error.
            match Self::read_entry(entry.path()) {
                Ok(e) if e.key.starts_with(prefix) => keys.push(e.key),
                Ok(_) => {}
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
