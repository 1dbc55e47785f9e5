use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Storage io failure {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage quota of {quota} bytes exceeded, {requested} bytes requested")]
    QuotaExceeded { quota: usize, requested: usize },

    #[error("Storage unavailable")]
    Unavailable,
}

/// Client side key-value storage holding serialized values under named slots.
/// Passed into the local repository so tests can swap the real medium for a fake.
pub trait KeyValueStore: Send + Sync {
    /// Returns Ok(None) if nothing is stored under the key
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Keeps everything in memory. The quota mimics a browser style storage limit.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    values: parking_lot::RwLock<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl InMemoryKeyValueStore {
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Makes every following call fail as if the medium was disabled
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(StorageError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let mut values = self.values.write();
        if let Some(quota) = self.quota_bytes {
            let requested = values
                .iter()
                .filter(|(stored_key, _)| stored_key.as_str() != key)
                .map(|(stored_key, stored)| stored_key.len() + stored.len())
                .sum::<usize>()
                + key.len()
                + value.len();
            if requested > quota {
                return Err(StorageError::QuotaExceeded { quota, requested });
            }
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.values.write().remove(key);
        Ok(())
    }
}

/// Stores each key as `<key>.json` inside a data directory.
/// Writes go to a temporary file first and are renamed into place.
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        let tmp_file = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp_file, value)?;
        if let Err(err) = fs::rename(&tmp_file, self.path_for(key)) {
            let _ = fs::remove_file(&tmp_file);
            return Err(err.into());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
