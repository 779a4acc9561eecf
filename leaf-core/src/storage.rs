use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::error::PersistenceError;

/// Durable string storage addressed by key. Writes larger than a store's
/// quota fail with [`PersistenceError::QuotaExceeded`].
pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn save(&self, key: &str, payload: &str) -> Result<(), PersistenceError>;
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

pub struct FileStateStore {
    root: PathBuf,
    quota: Option<usize>,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root, quota: None })
    }

    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{name}.json"))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let path = self.path_for(key);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(Some(buf))
    }

    fn save(&self, key: &str, payload: &str) -> Result<(), PersistenceError> {
        if self.quota.is_some_and(|quota| payload.len() > quota) {
            return Err(PersistenceError::QuotaExceeded);
        }
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            quota: Some(bytes),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn save(&self, key: &str, payload: &str) -> Result<(), PersistenceError> {
        if self.quota.is_some_and(|quota| payload.len() > quota) {
            return Err(PersistenceError::QuotaExceeded);
        }
        self.inner.lock().insert(key.to_owned(), payload.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_round_trips_and_removes() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state")).unwrap();
        assert_eq!(store.load("leaf-reading-progress").unwrap(), None);

        store.save("leaf-reading-progress", "{\"a\":1}").unwrap();
        assert_eq!(
            store.load("leaf-reading-progress").unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert!(!store.root().join("leaf-reading-progress.json.tmp").exists());

        store.remove("leaf-reading-progress").unwrap();
        store.remove("leaf-reading-progress").unwrap();
        assert_eq!(store.load("leaf-reading-progress").unwrap(), None);
    }

    #[test]
    fn quota_rejects_oversized_payloads() {
        let store = MemoryStateStore::with_quota(4);
        store.save("k", "1234").unwrap();
        assert!(matches!(
            store.save("k", "12345"),
            Err(PersistenceError::QuotaExceeded)
        ));
        assert_eq!(store.load("k").unwrap().as_deref(), Some("1234"));

        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap().with_quota(2);
        assert!(matches!(
            store.save("k", "abc"),
            Err(PersistenceError::QuotaExceeded)
        ));
    }
}
