use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{LocalStore, StorageError};

/// Process-local store for tests and the in-memory demo.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, String>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` fail, like a full storage quota.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Overwrite a record bypassing any failure injection.
    pub fn seed(&self, key: &str, value: &str) {
        if let Ok(mut records) = self.records.write() {
            records.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait::async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::Read("lock poisoned".to_string()))?;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write("quota exceeded".to_string()));
        }
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::Write("lock poisoned".to_string()))?;
        records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::Write("lock poisoned".to_string()))?;
        records.remove(key);
        Ok(())
    }
}
