//! Durable local storage for the client (pending queue, stock cache).
//!
//! A small namespaced key/value boundary: each record is one serialized
//! document written whole, so a write either lands completely or not at all.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open local storage: {0}")]
    Open(String),

    #[error("local storage write failed: {0}")]
    Write(String),

    #[error("local storage read failed: {0}")]
    Read(String),
}

#[async_trait::async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the record under `key`; returns only once it is durable.
    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<S> LocalStore for Arc<S>
where
    S: LocalStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).put(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key).await
    }
}
