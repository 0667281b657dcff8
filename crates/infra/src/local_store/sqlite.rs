//! SQLite-backed local store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::Row;
use tokio::sync::Mutex;

use super::{LocalStore, StorageError};

/// File name used inside the client data directory.
pub const DEFAULT_DB_FILE: &str = "stockcount.db";

/// Key/value records in a single SQLite table.
///
/// Cheap to clone and safe to share across tasks. The database is opened
/// lazily on first use.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Store at `<dir>/stockcount.db`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(DEFAULT_DB_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_initialized(&self) -> anyhow::Result<SqlitePool> {
        let mut pool_guard = self.pool.lock().await;
        if let Some(pool) = pool_guard.as_ref() {
            return Ok(pool.clone());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory at {parent:?}"))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite store at {:?}", self.path))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_records (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create local_records table")?;

        *pool_guard = Some(pool.clone());
        Ok(pool)
    }

    async fn pool(&self) -> Result<SqlitePool, StorageError> {
        self.ensure_initialized()
            .await
            .map_err(|err| StorageError::Open(format!("{err:#}")))
    }

    /// Close the pool; the next call reopens it.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }
}

#[async_trait::async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT value FROM local_records WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await
            .map_err(|e| StorageError::Read(e.to_string()))?;

        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(|e| StorageError::Read(e.to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO local_records (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM local_records WHERE key = ?1")
            .bind(key)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_dir(dir.path());
        store.put("k", "v1").await.unwrap();
        store.put("k", "v2").await.unwrap();
        store.close().await;

        let reopened = SqliteStore::in_dir(dir.path());
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v2"));

        reopened.remove("k").await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn opens_in_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_dir(dir.path());
        let pool = store.pool().await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        store.close().await;
    }

    #[tokio::test]
    async fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::in_dir(dir.path().join("nested").join("data"));
        store.put("k", "v").await.unwrap();
        assert!(store.path().exists());
    }
}
