//! Offline-first pending queue persisted to local storage.
//!
//! Count events live here from the moment they are admitted until the
//! backend acknowledges them. The whole list is one record in the
//! [`LocalStore`]; every mutation rewrites it while the in-memory lock is
//! held, so no observer can see memory and storage disagree.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use stockcount_core::{CorrelationId, CountEvent, Serial};
use stockcount_infra::{LocalStore, StorageError};

/// Storage key of the serialized queue.
pub const PENDING_QUEUE_KEY: &str = "stockcount.pending_queue";

#[derive(Debug, Error)]
pub enum QueueError {
    /// The mutation is kept in memory but could not be made durable.
    #[error("failed to persist pending queue ({queued} queued): {source}")]
    Persist {
        queued: usize,
        #[source]
        source: StorageError,
    },

    #[error("failed to load pending queue: {0}")]
    Load(#[source] StorageError),

    /// The stored queue was unreadable and has been reset to empty.
    #[error("pending queue was corrupt and has been reset: {0}")]
    Corrupt(String),
}

pub struct PendingQueue {
    store: Arc<dyn LocalStore>,
    entries: Mutex<Vec<CountEvent>>,
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue").finish_non_exhaustive()
    }
}

impl PendingQueue {
    /// Empty queue; call [`PendingQueue::load`] to restore persisted entries.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Restore the queue from storage.
    ///
    /// An unreadable record resets the queue to empty (and overwrites the
    /// record) instead of failing startup; the reset is reported as
    /// [`QueueError::Corrupt`] and the queue is usable afterwards.
    pub async fn load(&self) -> Result<usize, QueueError> {
        let mut entries = self.entries.lock().await;
        let raw = self.store.get(PENDING_QUEUE_KEY).await.map_err(QueueError::Load)?;

        let Some(raw) = raw else {
            entries.clear();
            return Ok(0);
        };

        match serde_json::from_str::<Vec<CountEvent>>(&raw) {
            Ok(restored) => {
                *entries = restored;
                tracing::info!(count = entries.len(), "pending queue restored");
                Ok(entries.len())
            }
            Err(err) => {
                tracing::error!(error = %err, "pending queue unreadable; resetting to empty");
                entries.clear();
                if let Err(persist) = self.store.put(PENDING_QUEUE_KEY, "[]").await {
                    tracing::error!(error = %persist, "failed to overwrite corrupt pending queue");
                }
                Err(QueueError::Corrupt(err.to_string()))
            }
        }
    }

    /// Append and persist. Returns the new queue length.
    ///
    /// On a persist failure the event stays queued in memory and the error
    /// is returned so the caller can warn; the next successful persist
    /// writes it out.
    pub async fn enqueue(&self, event: CountEvent) -> Result<usize, QueueError> {
        let mut entries = self.entries.lock().await;
        entries.push(event);
        self.persist(&entries).await?;
        Ok(entries.len())
    }

    /// Snapshot of the current contents in insertion order. Nothing is removed.
    pub async fn drain_all(&self) -> Vec<CountEvent> {
        self.entries.lock().await.clone()
    }

    /// Remove acknowledged entries and persist. Returns how many were removed.
    pub async fn clear_confirmed(
        &self,
        ids: impl IntoIterator<Item = CorrelationId>,
    ) -> Result<usize, QueueError> {
        let ids: HashSet<CorrelationId> = ids.into_iter().collect();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.correlation_id));
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    /// Drop everything (administrative reset).
    pub async fn clear_all(&self) -> Result<usize, QueueError> {
        let mut entries = self.entries.lock().await;
        let removed = entries.len();
        entries.clear();
        self.persist(&entries).await?;
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Identifiers currently pending.
    pub async fn serials(&self) -> HashSet<Serial> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.serial.clone())
            .collect()
    }

    async fn persist(&self, entries: &[CountEvent]) -> Result<(), QueueError> {
        let json = serde_json::to_string(entries).map_err(|e| QueueError::Persist {
            queued: entries.len(),
            source: StorageError::Write(e.to_string()),
        })?;
        self.store
            .put(PENDING_QUEUE_KEY, &json)
            .await
            .map_err(|source| {
                tracing::error!(error = %source, queued = entries.len(), "pending queue persist failed");
                QueueError::Persist {
                    queued: entries.len(),
                    source,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockcount_core::OperatorId;
    use stockcount_infra::MemoryStore;

    fn event(serial: &str) -> CountEvent {
        CountEvent::pending(
            Serial::parse(serial).unwrap(),
            "Item",
            OperatorId::parse("E1").unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn enqueue_is_durable_before_returning() {
        let store = Arc::new(MemoryStore::new());
        let queue = PendingQueue::new(store.clone());
        let e = event("SN1");
        assert_eq!(queue.enqueue(e.clone()).await.unwrap(), 1);

        // A fresh queue over the same storage models a restart.
        let restarted = PendingQueue::new(store);
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.drain_all().await, vec![e]);
    }

    #[tokio::test]
    async fn persist_failure_keeps_event_in_memory() {
        let store = Arc::new(MemoryStore::new());
        let queue = PendingQueue::new(store.clone());
        store.reject_writes(true);

        let err = queue.enqueue(event("SN1")).await.unwrap_err();
        assert!(matches!(err, QueueError::Persist { queued: 1, .. }));
        assert_eq!(queue.len().await, 1);

        store.reject_writes(false);
        queue.enqueue(event("SN2")).await.unwrap();
        let restarted = PendingQueue::new(store);
        assert_eq!(restarted.load().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn corrupt_storage_resets_to_empty() {
        let store = Arc::new(MemoryStore::new());
        store.seed(PENDING_QUEUE_KEY, "{not json");
        let queue = PendingQueue::new(store.clone());

        assert!(matches!(queue.load().await, Err(QueueError::Corrupt(_))));
        assert!(queue.is_empty().await);
        assert_eq!(store.get(PENDING_QUEUE_KEY).await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn drain_does_not_remove_and_clear_confirmed_does() {
        let queue = PendingQueue::new(Arc::new(MemoryStore::new()));
        let a = event("a");
        let b = event("b");
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(b.clone()).await.unwrap();

        assert_eq!(queue.drain_all().await.len(), 2);
        assert_eq!(queue.len().await, 2);

        assert_eq!(queue.clear_confirmed([a.correlation_id]).await.unwrap(), 1);
        assert_eq!(queue.drain_all().await, vec![b]);
    }
}
