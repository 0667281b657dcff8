use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use stockcount_core::{CorrelationId, CountEvent, Serial, StockItem};

/// Backend tables the client reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Stock,
    CountRecords,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Stock => "stock",
            Table::CountRecords => "count_records",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row carried by a change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum ChangeRecord {
    Stock(StockItem),
    CountRecords(CountEvent),
}

/// Push notification from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// `None` for bulk deletes.
    pub record: Option<ChangeRecord>,
}

impl ChangeEvent {
    pub fn stock(kind: ChangeKind, item: StockItem) -> Self {
        Self {
            table: Table::Stock,
            kind,
            record: Some(ChangeRecord::Stock(item)),
        }
    }

    pub fn count(kind: ChangeKind, event: CountEvent) -> Self {
        Self {
            table: Table::CountRecords,
            kind,
            record: Some(ChangeRecord::CountRecords(event)),
        }
    }

    pub fn cleared(table: Table) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            record: None,
        }
    }
}

/// Per-record result of a batch insert.
///
/// Every variant is an acknowledgment: the record is durably accounted for
/// on the backend and may leave the pending queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InsertOutcome {
    /// Newly stored.
    Inserted,
    /// Same correlation id was already stored (idempotent retry).
    Replayed,
    /// The identifier was already counted by another event, returned here
    /// as the backend holds it.
    Duplicate { existing: CountEvent },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAck {
    pub correlation_id: CorrelationId,
    pub serial: Serial,
    pub outcome: InsertOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    pub records: Vec<RecordAck>,
}

impl InsertReport {
    pub fn acknowledged(&self) -> impl Iterator<Item = &CorrelationId> {
        self.records.iter().map(|r| &r.correlation_id)
    }

    pub fn inserted(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome == InsertOutcome::Inserted)
            .count()
    }

    pub fn duplicates(&self) -> impl Iterator<Item = &RecordAck> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, InsertOutcome::Duplicate { .. }))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Backend operation error.
///
/// A failed call acknowledges nothing; callers retry the whole request.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed backend payload: {0}")]
    Decode(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Whether a later retry can be expected to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            BackendError::Decode(_) | BackendError::Rejected(_) => false,
        }
    }
}

/// Shared backend store: the single arbiter of "already counted".
///
/// Adapters must enforce one stored count event per identifier, and must
/// treat a re-sent correlation id as a replay rather than a duplicate.
#[async_trait::async_trait]
pub trait BackendStore: Send + Sync {
    async fn list_stock_items(&self) -> Result<Vec<StockItem>, BackendError>;

    /// Insert or replace stock items by identifier. Returns rows written.
    async fn upsert_stock_items(&self, items: &[StockItem]) -> Result<usize, BackendError>;

    async fn insert_count_events(&self, batch: &[CountEvent]) -> Result<InsertReport, BackendError>;

    /// Count events, newest first.
    async fn list_count_events(&self, limit: Option<usize>) -> Result<Vec<CountEvent>, BackendError>;

    async fn count_count_events(&self) -> Result<usize, BackendError>;

    /// Push notifications for both tables; `None` when the adapter has no
    /// push channel and the client must run refresh-only.
    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>>;

    /// Delete every row of `table`. Returns rows removed when known.
    async fn delete_all(&self, table: Table) -> Result<usize, BackendError>;
}

#[async_trait::async_trait]
impl<S> BackendStore for Arc<S>
where
    S: BackendStore + ?Sized,
{
    async fn list_stock_items(&self) -> Result<Vec<StockItem>, BackendError> {
        (**self).list_stock_items().await
    }

    async fn upsert_stock_items(&self, items: &[StockItem]) -> Result<usize, BackendError> {
        (**self).upsert_stock_items(items).await
    }

    async fn insert_count_events(&self, batch: &[CountEvent]) -> Result<InsertReport, BackendError> {
        (**self).insert_count_events(batch).await
    }

    async fn list_count_events(&self, limit: Option<usize>) -> Result<Vec<CountEvent>, BackendError> {
        (**self).list_count_events(limit).await
    }

    async fn count_count_events(&self) -> Result<usize, BackendError> {
        (**self).count_count_events().await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        (**self).subscribe()
    }

    async fn delete_all(&self, table: Table) -> Result<usize, BackendError> {
        (**self).delete_all(table).await
    }
}
