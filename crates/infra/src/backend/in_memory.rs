use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

use stockcount_core::{CorrelationId, CountEvent, Serial, StockItem};

use super::r#trait::{
    BackendError, BackendStore, ChangeEvent, ChangeKind, InsertOutcome, InsertReport, RecordAck,
    Table,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Tables {
    stock: BTreeMap<Serial, StockItem>,
    /// Insertion order.
    counts: Vec<CountEvent>,
    by_serial: HashMap<Serial, usize>,
    by_correlation: HashMap<CorrelationId, usize>,
}

/// In-memory backend with a uniqueness constraint on the count identifier.
///
/// Intended for tests/dev and the offline demo binary. Supports failure
/// injection so sync behavior can be exercised deterministically.
#[derive(Debug)]
pub struct InMemoryBackend {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
    push_enabled: bool,
    offline: AtomicBool,
    fail_next_inserts: AtomicU32,
    insert_calls: AtomicUsize,
    insert_latency: RwLock<Option<Duration>>,
    fail_listings: AtomicBool,
    listing_latency: RwLock<Option<Duration>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            changes,
            push_enabled: true,
            offline: AtomicBool::new(false),
            fail_next_inserts: AtomicU32::new(0),
            insert_calls: AtomicUsize::new(0),
            insert_latency: RwLock::new(None),
            fail_listings: AtomicBool::new(false),
            listing_latency: RwLock::new(None),
        }
    }

    /// Backend without a push channel (`subscribe` returns `None`).
    pub fn without_push() -> Self {
        Self {
            push_enabled: false,
            ..Self::new()
        }
    }

    pub fn with_stock(self, items: impl IntoIterator<Item = StockItem>) -> Self {
        if let Ok(mut tables) = self.tables.write() {
            for item in items {
                tables.stock.insert(item.serial.clone(), item);
            }
        }
        self
    }

    /// Simulate a network outage: every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` batch inserts.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_next_inserts.store(n, Ordering::SeqCst);
    }

    /// Delay every batch insert (keeps a sync in flight).
    pub fn set_insert_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.insert_latency.write() {
            *slot = latency;
        }
    }

    /// Fail every count listing while set; inserts are unaffected.
    pub fn fail_listings(&self, fail: bool) {
        self.fail_listings.store(fail, Ordering::SeqCst);
    }

    /// Delay count listings after the rows are read, so the caller gets a
    /// snapshot older than the moment it returns.
    pub fn set_listing_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.listing_latency.write() {
            *slot = latency;
        }
    }

    /// Number of batch submissions received, failed ones included.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine.
        let _ = self.changes.send(event);
    }

    fn poisoned() -> BackendError {
        BackendError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl BackendStore for InMemoryBackend {
    async fn list_stock_items(&self) -> Result<Vec<StockItem>, BackendError> {
        self.check_online()?;
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.stock.values().cloned().collect())
    }

    async fn upsert_stock_items(&self, items: &[StockItem]) -> Result<usize, BackendError> {
        self.check_online()?;
        let mut changes = Vec::with_capacity(items.len());
        {
            let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
            for item in items {
                let kind = match tables.stock.insert(item.serial.clone(), item.clone()) {
                    Some(_) => ChangeKind::Update,
                    None => ChangeKind::Insert,
                };
                changes.push(ChangeEvent::stock(kind, item.clone()));
            }
        }
        for change in changes {
            self.publish(change);
        }
        Ok(items.len())
    }

    async fn insert_count_events(&self, batch: &[CountEvent]) -> Result<InsertReport, BackendError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.insert_latency.read().map(|l| *l).unwrap_or(None);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.check_online()?;
        let injected = self
            .fail_next_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Unavailable("injected failure".to_string()));
        }

        // Whole batch under one lock: atomic from the client's point of view.
        let mut report = InsertReport::default();
        let mut inserted = Vec::new();
        {
            let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
            for event in batch {
                let outcome = if tables.by_correlation.contains_key(&event.correlation_id) {
                    InsertOutcome::Replayed
                } else if let Some(&idx) = tables.by_serial.get(&event.serial) {
                    InsertOutcome::Duplicate {
                        existing: tables.counts[idx].clone(),
                    }
                } else {
                    let stored = event.clone().confirm();
                    let idx = tables.counts.len();
                    tables.by_serial.insert(stored.serial.clone(), idx);
                    tables.by_correlation.insert(stored.correlation_id, idx);
                    tables.counts.push(stored.clone());
                    inserted.push(stored);
                    InsertOutcome::Inserted
                };

                report.records.push(RecordAck {
                    correlation_id: event.correlation_id,
                    serial: event.serial.clone(),
                    outcome,
                });
            }
        }

        for stored in inserted {
            self.publish(ChangeEvent::count(ChangeKind::Insert, stored));
        }
        Ok(report)
    }

    async fn list_count_events(&self, limit: Option<usize>) -> Result<Vec<CountEvent>, BackendError> {
        self.check_online()?;
        if self.fail_listings.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected listing failure".to_string()));
        }

        let mut events = {
            let tables = self.tables.read().map_err(|_| Self::poisoned())?;
            tables.counts.clone()
        };
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.correlation_id.cmp(&a.correlation_id))
        });
        if let Some(limit) = limit {
            events.truncate(limit);
        }

        let latency = self.listing_latency.read().map(|l| *l).unwrap_or(None);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(events)
    }

    async fn count_count_events(&self) -> Result<usize, BackendError> {
        self.check_online()?;
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.counts.len())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.push_enabled.then(|| self.changes.subscribe())
    }

    async fn delete_all(&self, table: Table) -> Result<usize, BackendError> {
        self.check_online()?;
        let removed = {
            let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
            match table {
                Table::Stock => {
                    let n = tables.stock.len();
                    tables.stock.clear();
                    n
                }
                Table::CountRecords => {
                    let n = tables.counts.len();
                    tables.counts.clear();
                    tables.by_serial.clear();
                    tables.by_correlation.clear();
                    n
                }
            }
        };
        self.publish(ChangeEvent::cleared(table));
        Ok(removed)
    }
}
