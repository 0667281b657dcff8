//! Sync Engine: drains the pending queue into the backend.
//!
//! - single-flight: a call while another sync is running returns at once
//! - the whole queue goes out as one batch; the backend acknowledges per record
//! - transient failures back off `retry_delay * 2^(n-1)` up to `retry_attempts`
//! - nothing leaves the queue without an acknowledgment

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, broadcast};

use stockcount_core::{CorrelationId, CountEvent};
use stockcount_infra::{BackendError, BackendStore, InsertOutcome, InsertReport, RecordAck};

use crate::config::ClientConfig;
use crate::offline::{ConnectivityState, OfflineMode};
use crate::pending_queue::PendingQueue;
use crate::state::{self, SharedState};

const SYNC_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Retry ceiling reached; entries stay queued.
    #[error("sync failed after {attempts} attempts; next retry in {retry_after:?}: {source}")]
    Exhausted {
        attempts: u32,
        retry_after: Duration,
        source: BackendError,
    },

    /// Non-transient backend failure; not retried, entries stay queued.
    #[error("sync refused by backend: {0}")]
    Backend(#[source] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&ClientConfig> for SyncSettings {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            retry_attempts: cfg.retry_attempts.max(1),
            retry_delay: cfg.retry_delay,
        }
    }
}

/// Published on every state change of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started { attempt: u32, size: usize },
    Succeeded { submitted: usize, duplicates: usize },
    RetryScheduled { attempt: u32, delay: Duration },
    Exhausted { attempts: u32, retry_after: Duration },
    /// A sync was requested while one was already running.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub submitted: usize,
    pub inserted: usize,
    pub replayed: usize,
    /// Identifiers the backend already held under another event.
    pub duplicates: Vec<RecordAck>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Queue was empty.
    Idle,
    AlreadyRunning,
    Synced(SyncReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub syncing: bool,
    pub connectivity: ConnectivityState,
    pub last_sync: Option<DateTime<Utc>>,
    pub fail_count: u32,
}

pub struct SyncEngine {
    backend: Arc<dyn BackendStore>,
    queue: Arc<PendingQueue>,
    state: SharedState,
    settings: SyncSettings,
    in_flight: AtomicBool,
    fail_count: AtomicU32,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    connectivity: Mutex<OfflineMode>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight)
            .field("fail_count", &self.fail_count)
            .finish_non_exhaustive()
    }
}

/// Releases the in-flight flag however the sync ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn BackendStore>,
        queue: Arc<PendingQueue>,
        state: SharedState,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        Self {
            backend,
            queue,
            state,
            settings,
            in_flight: AtomicBool::new(false),
            fail_count: AtomicU32::new(0),
            last_sync: Mutex::new(None),
            connectivity: Mutex::new(OfflineMode::default()),
            events,
            wake: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            syncing: self.is_syncing(),
            connectivity: lock(&self.connectivity).state(),
            last_sync: *lock(&self.last_sync),
            fail_count: self.fail_count.load(Ordering::Acquire),
        }
    }

    /// Backoff before the retry that follows failure number `failures`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.settings.retry_delay.saturating_mul(factor)
    }

    /// Ask the background worker for a sync (threshold trigger).
    pub fn request(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn requested(&self) {
        self.wake.notified().await;
    }

    /// Submit the pending queue.
    ///
    /// Holds the in-flight flag through every backoff sleep, so a trigger
    /// arriving mid-retry is a no-op rather than a second submission.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("sync already in flight; skipping");
            self.emit(SyncEvent::Skipped);
            return Ok(SyncOutcome::AlreadyRunning);
        };

        self.fail_count.store(0, Ordering::Release);
        loop {
            // Re-read every attempt: scans keep arriving during backoff.
            let batch = self.queue.drain_all().await;
            if batch.is_empty() {
                return Ok(SyncOutcome::Idle);
            }

            let attempt = self.fail_count.load(Ordering::Acquire) + 1;
            tracing::info!(attempt, size = batch.len(), "submitting pending batch");
            self.emit(SyncEvent::Started {
                attempt,
                size: batch.len(),
            });

            match self.backend.insert_count_events(&batch).await {
                Ok(acks) => {
                    let report = self.complete(&batch, acks).await;
                    return Ok(SyncOutcome::Synced(report));
                }
                Err(err) => {
                    let failures = self.fail_count.fetch_add(1, Ordering::AcqRel) + 1;
                    if !err.is_transient() {
                        tracing::error!(error = %err, "batch refused by backend; entries kept");
                        return Err(SyncError::Backend(err));
                    }
                    if lock(&self.connectivity).set_offline(Utc::now()) {
                        tracing::warn!("backend unreachable; counting continues offline");
                    }

                    let delay = self.delay_for(failures);
                    if failures >= self.settings.retry_attempts {
                        tracing::warn!(
                            attempts = failures,
                            retry_after_ms = delay.as_millis() as u64,
                            error = %err,
                            "sync retries exhausted; entries stay queued"
                        );
                        self.emit(SyncEvent::Exhausted {
                            attempts: failures,
                            retry_after: delay,
                        });
                        return Err(SyncError::Exhausted {
                            attempts: failures,
                            retry_after: delay,
                            source: err,
                        });
                    }

                    tracing::warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "sync failed; retrying"
                    );
                    self.emit(SyncEvent::RetryScheduled {
                        attempt: failures,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn complete(&self, batch: &[CountEvent], acks: InsertReport) -> SyncReport {
        let by_id: HashMap<CorrelationId, &CountEvent> =
            batch.iter().map(|e| (e.correlation_id, e)).collect();
        let mut report = SyncReport {
            submitted: batch.len(),
            duplicates: acks.duplicates().cloned().collect(),
            ..SyncReport::default()
        };

        // Confirm before dequeuing so the identifier never looks uncounted.
        {
            let mut state = state::write(&self.state);
            for ack in &acks.records {
                match &ack.outcome {
                    InsertOutcome::Inserted | InsertOutcome::Replayed => {
                        match ack.outcome {
                            InsertOutcome::Inserted => report.inserted += 1,
                            _ => report.replayed += 1,
                        }
                        if let Some(event) = by_id.get(&ack.correlation_id) {
                            state.confirm((*event).clone());
                        }
                    }
                    InsertOutcome::Duplicate { existing } => {
                        tracing::info!(
                            serial = %ack.serial,
                            existing_operator = %existing.operator,
                            "already counted on another device"
                        );
                        // The backend's event is the one that counts.
                        state.confirm(existing.clone());
                    }
                }
            }
        }

        let acknowledged: Vec<CorrelationId> = acks.acknowledged().copied().collect();
        if let Err(err) = self.queue.clear_confirmed(acknowledged).await {
            tracing::error!(error = %err, "acknowledged entries could not be removed from storage");
        }

        self.fail_count.store(0, Ordering::Release);
        let now = Utc::now();
        *lock(&self.last_sync) = Some(now);
        if lock(&self.connectivity).set_online(now) {
            tracing::info!("backend reachable again");
        }

        tracing::info!(
            submitted = report.submitted,
            inserted = report.inserted,
            replayed = report.replayed,
            duplicates = report.duplicates.len(),
            "sync complete"
        );
        self.emit(SyncEvent::Succeeded {
            submitted: report.submitted,
            duplicates: report.duplicates.len(),
        });
        report
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CountState;
    use stockcount_core::{FormatWhitelist, OperatorId, ScanGate, Serial, StockIndex, StockItem};
    use stockcount_infra::{InMemoryBackend, MemoryStore};

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        engine: Arc<SyncEngine>,
        state: SharedState,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = Arc::new(PendingQueue::new(Arc::new(MemoryStore::new())));
        let stock = StockIndex::from_items(
            ["sn1", "sn2", "sn3"].map(|s| StockItem::new(Serial::parse(s).unwrap(), s)),
        );
        let state = CountState::shared(
            stock,
            ScanGate::new(chrono::Duration::seconds(3), FormatWhitelist::strict()),
        );
        let engine = Arc::new(SyncEngine::new(
            backend.clone(),
            queue,
            state.clone(),
            SyncSettings {
                retry_attempts: 3,
                retry_delay: Duration::from_millis(1000),
            },
        ));
        Fixture {
            backend,
            engine,
            state,
        }
    }

    fn event(serial: &str) -> CountEvent {
        CountEvent::pending(
            Serial::parse(serial).unwrap(),
            serial,
            OperatorId::parse("E1").unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn backoff_doubles() {
        let f = fixture();
        assert_eq!(f.engine.delay_for(1), Duration::from_millis(1000));
        assert_eq!(f.engine.delay_for(2), Duration::from_millis(2000));
        assert_eq!(f.engine.delay_for(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let f = fixture();
        assert_eq!(f.engine.sync().await.unwrap(), SyncOutcome::Idle);
        assert_eq!(f.backend.insert_calls(), 0);
    }

    #[tokio::test]
    async fn success_confirms_then_clears_queue() {
        let f = fixture();
        f.engine.queue().enqueue(event("sn1")).await.unwrap();

        let outcome = f.engine.sync().await.unwrap();
        let SyncOutcome::Synced(report) = outcome else {
            panic!("expected a synced outcome");
        };
        assert_eq!(report.inserted, 1);
        assert!(f.engine.queue().is_empty().await);
        assert_eq!(state::read(&f.state).confirmed().len(), 1);
        assert!(f.engine.status().last_sync.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_then_exhaust() {
        let f = fixture();
        f.engine.queue().enqueue(event("sn1")).await.unwrap();
        f.backend.set_offline(true);
        let mut events = f.engine.subscribe();

        let started = tokio::time::Instant::now();
        let err = f.engine.sync().await.unwrap_err();

        assert_eq!(f.backend.insert_calls(), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3000) && waited < Duration::from_millis(3100));
        assert!(matches!(
            err,
            SyncError::Exhausted { attempts: 3, retry_after, .. } if retry_after == Duration::from_millis(4000)
        ));
        assert_eq!(f.engine.queue().len().await, 1);
        assert!(!f.engine.is_syncing());
        assert_eq!(f.engine.status().connectivity, ConnectivityState::Offline);

        let mut delays = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let SyncEvent::RetryScheduled { delay, .. } = ev {
                delays.push(delay);
            }
        }
        assert_eq!(delays, vec![Duration::from_millis(1000), Duration::from_millis(2000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_ceiling() {
        let f = fixture();
        f.engine.queue().enqueue(event("sn1")).await.unwrap();
        f.backend.fail_next_inserts(2);

        let outcome = f.engine.sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced(_)));
        assert_eq!(f.backend.insert_calls(), 3);
        assert_eq!(f.engine.status().fail_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sync_is_single_flight() {
        let f = fixture();
        f.engine.queue().enqueue(event("sn1")).await.unwrap();
        f.backend.set_insert_latency(Some(Duration::from_millis(500)));

        let first = tokio::spawn({
            let engine = f.engine.clone();
            async move { engine.sync().await }
        });
        tokio::task::yield_now().await;
        assert!(f.engine.is_syncing());
        assert_eq!(f.engine.sync().await.unwrap(), SyncOutcome::AlreadyRunning);

        assert!(matches!(first.await.unwrap().unwrap(), SyncOutcome::Synced(_)));
        assert_eq!(f.backend.insert_calls(), 1);
    }

    #[tokio::test]
    async fn duplicates_confirm_the_backend_event() {
        let f = fixture();
        // Another device counted sn2 first.
        let other = CountEvent::pending(
            Serial::parse("sn2").unwrap(),
            "sn2",
            OperatorId::parse("E9").unwrap(),
            Utc::now(),
        );
        f.backend.insert_count_events(&[other]).await.unwrap();

        f.engine.queue().enqueue(event("sn2")).await.unwrap();
        let SyncOutcome::Synced(report) = f.engine.sync().await.unwrap() else {
            panic!("expected a synced outcome");
        };

        assert_eq!(report.duplicates.len(), 1);
        assert!(f.engine.queue().is_empty().await);
        let state = state::read(&f.state);
        let held = state.confirmed().get(&Serial::parse("sn2").unwrap()).unwrap();
        assert_eq!(held.operator.as_str(), "E9");
    }

    #[tokio::test]
    async fn duplicate_stays_counted_when_history_is_unreachable() {
        let f = fixture();
        let other = CountEvent::pending(
            Serial::parse("sn3").unwrap(),
            "sn3",
            OperatorId::parse("E9").unwrap(),
            Utc::now(),
        );
        f.backend.insert_count_events(&[other]).await.unwrap();
        f.backend.fail_listings(true);

        f.engine.queue().enqueue(event("sn3")).await.unwrap();
        let SyncOutcome::Synced(report) = f.engine.sync().await.unwrap() else {
            panic!("expected a synced outcome");
        };

        assert_eq!(report.duplicates.len(), 1);
        assert!(f.engine.queue().is_empty().await);
        let state = state::read(&f.state);
        let sn3 = Serial::parse("sn3").unwrap();
        assert_eq!(state.confirmed().get(&sn3).unwrap().operator.as_str(), "E9");
        assert_eq!(state.view().counted_total(), 1);
        let pending: std::collections::HashSet<Serial> = std::collections::HashSet::new();
        assert_eq!(state.display_counts(&pending).counted, 1);
    }
}
