//! Background worker for timer- and threshold-triggered sync.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::sync_manager::SyncEngine;

/// Runs the recurring timer and the batch-threshold trigger.
///
/// Both funnel into [`SyncEngine::sync`], so they never overlap with each
/// other or with a manual sync.
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker. The first timer tick fires one `interval` from now.
    pub fn spawn(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run(engine.clone(), interval, shutdown.clone()));
        Self {
            engine,
            shutdown,
            handle,
        }
    }

    /// Stop the worker and fire one best-effort sync without waiting for it.
    ///
    /// Mirrors the unload path: whatever is still queued stays persisted if
    /// the attempt does not finish.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.sync().await {
                tracing::warn!(error = %err, "shutdown flush did not complete");
            }
        });
    }

    /// Wait for the worker loop to end.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "sync worker task failed");
        }
    }
}

async fn run(engine: Arc<SyncEngine>, period: Duration, shutdown: Arc<Notify>) {
    tracing::info!(interval_secs = period.as_secs(), "background sync worker started");

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("background sync worker received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                if engine.is_syncing() || engine.queue().is_empty().await {
                    continue;
                }
                tracing::debug!("timer sync");
                run_sync(&engine).await;
            }
            _ = engine.requested() => {
                tracing::debug!("threshold sync");
                run_sync(&engine).await;
            }
        }
    }

    tracing::info!("background sync worker stopped");
}

async fn run_sync(engine: &SyncEngine) {
    // Failures are already logged and published by the engine.
    let _ = engine.sync().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending_queue::PendingQueue;
    use crate::state::CountState;
    use crate::sync_manager::SyncSettings;
    use chrono::Utc;
    use stockcount_core::{
        CountEvent, FormatWhitelist, OperatorId, ScanGate, Serial, StockIndex,
    };
    use stockcount_infra::{InMemoryBackend, MemoryStore};

    fn engine(backend: Arc<InMemoryBackend>) -> Arc<SyncEngine> {
        let queue = Arc::new(PendingQueue::new(Arc::new(MemoryStore::new())));
        let state = CountState::shared(
            StockIndex::default(),
            ScanGate::new(chrono::Duration::seconds(3), FormatWhitelist::strict()),
        );
        Arc::new(SyncEngine::new(
            backend,
            queue,
            state,
            SyncSettings {
                retry_attempts: 3,
                retry_delay: Duration::from_millis(1000),
            },
        ))
    }

    fn event(serial: &str) -> CountEvent {
        CountEvent::pending(
            Serial::parse(serial).unwrap(),
            serial,
            OperatorId::parse("E1").unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn timer_syncs_only_a_non_empty_queue() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend.clone());
        let worker = SyncWorker::spawn(engine.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(backend.insert_calls(), 0);

        engine.queue().enqueue(event("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.insert_calls(), 1);
        assert!(engine.queue().is_empty().await);

        worker.shutdown();
        worker.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn request_wakes_the_worker_immediately() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend.clone());
        let worker = SyncWorker::spawn(engine.clone(), Duration::from_secs(60));

        engine.queue().enqueue(event("a")).await.unwrap();
        engine.request();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(backend.insert_calls(), 1);
        worker.shutdown();
        worker.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_the_queue() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine(backend.clone());
        let worker = SyncWorker::spawn(engine.clone(), Duration::from_secs(60));

        engine.queue().enqueue(event("a")).await.unwrap();
        worker.shutdown();
        worker.join().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(engine.queue().is_empty().await);
    }
}
