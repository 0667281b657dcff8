//! The application context.
//!
//! `CountingApp` owns every piece of per-client state (stock index,
//! confirmed counts, pending queue, operator session, sync engine) and
//! exposes the operations a presentation layer drives. Several apps can run
//! side by side in one process against one backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use stockcount_core::{
    Admission, CountEvent, DashboardSummary, DisplayCounts, OperatorId, OperatorSession,
    Reconciliation, ScanGate, ScanSource, StockIndex, TimestampStyle, mask_serial,
};
use stockcount_infra::export::{
    count_records_csv, count_records_file_name, dashboard_report_csv, report_file_name,
    write_export,
};
use stockcount_infra::import::{IMPORT_CHUNK_SIZE, upload_stock};
use stockcount_infra::{
    BackendError, BackendStore, ChangeEvent, ColumnMapping, ImportProgress, LocalStore,
    StockSheet, Table,
};

use crate::cache::StockCache;
use crate::config::ClientConfig;
use crate::error::{AdminError, ClientError};
use crate::operator::{OperatorPrompt, ensure_operator};
use crate::pending_queue::{PendingQueue, QueueError};
use crate::state::{self, ChangeEffect, CountState, SharedState};
use crate::sync_manager::{SyncEngine, SyncEvent, SyncOutcome, SyncSettings, SyncStatus};

/// Result of an admitted or ignored scan. Rejections are errors.
#[derive(Debug)]
pub enum ScanOutcome {
    Recorded {
        event: CountEvent,
        /// Queue length after the enqueue.
        queued: usize,
        /// Set when the event is queued in memory but not yet durable.
        persist_error: Option<QueueError>,
    },
    /// Repeat camera read inside the cooldown window.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub restored_pending: usize,
    /// The persisted queue was unreadable and was reset.
    pub queue_reset: bool,
    pub cached_stock: usize,
    /// `None` when the backend could not be reached at startup.
    pub refreshed: Option<RefreshReport>,
    /// Whether remote changes are pushed; otherwise refresh-only.
    pub push: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub stock: usize,
    pub counted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub sync: SyncStatus,
    pub pending: usize,
    pub operator: Option<OperatorId>,
    pub session_fresh: bool,
    pub counts: DisplayCounts,
}

pub struct CountingApp {
    config: ClientConfig,
    style: TimestampStyle,
    backend: Arc<dyn BackendStore>,
    queue: Arc<PendingQueue>,
    cache: StockCache,
    state: SharedState,
    session: tokio::sync::Mutex<OperatorSession>,
    prompt: Arc<dyn OperatorPrompt>,
    engine: Arc<SyncEngine>,
    scan_lock: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CountingApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingApp")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl CountingApp {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn BackendStore>,
        store: Arc<dyn LocalStore>,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Result<Self, ClientError> {
        let style = config.timestamp_style()?;
        let queue = Arc::new(PendingQueue::new(store.clone()));
        let gate = ScanGate::new(config.cooldown(), config.format_profile.whitelist());
        let state = CountState::shared(StockIndex::new(config.max_name_len), gate);
        let engine = Arc::new(SyncEngine::new(
            backend.clone(),
            queue.clone(),
            state.clone(),
            SyncSettings::from(&config),
        ));

        Ok(Self {
            session: tokio::sync::Mutex::new(OperatorSession::new(config.session_timeout())),
            style,
            backend,
            queue,
            cache: StockCache::new(store),
            state,
            prompt,
            engine,
            scan_lock: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    pub fn timestamp_style(&self) -> &TimestampStyle {
        &self.style
    }

    /// Restore local state, refresh from the backend, and start listening
    /// for remote changes.
    ///
    /// Only an unreadable local store fails startup; a corrupt queue or
    /// cache is reset and an unreachable backend leaves the cached index in
    /// place.
    pub async fn start(&self) -> Result<StartupReport, ClientError> {
        let mut report = StartupReport::default();

        match self.queue.load().await {
            Ok(n) => report.restored_pending = n,
            Err(QueueError::Corrupt(reason)) => {
                tracing::error!(reason = %reason, "pending queue reset at startup");
                report.queue_reset = true;
            }
            Err(err) => return Err(err.into()),
        }

        match self.cache.load().await {
            Ok(Some(cached)) => {
                report.cached_stock = cached.items.len();
                state::write(&self.state).replace_stock(cached.items);
                tracing::info!(count = report.cached_stock, "stock index loaded from cache");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "stock cache could not be read"),
        }

        match self.refresh().await {
            Ok(refreshed) => report.refreshed = Some(refreshed),
            Err(err) => tracing::warn!(error = %err, "initial refresh failed; working from cache"),
        }

        report.push = self.listen();
        Ok(report)
    }

    fn listen(&self) -> bool {
        let Some(rx) = self.backend.subscribe() else {
            tracing::info!("backend has no push channel; refresh-only mode");
            return false;
        };
        let handle = tokio::spawn(apply_changes(rx, self.backend.clone(), self.state.clone()));
        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
        true
    }

    /// Camera path: cooldown, format, stock, counted.
    pub async fn scan(
        &self,
        raw: &str,
        format: &str,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome, ClientError> {
        self.admit(raw, ScanSource::Camera { format }, now).await
    }

    /// Typed path: stock, counted.
    pub async fn manual_entry(&self, raw: &str, now: DateTime<Utc>) -> Result<ScanOutcome, ClientError> {
        self.admit(raw, ScanSource::Manual, now).await
    }

    async fn admit(
        &self,
        raw: &str,
        source: ScanSource<'_>,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome, ClientError> {
        // One admission at a time, so two reads of one code cannot both pass
        // the counted check before either is queued.
        let _scan = self.scan_lock.lock().await;

        let pending = self.queue.serials().await;
        let admission = state::write(&self.state).admit(raw, source, now, &pending);

        let (serial, name) = match admission {
            Admission::Ignored => return Ok(ScanOutcome::Ignored),
            Admission::Rejected { code, reason } => {
                tracing::debug!(code = %code, reason = %reason, "scan rejected");
                return Err(ClientError::Rejected { code, reason });
            }
            Admission::Accepted { serial, name } => (serial, name),
        };

        let operator = {
            let mut session = self.session.lock().await;
            ensure_operator(&mut session, self.prompt.as_ref(), now).await?
        };

        let event = CountEvent::pending(serial, name, operator, now);
        let (queued, persist_error) = match self.queue.enqueue(event.clone()).await {
            Ok(len) => (len, None),
            Err(err) => {
                tracing::error!(error = %err, serial = %event.serial, "count queued but not durable");
                (self.queue.len().await, Some(err))
            }
        };
        tracing::info!(serial = %event.serial, operator = %event.operator, queued, "count recorded");

        if queued >= self.config.batch_size {
            self.engine.request();
        }

        Ok(ScanOutcome::Recorded {
            event,
            queued,
            persist_error,
        })
    }

    /// Manual sync trigger.
    pub async fn sync_now(&self) -> Result<SyncOutcome, ClientError> {
        Ok(self.engine.sync().await?)
    }

    pub fn sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Reload both tables from the backend and re-cache the stock index.
    pub async fn refresh(&self) -> Result<RefreshReport, ClientError> {
        let fetched_at = state::read(&self.state).generation();
        let items = self.backend.list_stock_items().await?;
        let events = self.backend.list_count_events(None).await?;

        let (report, snapshot) = {
            let mut state = state::write(&self.state);
            state.replace_stock(items);
            state.replace_counts(events, fetched_at);
            (
                RefreshReport {
                    stock: state.stock().len(),
                    counted: state.confirmed().len(),
                },
                state.stock().to_items(),
            )
        };

        if let Err(err) = self.cache.save(snapshot, Utc::now()).await {
            tracing::warn!(error = %err, "stock cache not updated");
        }
        tracing::info!(stock = report.stock, counted = report.counted, "refreshed from backend");
        Ok(report)
    }

    /// Counts including pending events.
    pub async fn display_counts(&self) -> DisplayCounts {
        let pending = self.queue.serials().await;
        state::read(&self.state).display_counts(&pending)
    }

    /// Confirmed-only reconciliation.
    pub fn reconciliation(&self) -> Reconciliation {
        state::read(&self.state).reconciliation()
    }

    /// Up to `limit` uncounted items with masked identifiers.
    pub fn remaining_preview(&self, limit: usize) -> Vec<(String, String)> {
        state::read(&self.state)
            .view()
            .remaining()
            .take(limit)
            .map(|item| (mask_serial(item.serial.as_str()), item.name.clone()))
            .collect()
    }

    /// Confirmed events, newest first.
    pub fn history(&self) -> Vec<CountEvent> {
        state::read(&self.state)
            .confirmed()
            .newest_first()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn pending(&self) -> Vec<CountEvent> {
        self.queue.drain_all().await
    }

    pub fn dashboard(&self, now: DateTime<Utc>) -> DashboardSummary {
        let state = state::read(&self.state);
        DashboardSummary::compute(state.stock().len(), state.confirmed().iter(), &self.style, now)
    }

    /// Write the count-record export into `dir`. Returns the file path.
    pub fn export_counts(&self, dir: &Path, now: DateTime<Utc>) -> Result<PathBuf, ClientError> {
        let csv = count_records_csv(&self.history(), &self.style).map_err(AdminError::from)?;
        let path = dir.join(count_records_file_name(now));
        write_export(&path, &csv).map_err(AdminError::from)?;
        tracing::info!(path = %path.display(), "count records exported");
        Ok(path)
    }

    /// Write the dashboard report into `dir`. Returns the file path.
    pub fn export_report(&self, dir: &Path, now: DateTime<Utc>) -> Result<PathBuf, ClientError> {
        let total = state::read(&self.state).stock().len();
        let csv = dashboard_report_csv(total, &self.history(), &self.style, now)
            .map_err(AdminError::from)?;
        let path = dir.join(report_file_name(now));
        write_export(&path, &csv).map_err(AdminError::from)?;
        tracing::info!(path = %path.display(), "dashboard report exported");
        Ok(path)
    }

    /// Import a stock sheet, upsert it in chunks, then refresh.
    ///
    /// `mapping` overrides header auto-detection.
    pub async fn import_stock(
        &self,
        path: &Path,
        mapping: Option<ColumnMapping>,
        on_progress: impl FnMut(ImportProgress) + Send,
    ) -> Result<usize, ClientError> {
        let sheet = StockSheet::from_path(path).map_err(AdminError::from)?;
        let mapping = match mapping {
            Some(mapping) => mapping,
            None => sheet.detect_columns().map_err(AdminError::from)?,
        };
        let items = sheet.items(mapping).map_err(AdminError::from)?;

        let written = upload_stock(self.backend.as_ref(), &items, IMPORT_CHUNK_SIZE, on_progress)
            .await
            .map_err(AdminError::from)?;

        if let Err(err) = self.refresh().await {
            tracing::warn!(error = %err, "refresh after import failed");
        }
        Ok(written)
    }

    /// Delete every count record everywhere, then clear local counts and
    /// the pending queue.
    pub async fn reset_history(&self, code: &str) -> Result<usize, ClientError> {
        self.check_code(code)?;
        let removed = self
            .backend
            .delete_all(Table::CountRecords)
            .await
            .map_err(AdminError::from)?;

        state::write(&self.state).clear_counts();
        let dropped = self.queue.clear_all().await?;
        tracing::warn!(removed, dropped_pending = dropped, "count history reset");
        Ok(removed)
    }

    /// Delete the whole stock table and the local cache.
    pub async fn clear_stock(&self, code: &str) -> Result<usize, ClientError> {
        self.check_code(code)?;
        let removed = self
            .backend
            .delete_all(Table::Stock)
            .await
            .map_err(AdminError::from)?;

        state::write(&self.state).replace_stock(Vec::new());
        if let Err(err) = self.cache.clear().await {
            tracing::warn!(error = %err, "stock cache not cleared");
        }
        tracing::warn!(removed, "stock cleared");
        Ok(removed)
    }

    fn check_code(&self, code: &str) -> Result<(), AdminError> {
        if code.trim() != self.config.reset_code {
            tracing::warn!("administrative action refused: wrong confirmation code");
            return Err(AdminError::WrongCode);
        }
        Ok(())
    }

    /// Number of unsynced events, if any. Shown before the client exits.
    pub async fn unsynced_warning(&self) -> Option<usize> {
        match self.queue.len().await {
            0 => None,
            n => Some(n),
        }
    }

    pub async fn status(&self, now: DateTime<Utc>) -> AppStatus {
        let (operator, session_fresh) = {
            let session = self.session.lock().await;
            (session.last_known().cloned(), !session.needs_prompt(now))
        };
        AppStatus {
            sync: self.engine.status(),
            pending: self.queue.len().await,
            operator,
            session_fresh,
            counts: self.display_counts().await,
        }
    }

    /// Stop listening for remote changes.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}

impl Drop for CountingApp {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn apply_changes(
    mut rx: broadcast::Receiver<ChangeEvent>,
    backend: Arc<dyn BackendStore>,
    state: SharedState,
) {
    loop {
        match rx.recv().await {
            Ok(change) => {
                let effect = state::write(&state).apply_change(change);
                if let ChangeEffect::NeedsReload(table) = effect {
                    if let Err(err) = reload(backend.as_ref(), &state, table).await {
                        tracing::warn!(table = table.as_str(), error = %err, "reload after change failed");
                    }
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "change notifications lagged; reloading");
                for table in [Table::Stock, Table::CountRecords] {
                    if let Err(err) = reload(backend.as_ref(), &state, table).await {
                        tracing::warn!(table = table.as_str(), error = %err, "reload after lag failed");
                    }
                }
            }
            Err(RecvError::Closed) => {
                tracing::info!("change notifications closed");
                break;
            }
        }
    }
}

async fn reload(
    backend: &dyn BackendStore,
    state: &SharedState,
    table: Table,
) -> Result<(), BackendError> {
    match table {
        Table::Stock => {
            let items = backend.list_stock_items().await?;
            state::write(state).replace_stock(items);
        }
        Table::CountRecords => {
            let fetched_at = state::read(state).generation();
            let events = backend.list_count_events(None).await?;
            state::write(state).replace_counts(events, fetched_at);
        }
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::tests::ScriptedPrompt;
    use stockcount_core::{RejectReason, Serial, StockItem};
    use stockcount_infra::{InMemoryBackend, MemoryStore};

    fn stock() -> Vec<StockItem> {
        ["SN001", "SN002", "SN003"]
            .map(|s| StockItem::new(Serial::parse(s).unwrap(), format!("Item {s}")))
            .into()
    }

    async fn app(backend: Arc<InMemoryBackend>, answers: &[&str]) -> CountingApp {
        let app = CountingApp::new(
            ClientConfig::default(),
            backend,
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedPrompt::new(answers.iter().copied())),
        )
        .unwrap();
        app.start().await.unwrap();
        app
    }

    #[tokio::test]
    async fn accepted_scan_is_queued_with_operator() {
        let backend = Arc::new(InMemoryBackend::new().with_stock(stock()));
        let app = app(backend, &["E1"]).await;

        let outcome = app.scan("SN001", "CODE_128", Utc::now()).await.unwrap();
        let ScanOutcome::Recorded { event, queued, persist_error } = outcome else {
            panic!("expected a recorded scan");
        };
        assert_eq!(event.operator.as_str(), "E1");
        assert_eq!(event.name, "Item SN001");
        assert_eq!(queued, 1);
        assert!(persist_error.is_none());
        assert_eq!(app.display_counts().await.counted, 1);
    }

    #[tokio::test]
    async fn pending_identifier_is_already_counted() {
        let backend = Arc::new(InMemoryBackend::new().with_stock(stock()));
        let app = app(backend, &["E1"]).await;
        let now = Utc::now();

        app.manual_entry("sn002", now).await.unwrap();
        let err = app.manual_entry(" SN002 ", now).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected {
                reason: RejectReason::AlreadyCounted,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_overlapping_a_sync_keeps_the_count() {
        let backend = Arc::new(InMemoryBackend::without_push().with_stock(stock()));
        let app = Arc::new(app(backend.clone(), &["E1"]).await);
        app.manual_entry("SN001", Utc::now()).await.unwrap();

        // The listing is read now but only delivered 500ms later.
        backend.set_listing_latency(Some(std::time::Duration::from_millis(500)));
        let refresh = tokio::spawn({
            let app = app.clone();
            async move { app.refresh().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        app.sync_now().await.unwrap();
        assert_eq!(app.display_counts().await.counted, 1);

        refresh.await.unwrap().unwrap();
        let counts = app.display_counts().await;
        assert_eq!(counts.counted, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(app.reconciliation().counted_total, 1);

        let err = app.manual_entry("SN001", Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected {
                reason: RejectReason::AlreadyCounted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn wrong_code_aborts_reset() {
        let backend = Arc::new(InMemoryBackend::new().with_stock(stock()));
        let app = app(backend.clone(), &["E1"]).await;
        app.manual_entry("SN001", Utc::now()).await.unwrap();
        app.sync_now().await.unwrap();

        let err = app.reset_history("nope").await.unwrap_err();
        assert!(matches!(err, ClientError::Admin(AdminError::WrongCode)));
        assert_eq!(backend.count_count_events().await.unwrap(), 1);

        app.reset_history("P12345678").await.unwrap();
        assert_eq!(backend.count_count_events().await.unwrap(), 0);
        assert!(app.history().is_empty());
    }

    #[tokio::test]
    async fn startup_uses_cache_when_backend_is_down() {
        let store = Arc::new(MemoryStore::new());
        StockCache::new(store.clone())
            .save(stock(), Utc::now())
            .await
            .unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_offline(true);

        let app = CountingApp::new(
            ClientConfig::default(),
            backend,
            store,
            Arc::new(ScriptedPrompt::new(["E1"])),
        )
        .unwrap();
        let report = app.start().await.unwrap();

        assert_eq!(report.cached_stock, 3);
        assert!(report.refreshed.is_none());
        assert!(app.manual_entry("SN003", Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn export_writes_dated_file() {
        let backend = Arc::new(InMemoryBackend::new().with_stock(stock()));
        let app = app(backend, &["E1"]).await;
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        assert!(matches!(
            app.export_counts(dir.path(), now),
            Err(ClientError::Admin(AdminError::Export(_)))
        ));

        app.manual_entry("SN001", now).await.unwrap();
        app.sync_now().await.unwrap();
        let path = app.export_counts(dir.path(), now).unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("\"sn001\""));
    }
}
