//! `stockcount-client`
//!
//! **Responsibility:** offline-first counting client.
//!
//! - Scans are admitted by the gate and written to a durable pending queue
//!   before any network call
//! - The Sync Engine drains the queue to the shared backend (single-flight,
//!   exponential backoff, per-record acknowledgment)
//! - Remote changes are applied as they arrive; without a push channel the
//!   client runs refresh-only
//!
//! [`CountingApp`] is the explicit application context; a presentation layer
//! drives it and renders its results.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod offline;
pub mod operator;
pub mod pending_queue;
pub mod state;
pub mod sync_manager;
pub mod sync_worker;

pub use app::{AppStatus, CountingApp, RefreshReport, ScanOutcome, StartupReport};
pub use config::{ClientConfig, ConfigError, FormatProfile};
pub use error::{AdminError, ClientError, ErrorKind};
pub use offline::{ConnectivityState, OfflineMode};
pub use operator::OperatorPrompt;
pub use pending_queue::{PendingQueue, QueueError};
pub use sync_manager::{SyncEngine, SyncError, SyncEvent, SyncOutcome, SyncReport, SyncStatus};
pub use sync_worker::SyncWorker;
