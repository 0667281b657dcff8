//! Infrastructure layer: backend adapters, local storage, import/export.

pub mod backend;
pub mod export;
pub mod import;
pub mod local_store;

pub use backend::{
    BackendError, BackendStore, ChangeEvent, ChangeKind, ChangeRecord, InMemoryBackend, InsertOutcome,
    InsertReport, RecordAck, RestBackend, Table,
};
pub use export::ExportError;
pub use import::{ColumnMapping, ImportError, ImportProgress, StockSheet};
pub use local_store::{LocalStore, MemoryStore, SqliteStore, StorageError};
