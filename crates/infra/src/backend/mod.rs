//! Shared backend store boundary.
//!
//! One abstract contract for the remote source of truth, with one adapter
//! per concrete backend. The client core only ever sees [`BackendStore`].

pub mod in_memory;
pub mod rest;
pub mod r#trait;

pub use in_memory::InMemoryBackend;
pub use rest::RestBackend;
pub use r#trait::{
    BackendError, BackendStore, ChangeEvent, ChangeKind, ChangeRecord, InsertOutcome, InsertReport,
    RecordAck, Table,
};
