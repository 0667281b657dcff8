//! Client error type and its classification.

use thiserror::Error;

use stockcount_core::{DomainError, RejectReason};
use stockcount_infra::{BackendError, ExportError, ImportError, StorageError};

use crate::config::ConfigError;
use crate::pending_queue::QueueError;
use crate::sync_manager::SyncError;

/// How an error is surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected rejection; transient inline feedback.
    Validation,
    /// No operator id; resolved by prompting.
    SessionGap,
    /// Retried automatically; status indicator only.
    TransientBackend,
    /// Retry ceiling reached; persistent warning, data still queued.
    TerminalSync,
    /// Local storage unreadable or unwritable; recovered, logged.
    StorageCorruption,
    /// Reset/import/export failed; blocking message, action aborted.
    Administrative,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("confirmation code does not match")]
    WrongCode,

    #[error("backend refused administrative action: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rejected {code:?}: {reason}")]
    Rejected { code: String, reason: RejectReason },

    #[error("no operator id available")]
    NoOperator,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("backend request failed: {0}")]
    Backend(#[from] BackendError),

    #[error("local storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Rejected { .. } | ClientError::Domain(_) => ErrorKind::Validation,
            ClientError::NoOperator => ErrorKind::SessionGap,
            ClientError::Queue(_) | ClientError::Storage(_) => ErrorKind::StorageCorruption,
            // Both leave the batch queued for a later trigger.
            ClientError::Sync(SyncError::Exhausted { .. } | SyncError::Backend(_)) => {
                ErrorKind::TerminalSync
            }
            ClientError::Backend(err) if err.is_transient() => ErrorKind::TransientBackend,
            // 4xx and malformed payloads.
            ClientError::Backend(_) => ErrorKind::Administrative,
            ClientError::Admin(_) | ClientError::Config(_) => ErrorKind::Administrative,
        }
    }
}
