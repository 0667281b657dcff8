//! `stockcount-core`: stock counting domain.
//!
//! This crate contains **pure domain** logic for counting serialized stock:
//! admission of scans, operator sessions, and the counted/remaining read
//! model. No IO, no clocks, no storage: every time-dependent operation takes
//! `now` explicitly.

pub mod count;
pub mod dashboard;
pub mod display;
pub mod error;
pub mod gate;
pub mod id;
pub mod reconcile;
pub mod session;
pub mod stock;

pub use count::{ConfirmationState, ConfirmedCounts, CountEvent};
pub use dashboard::{DashboardSummary, OperatorTally};
pub use display::TimestampStyle;
pub use error::{DomainError, DomainResult};
pub use gate::{Admission, BarcodeFormat, CountedLookup, FormatWhitelist, RejectReason, ScanGate, ScanSource};
pub use id::{CorrelationId, OperatorId, Serial};
pub use reconcile::{DisplayCounts, Reconciliation, ReconciliationView, mask_serial, reconcile};
pub use session::{OperatorSession, SessionState};
pub use stock::{StockIndex, StockItem};
