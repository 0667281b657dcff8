//! Tracing/logging setup shared by every binary.

/// Initialize process-wide logging with JSON output.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::Json);
}

/// Initialize process-wide logging in the given format.
pub fn init_with(format: tracing::LogFormat) {
    tracing::init_with(format);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;
