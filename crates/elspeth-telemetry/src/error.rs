// crates/elspeth-telemetry/src/error.rs
// ============================================================================
// Module: ELSPETH Telemetry Errors
// Description: Dispatcher configuration and exporter failure modes.
// ============================================================================

use thiserror::Error;

use crate::config::BackpressureMode;

/// Errors raised while configuring the dispatcher or dispatching to an
/// exporter (§6.5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// An exporter rejected its configuration options.
    #[error("exporter '{exporter}' rejected its configuration: {reason}")]
    ExporterConfig {
        /// The exporter's registered name.
        exporter: String,
        /// The rejection reason reported by the exporter.
        reason: String,
    },
    /// `export()` failed for one event.
    #[error("exporter '{exporter}' failed to export an event: {reason}")]
    ExportFailed {
        /// The exporter's registered name.
        exporter: String,
        /// The failure reason reported by the exporter.
        reason: String,
    },
    /// `flush()` failed.
    #[error("exporter '{exporter}' failed to flush: {reason}")]
    FlushFailed {
        /// The exporter's registered name.
        exporter: String,
        /// The failure reason reported by the exporter.
        reason: String,
    },
    /// `close()` failed.
    #[error("exporter '{exporter}' failed to close: {reason}")]
    CloseFailed {
        /// The exporter's registered name.
        exporter: String,
        /// The failure reason reported by the exporter.
        reason: String,
    },
    /// A dispatcher configuration declared an unimplemented
    /// backpressure mode (§6.5: "only BLOCK is required; others may be
    /// declared unimplemented and the core must reject unimplemented
    /// modes at load time").
    #[error("backpressure mode {0:?} is not implemented")]
    UnimplementedBackpressureMode(BackpressureMode),
    /// A dispatcher configuration declared a zero-capacity queue.
    #[error("dispatcher queue capacity must be at least 1")]
    InvalidQueueCapacity,
    /// An exporter's worker thread is no longer running (it panicked,
    /// or the dispatcher was already closed) when a flush or close was
    /// requested.
    #[error("telemetry worker for exporter '{0}' is no longer running")]
    WorkerGone(String),
}
