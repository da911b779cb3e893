// crates/elspeth-telemetry/src/exporter.rs
// ============================================================================
// Module: ELSPETH Telemetry Exporter Contract
// Description: The trait a concrete exporter (console, OTLP, Datadog, ...)
//              must implement (§6.5). Concrete wire adapters are out of
//              scope for this crate.
// ============================================================================

use crate::error::TelemetryError;
use crate::event::TelemetryEvent;

/// A destination for telemetry events.
///
/// # Invariants
/// - `export` must not block indefinitely; the dispatcher calls it from
///   a dedicated worker thread, one exporter per thread, so a slow
///   exporter only delays its own queue, not its siblings'.
/// - Implementations are driven from exactly one thread at a time and
///   never need inner synchronization for their own state.
pub trait TelemetryExporter: Send {
    /// Applies exporter-specific configuration, given as already-parsed
    /// JSON options. Called once, before the first `export`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ExporterConfig`] if `opts` is invalid
    /// for this exporter.
    fn configure(&mut self, opts: &serde_json::Value) -> Result<(), TelemetryError>;

    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ExportFailed`] on delivery failure.
    /// Export failures never crash the pipeline (§6.5): the dispatcher
    /// logs and counts them, disabling the exporter after
    /// `max_consecutive_failures`.
    fn export(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError>;

    /// Forces any buffered events to be delivered.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::FlushFailed`] on failure.
    fn flush(&mut self) -> Result<(), TelemetryError>;

    /// Releases any resources held by this exporter. Called exactly
    /// once, after the last `export`/`flush`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::CloseFailed`] on failure.
    fn close(&mut self) -> Result<(), TelemetryError>;
}
