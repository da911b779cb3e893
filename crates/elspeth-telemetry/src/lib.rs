// crates/elspeth-telemetry/src/lib.rs
// ============================================================================
// Crate: elspeth-telemetry
// Description: Non-blocking fan-out of typed lifecycle events to
//              exporters, with configurable backpressure (C10).
// ============================================================================

//! ## Overview
//! The orchestrator emits one [`TelemetryEvent`] per lifecycle
//! milestone, but only after the corresponding audit write has
//! committed (§4.7). [`TelemetryDispatcher`] fans each event out to
//! every registered [`TelemetryExporter`], each running on its own
//! worker thread behind a bounded queue, so a slow or failing exporter
//! never stalls the row-processing loop. Concrete wire exporters
//! (console, OTLP, Datadog) are out of scope for this crate; it
//! specifies and drives the contract they implement.

mod config;
mod dispatcher;
mod error;
mod event;
mod exporter;
mod queue;

pub use config::BackpressureMode;
pub use config::DispatcherConfig;
pub use config::Granularity;
pub use dispatcher::TelemetryDispatcher;
pub use error::TelemetryError;
pub use event::TelemetryEvent;
pub use exporter::TelemetryExporter;
