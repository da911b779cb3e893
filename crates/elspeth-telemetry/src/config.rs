// crates/elspeth-telemetry/src/config.rs
// ============================================================================
// Module: ELSPETH Telemetry Configuration
// Description: Dispatcher-wide settings: granularity filter, backpressure
//              mode, and exporter failure thresholds (§6.5).
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::error::TelemetryError;

/// How much detail the dispatcher forwards to exporters. Ordered from
/// least to most verbose: an exporter configured at `Detailed` also
/// receives every `Lifecycle` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Run-level milestones only: `RunStarted`, `RunFinished`,
    /// `PhaseChanged`, `TokenCompleted`.
    Lifecycle,
    /// Per-operation events: `TransformCompleted`, `GateEvaluated`.
    Detailed,
    /// Everything, including `ExternalCallCompleted`.
    Debug,
}

/// How the dispatcher's bounded per-exporter queue behaves once full
/// (§6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// The emitting caller blocks until space is available. The only
    /// mode required to be implemented.
    Block,
    /// The incoming event is dropped; the queue's contents are
    /// unchanged.
    DropNewest,
    /// The oldest queued event is evicted to make room for the
    /// incoming one.
    DropOldest,
    /// Reserved: rejected at configuration load time today (§9 open
    /// question — "whether `slow` backpressure mode must eventually be
    /// supported").
    Slow,
}

/// Dispatcher-wide configuration (§6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Whether the dispatcher forwards events at all. When `false`,
    /// `dispatch` is a no-op and no exporter worker is driven.
    pub enabled: bool,
    /// Minimum granularity a caller-supplied event must match to be
    /// forwarded.
    pub granularity: Granularity,
    /// Overflow policy applied to each exporter's bounded queue.
    pub backpressure_mode: BackpressureMode,
    /// Bounded queue capacity, per exporter.
    pub queue_capacity: usize,
    /// Number of consecutive export failures after which an exporter is
    /// disabled.
    pub max_consecutive_failures: u32,
    /// Whether the run transitions to `FAILED` once every exporter has
    /// been disabled.
    pub fail_on_total_exporter_failure: bool,
}

impl DispatcherConfig {
    /// Validates this configuration, rejecting unimplemented
    /// backpressure modes and non-positive queue capacities.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::UnimplementedBackpressureMode`] for
    /// `backpressure_mode: Slow`, or [`TelemetryError::InvalidQueueCapacity`]
    /// for `queue_capacity: 0`.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.backpressure_mode == BackpressureMode::Slow {
            return Err(TelemetryError::UnimplementedBackpressureMode(self.backpressure_mode));
        }
        if self.queue_capacity == 0 {
            return Err(TelemetryError::InvalidQueueCapacity);
        }
        Ok(())
    }
}
