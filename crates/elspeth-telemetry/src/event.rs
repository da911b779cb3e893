// crates/elspeth-telemetry/src/event.rs
// ============================================================================
// Module: ELSPETH Telemetry Events
// Description: Frozen, typed lifecycle events emitted after a successful
//              recorder write (§6.5, §4.7).
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use elspeth_core::identifiers::CallId;
use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RunId;
use elspeth_core::identifiers::TokenId;
use elspeth_core::model::CallStatus;
use elspeth_core::model::Outcome;
use elspeth_core::model::RunStatus;

use crate::config::Granularity;

/// A frozen lifecycle event (§6.5: "A typed event is a frozen record
/// with timestamp (tz-aware), run_id, and event-specific fields"). The
/// orchestrator constructs one of these only after the corresponding
/// audit write has committed (§4.7: "after a recorder write succeeds,
/// the orchestrator emits a typed event... if recorder write fails, no
/// event is emitted").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A run has begun.
    RunStarted {
        /// The run.
        run_id: RunId,
        /// The hashing scheme version recorded on the run.
        canonical_version: String,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A node has entered a new execution phase (for example, a batch
    /// node opening or flushing).
    PhaseChanged {
        /// The run.
        run_id: RunId,
        /// The node transitioning phase.
        node_id: NodeId,
        /// Free-form phase label (node-type specific).
        phase: String,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A transform node state reached a terminal status.
    TransformCompleted {
        /// The run.
        run_id: RunId,
        /// The token whose state completed.
        token_id: TokenId,
        /// The transform node.
        node_id: NodeId,
        /// Wall-clock duration of the node state, in milliseconds.
        duration_ms: u64,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A gate node evaluated its condition for one token.
    GateEvaluated {
        /// The run.
        run_id: RunId,
        /// The token the gate evaluated.
        token_id: TokenId,
        /// The gate node.
        node_id: NodeId,
        /// The evaluator's result (typically a boolean or route label).
        result: Value,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A token reached a terminal outcome.
    TokenCompleted {
        /// The run.
        run_id: RunId,
        /// The token.
        token_id: TokenId,
        /// The terminal outcome recorded for the token.
        outcome: Outcome,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// An external-call operation completed (success or failure).
    ExternalCallCompleted {
        /// The run.
        run_id: RunId,
        /// The call.
        call_id: CallId,
        /// The node the call was made from.
        node_id: NodeId,
        /// The call's final status.
        status: CallStatus,
        /// Wall-clock duration of the call, in milliseconds.
        duration_ms: u64,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// The run reached a terminal status.
    RunFinished {
        /// The run.
        run_id: RunId,
        /// The run's terminal status.
        status: RunStatus,
        /// Timestamp.
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

impl TelemetryEvent {
    /// The run this event belongs to.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseChanged { run_id, .. }
            | Self::TransformCompleted { run_id, .. }
            | Self::GateEvaluated { run_id, .. }
            | Self::TokenCompleted { run_id, .. }
            | Self::ExternalCallCompleted { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// When this event was recorded.
    #[must_use]
    pub fn recorded_at(&self) -> OffsetDateTime {
        match self {
            Self::RunStarted { at, .. }
            | Self::PhaseChanged { at, .. }
            | Self::TransformCompleted { at, .. }
            | Self::GateEvaluated { at, .. }
            | Self::TokenCompleted { at, .. }
            | Self::ExternalCallCompleted { at, .. }
            | Self::RunFinished { at, .. } => *at,
        }
    }

    /// The minimum dispatcher [`Granularity`] required to forward this
    /// event.
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        match self {
            Self::RunStarted { .. }
            | Self::PhaseChanged { .. }
            | Self::TokenCompleted { .. }
            | Self::RunFinished { .. } => Granularity::Lifecycle,
            Self::TransformCompleted { .. } | Self::GateEvaluated { .. } => Granularity::Detailed,
            Self::ExternalCallCompleted { .. } => Granularity::Debug,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use crate::config::Granularity;

    #[test]
    fn granularity_ranks_lifecycle_below_detailed_below_debug() {
        assert!(Granularity::Lifecycle < Granularity::Detailed);
        assert!(Granularity::Detailed < Granularity::Debug);
    }

    #[test]
    fn run_started_is_lifecycle_granularity() {
        let event = TelemetryEvent::RunStarted {
            run_id: RunId::new("run-1"),
            canonical_version: "sha256-rfc8785-v1".to_string(),
            at: OffsetDateTime::UNIX_EPOCH,
        };
        assert_eq!(event.granularity(), Granularity::Lifecycle);
        assert_eq!(event.run_id().as_str(), "run-1");
    }

    #[test]
    fn external_call_completed_is_debug_granularity() {
        let event = TelemetryEvent::ExternalCallCompleted {
            run_id: RunId::new("run-1"),
            call_id: CallId::new("call-1"),
            node_id: NodeId::new("node-1"),
            status: CallStatus::Success,
            duration_ms: 12,
            at: OffsetDateTime::UNIX_EPOCH,
        };
        assert_eq!(event.granularity(), Granularity::Debug);
    }
}
