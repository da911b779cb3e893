// crates/elspeth-orchestrator/src/error.rs
// ============================================================================
// Module: ELSPETH Orchestrator Errors
// Description: Unifies every subsystem's error type behind the error the
//              run loop (C7) returns to its caller (§7).
// ============================================================================

use thiserror::Error;

use elspeth_coalesce::CoalesceError;
use elspeth_core::hashing::HashError;
use elspeth_core::identifiers::NodeId;
use elspeth_expr::ExpressionError;
use elspeth_graph::GraphError;
use elspeth_store_sqlite::StoreError;
use elspeth_telemetry::TelemetryError;
use elspeth_token::TokenError;

use crate::checkpoint::IncompatibleCheckpointError;
use crate::export::ExportError;
use crate::plugin::GateError;
use crate::plugin::SinkError;
use crate::plugin::SourceError;

/// The top-level error a run returns (§7). A run that fails with any
/// variant here has already had its terminal [`elspeth_core::model::RunStatus::Failed`]
/// recorded by the caller before the error propagates further; this type
/// carries the reason, not the recording obligation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The audit recorder failed.
    #[error("recorder error: {0}")]
    Store(#[from] StoreError),
    /// The execution graph could not be built or validated.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    /// A coalesce policy was violated.
    #[error("coalesce error: {0}")]
    Coalesce(#[from] CoalesceError),
    /// A gate condition failed to parse or evaluate.
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),
    /// The telemetry dispatcher could not be configured or dispatch a
    /// queued event.
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    /// A fork/expand/coalesce request violated the token lifecycle
    /// contract.
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    /// A checkpoint could not be used to resume a run.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] IncompatibleCheckpointError),
    /// An export could not be signed.
    #[error("export error: {0}")]
    Export(#[from] ExportError),
    /// A value could not be canonicalized or hashed.
    #[error("hashing error: {0}")]
    Hashing(#[from] HashError),
    /// The source plugin failed. Always aborts the run (§4.7.2).
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    /// A sink plugin failed and no error-routing policy recovered it.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    /// A gate plugin failed.
    #[error("gate error: {0}")]
    Gate(#[from] GateError),
    /// A gate's computed route label has no corresponding edge in the
    /// built graph. A configuration error, caught at build time for
    /// statically-determinable labels and at evaluation time otherwise.
    #[error("node '{node_id}' has no outgoing edge for route label '{label}'")]
    UnresolvedRoute {
        /// The gate node that produced the label.
        node_id: NodeId,
        /// The label the gate (or expression) produced.
        label: String,
    },
    /// A declared gate has neither a parsed condition nor a registered
    /// plugin implementation.
    #[error("gate node '{0}' has no condition and no registered plugin")]
    UnconfiguredGate(NodeId),
    /// A declared coalesce node has no registered merger for a
    /// `MergeStrategy::Custom` strategy.
    #[error("coalesce node '{0}' could not resolve its merge strategy")]
    UnconfiguredCoalesce(NodeId),
    /// A declared transform or aggregation node has no registered
    /// plugin implementation.
    #[error("node '{0}' has no registered transform plugin")]
    UnconfiguredTransform(NodeId),
    /// A named sink has no registered plugin implementation.
    #[error("sink '{0}' has no registered plugin")]
    UnconfiguredSink(String),
    /// A fork or gate route named a target that is neither a declared
    /// sink nor a declared coalesce branch.
    #[error("route target '{0}' does not name a known sink or coalesce branch")]
    UnknownRouteTarget(String),
    /// Every registered telemetry exporter has failed past its
    /// consecutive-failure threshold and the dispatcher is configured
    /// to fail the run in that case (§6.5).
    #[error("every telemetry exporter has failed; aborting per fail_on_total_exporter_failure")]
    TelemetryExportersExhausted,
}
