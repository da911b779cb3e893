// crates/elspeth-orchestrator/src/plugin.rs
// ============================================================================
// Module: ELSPETH Plugin Contracts
// Description: Backend-agnostic source/transform/gate/sink contracts the
//              orchestrator drives (§6.1). Concrete bindings (Azure Blob,
//              CSV, LLM clients, ...) are external collaborators.
// ============================================================================

//! ## Overview
//! These traits are the seams between the orchestrator's row loop and
//! plugin code. Implementations must be deterministic given their
//! declared [`elspeth_core::model::Determinism`] and fail closed:
//! external data that cannot be coerced is quarantined, never silently
//! dropped or guessed at.

use serde_json::Value;
use thiserror::Error;

use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RunId;
use elspeth_core::model::Determinism;
use elspeth_core::model::SchemaContract;

// ============================================================================
// SECTION: Source
// ============================================================================

/// One row yielded by a [`Source`]: either usable as-is, or quarantined
/// at the boundary with the reason and destination it must be routed to
/// (§4.7.1 step 2-3).
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A row that passed the source's own validation.
    Valid(Value),
    /// A row that failed validation at the trust boundary (Tier 3,
    /// §5: "External data... coerced/quarantined at boundary; never
    /// crashes the run").
    Quarantined {
        /// The raw row, preserved for the validation-error record.
        row: Value,
        /// Human-readable reason the row was quarantined.
        error: String,
        /// Where the quarantined row is routed.
        destination: QuarantineDestination,
    },
}

/// Where a quarantined row goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineDestination {
    /// Route the row to a named sink.
    Sink(String),
    /// Drop the row; only the validation-error record survives.
    Discard,
}

/// Errors a [`Source`] raises. These are hard failures, distinct from a
/// quarantined row: `next_row` returning `Err` aborts the run
/// (§4.7.2: "Source errors abort the run with RunStatus.FAILED").
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source failed to start (e.g., connection setup).
    #[error("source failed to start: {0}")]
    StartFailed(String),
    /// The source failed while producing a row.
    #[error("source failed to read a row: {0}")]
    ReadFailed(String),
    /// The source failed to run its completion hook.
    #[error("source failed to complete: {0}")]
    CompleteFailed(String),
    /// The source failed to close cleanly.
    #[error("source failed to close: {0}")]
    CloseFailed(String),
}

/// A row-oriented data source (§6.1).
///
/// # Invariants
/// - `next_row` returns rows in a stable order; `row_index` assignment
///   by the orchestrator depends on that order being preserved
///   (§5: "Row ingestion order is preserved on the source side").
pub trait Source: Send {
    /// The source's declared determinism class.
    fn determinism(&self) -> Determinism;

    /// A free-form version string identifying the plugin build.
    fn plugin_version(&self) -> &str;

    /// The schema this source declares its valid rows conform to.
    fn output_schema(&self) -> &SchemaContract;

    /// Lifecycle hook run once before the first `next_row` call.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::StartFailed`] if setup fails.
    fn on_start(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Returns the next row, or `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ReadFailed`] on a hard read failure. A row
    /// that merely fails validation is `Ok(Some(SourceRow::Quarantined { .. }))`,
    /// not an `Err`.
    fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError>;

    /// Lifecycle hook run once after the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::CompleteFailed`] if teardown fails.
    fn on_complete(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Releases any resources held by the source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::CloseFailed`] if closing fails.
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Transform
// ============================================================================

/// Context passed to a [`Transform`]/[`GatePlugin`]/[`Sink`] invocation.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// The run being executed.
    pub run_id: RunId,
    /// The node this invocation is on behalf of.
    pub node_id: NodeId,
}

/// Outcome of a [`Transform::process`] call (§6.1: "`TransformResult{status:
/// success|error, row|rows, reason?, retryable?}`"). Modeled as a data
/// value rather than a `Result` because a transform failure is routed
/// into the audit trail as a FAILED outcome, not propagated as a Rust
/// error (§4.7.2).
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    /// The transform produced zero or more output rows (zero only for
    /// deaggregators that defer output to a later flush).
    Success(Vec<Value>),
    /// The transform failed for this input.
    Failure {
        /// Human-readable failure reason, hashed into the state's
        /// structured error.
        reason: String,
        /// Whether the engine may retry this invocation per the
        /// configured row-level retry policy.
        retryable: bool,
    },
}

/// A row-oriented (or batch-oriented) processing step (§6.1).
pub trait Transform: Send + Sync {
    /// Whether this transform buffers rows and processes them as a
    /// batch rather than one at a time.
    fn is_batch_aware(&self) -> bool {
        false
    }

    /// Whether this transform may produce a different number of output
    /// tokens than input tokens (true for 1→N deaggregators that expand
    /// via `expand_token`).
    fn creates_tokens(&self) -> bool {
        false
    }

    /// Processes `rows` (a single-element slice for non-batch-aware
    /// transforms).
    fn process(&self, rows: &[Value], ctx: &PluginContext) -> TransformOutcome;
}

// ============================================================================
// SECTION: Gate (plugin)
// ============================================================================

/// How a routed token is handed to its destination (§6.1: "`{label →
/// (move|copy, destinations)}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// The token moves to the destination; it is not duplicated.
    Move,
    /// The token is duplicated onto the destination, continuing
    /// elsewhere too.
    Copy,
}

/// A plugin gate's routing decision for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// The resolved route label.
    pub label: String,
    /// Whether the token moves or is copied.
    pub action: RouteAction,
    /// Destination node or sink names.
    pub destinations: Vec<String>,
}

/// Errors a plugin gate raises while evaluating a routing decision.
/// Distinct from [`elspeth_expr::ExpressionError`], which only applies
/// to config-gates (expression-evaluator gates, §6.1: "Config-gates use
/// the expression evaluator directly without plugin code").
#[derive(Debug, Error)]
pub enum GateError {
    /// The plugin failed to evaluate a routing decision.
    #[error("gate plugin evaluation failed: {0}")]
    EvaluationFailed(String),
}

/// A plugin-defined gate (§6.1). Config-gates instead evaluate an
/// [`elspeth_expr::GateCondition`] directly and never implement this
/// trait.
pub trait GatePlugin: Send + Sync {
    /// Evaluates a routing decision for `row`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError`] if the decision cannot be computed.
    fn evaluate(&self, row: &Value, ctx: &PluginContext) -> Result<RouteDecision, GateError>;
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// Describes the artifact a sink produced for one batch write (§6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Path or URI identifying where the artifact was written.
    pub path_or_uri: String,
    /// Content hash of the written artifact.
    pub content_hash: String,
    /// Size, in bytes, of the written artifact.
    pub size_bytes: u64,
}

/// Errors a [`Sink`] raises.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The batch write failed.
    #[error("sink write failed: {0}")]
    WriteFailed(String),
    /// `flush` failed.
    #[error("sink flush failed: {0}")]
    FlushFailed(String),
    /// `close` failed.
    #[error("sink close failed: {0}")]
    CloseFailed(String),
}

/// A row-oriented data destination (§6.1).
pub trait Sink: Send + Sync {
    /// Writes a batch of rows, returning the artifact produced.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::WriteFailed`] on failure. Per §4.7.2, a
    /// sink failure fails every token participating in the batch unless
    /// the sink's configured `on_error` policy routes them to a named
    /// error sink instead.
    fn write(&self, rows: &[Value], ctx: &PluginContext) -> Result<ArtifactDescriptor, SinkError>;

    /// Forces any buffered output to be written.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::FlushFailed`] on failure.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Releases any resources held by the sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::CloseFailed`] on failure.
    fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

pub use elspeth_coalesce::CoalesceMerger;
