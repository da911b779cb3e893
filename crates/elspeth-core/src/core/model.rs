// crates/elspeth-core/src/core/model.rs
// ============================================================================
// Module: ELSPETH Entity Model
// Description: Value types for the audit trail entities (§3.2).
// Purpose: Give every subsystem a single, shared, immutable-by-convention
//          representation of runs, nodes, tokens, states, and outcomes.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! These are frozen value types, not live handles: nothing here holds a
//! connection or mutates in place. Transitions (for example `NodeState`
//! going from `OPEN` to a terminal status) are expressed by constructing a
//! new value, never by mutating an existing one in place — the recorder
//! (`elspeth-store-sqlite`) is the only thing allowed to decide that an
//! old row is superseded.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;

use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CallId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;

// ============================================================================
// SECTION: Run
// ============================================================================

/// Status of a [`Run`].
///
/// # Invariants
/// - A terminal status (`Completed`, `Failed`, `Cancelled`) is never
///   followed by another transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// The run is actively processing rows.
    Running,
    /// The run finished without an abort condition.
    Completed,
    /// The run aborted (source failure, configuration/security error,
    /// framework invariant violation, or sink failure under STRICT mode).
    Failed,
    /// The run was cancelled by its operator.
    Cancelled,
}

impl RunStatus {
    /// Returns whether this status is terminal (no further writes expected).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Export status of a completed run, when export is enabled (§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    /// Export has not yet been attempted.
    Pending,
    /// Export completed and was signed (or did not require signing).
    Exported,
    /// Export was attempted and failed.
    Failed,
}

/// One execution of the pipeline.
///
/// # Invariants
/// - `config_hash` is the SHA-256 of the canonical config.
/// - Immutable after `status` transitions to a terminal value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Identifier for this run.
    pub run_id: RunId,
    /// Wall-clock start time, supplied by the host.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Wall-clock completion time, set once `status` becomes terminal.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// SHA-256 of the canonical pipeline configuration.
    pub config_hash: String,
    /// Canonical version tag (see [`crate::hashing::CANONICAL_VERSION`]).
    pub canonical_version: String,
    /// Current status.
    pub status: RunStatus,
    /// Export status, when export is enabled.
    pub export_status: Option<ExportStatus>,
}

// ============================================================================
// SECTION: Node / Edge
// ============================================================================

/// Structural role of a registered node (§3.2, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// Emits rows into the pipeline.
    Source,
    /// Row-at-a-time transformation.
    Transform,
    /// Batch-aware aggregation transform.
    Aggregation,
    /// Condition-based routing decision point.
    Gate,
    /// Joins parallel-path tokens.
    Coalesce,
    /// Terminal consumer of rows.
    Sink,
}

/// Static determinism label for a node (audited but not enforced, per
/// the glossary entry "Determinism class").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Determinism {
    /// Pure function of its declared inputs.
    Deterministic,
    /// Reads external state but does not mutate it.
    IoRead,
    /// Mutates external state.
    IoWrite,
    /// Invokes a non-idempotent external service (LLM, HTTP, ...).
    ExternalCall,
    /// Declared non-deterministic for another reason (clock, RNG, ...).
    NonDeterministic,
}

/// A registered instance of a plugin within a run.
///
/// # Invariants
/// - `node_id` is deterministic from `(plugin_name, position, config_hash)`;
///   re-registration with identical inputs is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier for this node.
    pub node_id: NodeId,
    /// Owning run.
    pub run_id: RunId,
    /// Configured plugin name.
    pub plugin_name: String,
    /// Structural role.
    pub node_type: NodeType,
    /// Plugin version string, as declared by the plugin.
    pub plugin_version: String,
    /// Static determinism label.
    pub determinism: Determinism,
    /// SHA-256 of the canonical node configuration.
    pub config_hash: String,
    /// Raw configuration, stored for audit/debugging.
    pub config_json: serde_json::Value,
    /// Wall-clock registration time.
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    /// 0-based position in the declared topological order.
    pub sequence_in_pipeline: Option<u32>,
}

/// Routing mode for an edge (§GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingMode {
    /// Consumes the original token.
    Move,
    /// Duplicates the token onto the edge.
    Copy,
}

/// A directed, labelled edge between two nodes.
///
/// # Invariants
/// - `(from_node, to_node, label)` is unique per source node: outgoing
///   labels are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Identifier for this edge.
    pub edge_id: EdgeId,
    /// Owning run.
    pub run_id: RunId,
    /// Source node.
    pub from_node_id: NodeId,
    /// Destination node.
    pub to_node_id: NodeId,
    /// Routing outcome label that selects this edge.
    pub label: String,
    /// Default routing mode for tokens crossing this edge.
    pub default_mode: RoutingMode,
    /// Wall-clock creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Row / Token
// ============================================================================

/// A source row.
///
/// # Invariants
/// - Immutable once created; `source_data_hash` survives payload purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Identifier for this row.
    pub row_id: RowId,
    /// Owning run.
    pub run_id: RunId,
    /// Node that produced this row.
    pub source_node_id: NodeId,
    /// 0-based monotone index in source emission order.
    pub row_index: u64,
    /// SHA-256 of the canonicalized source payload.
    pub source_data_hash: String,
    /// Optional reference into a payload store (purgeable; the hash is
    /// the permanent audit anchor).
    pub source_data_ref: Option<String>,
    /// Wall-clock creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// An execution instance of a row on a path through the graph.
///
/// # Invariants
/// - May have multiple parents, recorded via `(token_id, parent_token_id,
///   ordinal)` in the audit store, not inline here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Identifier for this token.
    pub token_id: TokenId,
    /// Row this token is an instance of.
    pub row_id: RowId,
    /// Shared identifier for siblings of a fork, if this token is one.
    pub fork_group_id: Option<String>,
    /// Identifier of the coalesce that produced this token, if any.
    pub join_group_id: Option<String>,
    /// Shared identifier for siblings of a 1→N expansion, if any.
    pub expand_group_id: Option<String>,
    /// Branch name assigned at fork time, if any.
    pub branch_name: Option<String>,
    /// Position in the pipeline at which this token was created.
    pub step_in_pipeline: Option<u32>,
    /// Wall-clock creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: NodeState
// ============================================================================

/// Status of a [`NodeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStateStatus {
    /// Opened but not yet completed.
    Open,
    /// Completed successfully.
    Completed,
    /// Completed with an error.
    Failed,
}

/// Execution of one node on one token.
///
/// # Invariants
/// - `(token_id, node_id, attempt)` is unique.
/// - `Open` carries `input_hash`/`started_at`; a terminal status must
///   carry `completed_at`, `duration_ms`, and either `output_hash`
///   (`Completed`) or `error_json` (`Failed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Identifier for this state.
    pub state_id: StateId,
    /// Token this state executes.
    pub token_id: TokenId,
    /// Node this state executes.
    pub node_id: NodeId,
    /// 0-based position in topological order.
    pub step_index: u32,
    /// 1-based retry attempt number.
    pub attempt: u32,
    /// Current status.
    pub status: NodeStateStatus,
    /// SHA-256 of the canonicalized input.
    pub input_hash: String,
    /// Wall-clock open time.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Wall-clock completion time; required once `status` is terminal.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Wall-clock duration in milliseconds; required once terminal.
    pub duration_ms: Option<u64>,
    /// SHA-256 of the canonicalized output; required when `Completed`.
    pub output_hash: Option<String>,
    /// Structured error; required when `Failed`.
    pub error_json: Option<serde_json::Value>,
}

impl NodeState {
    /// Opens a new node state for `(token_id, node_id, attempt)`.
    #[must_use]
    pub fn open(
        state_id: StateId,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: String,
        started_at: OffsetDateTime,
    ) -> Self {
        Self {
            state_id,
            token_id,
            node_id,
            step_index,
            attempt,
            status: NodeStateStatus::Open,
            input_hash,
            started_at,
            completed_at: None,
            duration_ms: None,
            output_hash: None,
            error_json: None,
        }
    }

    /// Returns whether this state has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.status, NodeStateStatus::Open)
    }
}

// ============================================================================
// SECTION: Call / Operation
// ============================================================================

/// Kind of external invocation recorded by a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    /// Large-language-model invocation.
    Llm,
    /// HTTP request.
    Http,
    /// SQL statement.
    Sql,
    /// Filesystem operation.
    Filesystem,
}

/// Outcome of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// The call succeeded.
    Success,
    /// The call failed.
    Error,
}

/// Either side of the call-parent union (§3.2: "exactly one parent: state_id
/// XOR operation_id").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallParent {
    /// Parented by a node state.
    State(StateId),
    /// Parented by a source/sink operation.
    Operation(OperationId),
}

/// An external invocation inside a state or operation.
///
/// # Invariants
/// - `call_index` is monotonically increasing per parent, starting at 0.
/// - `(state_id, call_index)` and `(operation_id, call_index)` are each
///   unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    /// Identifier for this call.
    pub call_id: CallId,
    /// Parent context (state XOR operation).
    pub parent: CallParent,
    /// 0-based, monotone index within the parent.
    pub call_index: u32,
    /// Kind of invocation.
    pub call_type: CallType,
    /// Outcome.
    pub status: CallStatus,
    /// SHA-256 of the canonicalized request.
    pub request_hash: String,
    /// Optional reference into a payload store.
    pub request_ref: Option<String>,
    /// SHA-256 of the canonicalized response, if any.
    pub response_hash: Option<String>,
    /// Optional reference into a payload store.
    pub response_ref: Option<String>,
    /// Structured error, if `status` is `Error`.
    pub error_json: Option<serde_json::Value>,
    /// Observed latency in milliseconds.
    pub latency_ms: Option<u64>,
    /// Wall-clock creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Kind of source-load or sink-write I/O recorded by an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// A source load pass.
    SourceLoad,
    /// A sink write pass.
    SinkWrite,
}

/// A parent context for source-load or sink-write I/O calls, analogous to
/// [`NodeState`] but for sources/sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Identifier for this operation.
    pub operation_id: OperationId,
    /// Owning run.
    pub run_id: RunId,
    /// Node this operation executes on.
    pub node_id: NodeId,
    /// Kind of operation.
    pub operation_type: OperationType,
    /// Wall-clock start time.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Wall-clock completion time, once terminal.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Status, reusing [`NodeStateStatus`]'s open/terminal shape.
    pub status: NodeStateStatus,
    /// Optional reference into a payload store for the input batch.
    pub input_data_ref: Option<String>,
    /// SHA-256 of the canonicalized input batch, if any.
    pub input_data_hash: Option<String>,
    /// Optional reference into a payload store for the output batch.
    pub output_data_ref: Option<String>,
    /// SHA-256 of the canonicalized output batch, if any.
    pub output_data_hash: Option<String>,
    /// Human-readable error message, if `status` is `Failed`.
    pub error_message: Option<String>,
    /// Wall-clock duration in milliseconds, once terminal.
    pub duration_ms: Option<u64>,
}

// ============================================================================
// SECTION: RoutingEvent
// ============================================================================

/// Crossing of an edge by a token.
///
/// # Invariants
/// - All edges chosen at one decision point share one `routing_group_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Identifier for this event.
    pub event_id: String,
    /// Node state that produced this routing decision.
    pub state_id: StateId,
    /// Edge crossed.
    pub edge_id: EdgeId,
    /// Identifier shared by every edge chosen at this decision point.
    pub routing_group_id: String,
    /// 0-based ordinal within the routing group.
    pub ordinal: u32,
    /// Mode this crossing used.
    pub mode: RoutingMode,
    /// Wall-clock creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// SHA-256 of the canonicalized routing reason (gate condition
    /// result), if applicable.
    pub reason_hash: Option<String>,
    /// Optional reference into a payload store for the reason detail.
    pub reason_ref: Option<String>,
}

// ============================================================================
// SECTION: Batch
// ============================================================================

/// A buffered set of tokens consumed by a batch-aware transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Identifier for this batch.
    pub batch_id: BatchId,
    /// Owning run.
    pub run_id: RunId,
    /// Aggregation node that owns this batch.
    pub node_id: NodeId,
    /// Wall-clock creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Wall-clock flush time, once flushed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub flushed_at: Option<OffsetDateTime>,
}

/// One member token of a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Member token.
    pub token_id: TokenId,
    /// 0-based ordinal of arrival within the batch.
    pub ordinal: u32,
}

/// One output token produced by flushing a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Output token.
    pub token_id: TokenId,
    /// 0-based ordinal of emission.
    pub ordinal: u32,
}

// ============================================================================
// SECTION: TokenOutcome
// ============================================================================

/// Terminal or transient attribution of a token (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Reached a sink and was written successfully.
    Completed,
    /// Routed to a sink via a gate (terminal at the routing sink).
    Routed,
    /// Forked into sibling branch tokens.
    Forked,
    /// Failed terminally.
    Failed,
    /// Quarantined at ingestion; never entered the graph proper.
    Quarantined,
    /// Consumed into a batch by an aggregation transform.
    ConsumedInBatch,
    /// Merged by a coalesce into a joined token.
    Coalesced,
    /// Expanded into sibling tokens by a 1→N transform.
    Expanded,
    /// Buffered pending a batch flush; not terminal.
    Buffered,
}

impl Outcome {
    /// Returns whether this outcome is terminal (§4.3 table).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Buffered)
    }
}

/// Side fields accompanying a [`TokenOutcome`], one variant per outcome
/// kind so construction cannot omit an outcome's required fields (§4.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeDetail {
    /// `COMPLETED` — requires the sink name.
    Completed {
        /// Sink the token was written to.
        sink_name: String,
    },
    /// `ROUTED` — requires the sink name.
    Routed {
        /// Sink the token was routed to.
        sink_name: String,
    },
    /// `FORKED` — requires the fork group identifier.
    Forked {
        /// Shared identifier of the sibling tokens produced.
        fork_group_id: String,
    },
    /// `FAILED` — requires the error hash.
    Failed {
        /// SHA-256 of the canonicalized error.
        error_hash: String,
    },
    /// `QUARANTINED` — requires the error hash.
    Quarantined {
        /// SHA-256 of the canonicalized contract violation.
        error_hash: String,
    },
    /// `CONSUMED_IN_BATCH` — requires the batch identifier.
    ConsumedInBatch {
        /// Batch the token was consumed into.
        batch_id: BatchId,
    },
    /// `COALESCED` — requires the join group identifier.
    Coalesced {
        /// Identifier of the coalesce that consumed this token.
        join_group_id: String,
    },
    /// `EXPANDED` — requires the expand group identifier.
    Expanded {
        /// Shared identifier of the sibling tokens produced.
        expand_group_id: String,
    },
    /// `BUFFERED` — requires the batch identifier; not terminal.
    Buffered {
        /// Batch the token is currently buffered in.
        batch_id: BatchId,
    },
}

impl OutcomeDetail {
    /// Returns the [`Outcome`] kind this detail corresponds to.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Completed { .. } => Outcome::Completed,
            Self::Routed { .. } => Outcome::Routed,
            Self::Forked { .. } => Outcome::Forked,
            Self::Failed { .. } => Outcome::Failed,
            Self::Quarantined { .. } => Outcome::Quarantined,
            Self::ConsumedInBatch { .. } => Outcome::ConsumedInBatch,
            Self::Coalesced { .. } => Outcome::Coalesced,
            Self::Expanded { .. } => Outcome::Expanded,
            Self::Buffered { .. } => Outcome::Buffered,
        }
    }
}

/// A recorded terminal or transient outcome for a token.
///
/// # Invariants
/// - At most one row with `is_terminal = true` exists per `token_id`
///   (enforced by the audit store's unique index, not by this type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcome {
    /// Identifier for this outcome record.
    pub outcome_id: OutcomeId,
    /// Owning run.
    pub run_id: RunId,
    /// Token this outcome applies to.
    pub token_id: TokenId,
    /// Outcome-specific required fields.
    pub detail: OutcomeDetail,
    /// Wall-clock recording time.
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    /// Free-form context, stored for audit/debugging.
    pub context_json: Option<serde_json::Value>,
}

impl TokenOutcome {
    /// Returns whether this outcome is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.detail.outcome().is_terminal()
    }
}

// ============================================================================
// SECTION: SchemaContract
// ============================================================================

/// Strictness mode of a [`SchemaContract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaMode {
    /// Field set is fixed; extra or missing fields are contract violations.
    Fixed,
    /// Field set may grow; declared fields are still enforced.
    Flexible,
    /// Field set is inferred from observed data, not declared up front.
    Observed,
}

/// One field of a [`SchemaContract`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContract {
    /// Normalized (canonical) field name.
    pub normalized_name: String,
    /// Field name as it appeared in the original source.
    pub original_name: String,
    /// Python-style type tag (`str`, `int`, `float`, `bool`, `list`,
    /// `dict`, `None`), carried over from the configuration surface that
    /// declares contracts.
    pub python_type: String,
    /// Whether this field must be present.
    pub required: bool,
    /// Name of the node that contributed this field.
    pub source: String,
}

/// A declared (or observed) shape for row data flowing between nodes.
///
/// # Invariants
/// - `version_hash()` is the canonical hash of the ordered field list plus
///   `mode`; it identifies the contract across serialization boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Declared fields, in declaration order.
    pub fields: Vec<FieldContract>,
    /// Strictness mode.
    pub mode: SchemaMode,
    /// Whether the contract has been locked against further mutation.
    pub locked: bool,
}

impl SchemaContract {
    /// Computes the canonical version hash identifying this contract.
    ///
    /// # Errors
    ///
    /// Returns [`crate::hashing::HashError`] if the contract somehow fails
    /// to canonicalize (it cannot contain non-finite floats, so this is
    /// only reachable if serialization itself fails).
    pub fn version_hash(&self) -> Result<crate::hashing::HashDigest, crate::hashing::HashError> {
        crate::hashing::hash_canonical_json(crate::hashing::HashAlgorithm::Sha256, self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;

    #[test]
    fn schema_contract_version_hash_is_order_sensitive_to_mode_not_to_map_keys() {
        let a = SchemaContract {
            fields: vec![FieldContract {
                normalized_name: "amount".into(),
                original_name: "Amount".into(),
                python_type: "float".into(),
                required: true,
                source: "source".into(),
            }],
            mode: SchemaMode::Fixed,
            locked: true,
        };
        let mut b = a.clone();
        b.mode = SchemaMode::Flexible;
        assert_ne!(a.version_hash().unwrap().value, b.version_hash().unwrap().value);
    }

    #[test]
    fn outcome_detail_reports_terminality_consistently_with_outcome() {
        let detail = OutcomeDetail::Buffered { batch_id: BatchId::new("batch-1") };
        assert!(!detail.outcome().is_terminal());
        let detail = OutcomeDetail::Completed { sink_name: "out".into() };
        assert!(detail.outcome().is_terminal());
    }
}
