// crates/elspeth-store-sqlite/src/error.rs
// ============================================================================
// Module: ELSPETH Audit Store Errors
// Description: Failure modes for the SQLite-backed landscape recorder.
// ============================================================================

use thiserror::Error;

use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RunId;
use elspeth_core::identifiers::TokenId;
use elspeth_token::TokenError;

/// Errors raised by [`crate::LandscapeStore`] operations.
///
/// # Invariants
/// - Variants map to the error taxonomy of spec §7: configuration errors
///   surface here as [`StoreError`]; framework/invariant violations (a
///   re-completed terminal state, a NULL `completed_at` on a terminal read)
///   are never wrapped here and panic at the call site instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite connection reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A value could not be canonicalized or hashed.
    #[error("hashing error: {0}")]
    Hashing(#[from] elspeth_core::hashing::HashError),
    /// A value failed to serialize to or deserialize from JSON for
    /// storage in a `TEXT` column.
    #[error("json (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A fork/expand/coalesce request violated [`elspeth_token::TokenManager`]'s
    /// contract.
    #[error("token lifecycle error: {0}")]
    Token(#[from] TokenError),
    /// A run was not found.
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    /// A node was not found.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    /// A token was not found.
    #[error("token not found: {0}")]
    TokenNotFound(TokenId),
    /// Re-registering a node under an existing `node_id` with different
    /// plugin metadata (§4.2.2: re-registration must be idempotent, which
    /// requires identical inputs).
    #[error(
        "node '{node_id}' is already registered with different plugin metadata; re-registration \
         must use identical inputs to be idempotent"
    )]
    NodeConflict {
        /// The conflicting node ID.
        node_id: NodeId,
    },
    /// A [`crate::TokenOutcomeDetail`] was recorded without validating required
    /// fields for its outcome kind (§4.3). The recorder validates this before
    /// the DB write ever happens, so this is a contract error, not a DB error.
    #[error("outcome {outcome:?} is missing required field '{field}'")]
    MissingOutcomeField {
        /// The outcome kind that was rejected.
        outcome: elspeth_core::model::Outcome,
        /// The missing field's name.
        field: &'static str,
    },
    /// A second terminal outcome was recorded for a token that already has
    /// one (§4.2.3: exactly one terminal outcome per token).
    #[error("token '{0}' already has a terminal outcome recorded")]
    DuplicateTerminalOutcome(TokenId),
    /// A checkpoint referenced a node that is not registered in the graph
    /// that was checkpointed against (original_source supplement, §4.9).
    #[error("checkpoint references unknown node: {0}")]
    CheckpointUnknownNode(NodeId),
    /// A checkpoint was requested against an empty graph.
    #[error("cannot checkpoint against an empty graph")]
    CheckpointEmptyGraph,
    /// An existing database's `schema_meta.version` does not match
    /// [`crate::schema::SCHEMA_VERSION`]; this crate carries no migration
    /// path, so opening a store stamped with a foreign version is refused
    /// rather than risked against mismatched table definitions.
    #[error("database schema version {found} does not match expected version {expected}")]
    SchemaVersionMismatch {
        /// The version this crate's schema module expects.
        expected: i64,
        /// The version actually stamped in the opened database.
        found: i64,
    },
}
