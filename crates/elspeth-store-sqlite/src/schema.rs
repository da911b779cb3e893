// crates/elspeth-store-sqlite/src/schema.rs
// ============================================================================
// Module: ELSPETH Audit Database Schema
// Description: DDL for the audit trail tables (§6.3).
// ============================================================================

//! ## Overview
//! One `CREATE TABLE IF NOT EXISTS` per audited entity, applied inside a
//! single transaction at connection open. `token_outcomes` carries the
//! partial unique index enforcing "exactly one terminal outcome per
//! token" (§4.2.3) at the database layer rather than only in application
//! code, so a concurrent writer cannot race past the check. A fresh
//! database is stamped with [`SCHEMA_VERSION`]; a database stamped with
//! any other version is refused at open rather than applied against, since
//! this module has no migration between versions.

use rusqlite::Connection;
use rusqlite::OptionalExtension;

use crate::error::StoreError;

/// Current schema version. Bump whenever a table definition below changes
/// in a way that is not purely additive.
pub const SCHEMA_VERSION: i64 = 1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    config_hash TEXT NOT NULL,
    settings_json TEXT NOT NULL,
    canonical_version TEXT NOT NULL,
    status TEXT NOT NULL,
    export_status TEXT
);

CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT NOT NULL,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    plugin_name TEXT NOT NULL,
    node_type TEXT NOT NULL,
    plugin_version TEXT NOT NULL,
    determinism TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    config_json TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    schema_hash TEXT,
    schema_mode TEXT,
    schema_fields_json TEXT,
    sequence_in_pipeline INTEGER,
    PRIMARY KEY (node_id, run_id)
);

CREATE TABLE IF NOT EXISTS edges (
    edge_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    from_node_id TEXT NOT NULL,
    to_node_id TEXT NOT NULL,
    label TEXT NOT NULL,
    default_mode TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, from_node_id, label)
);

CREATE TABLE IF NOT EXISTS rows (
    row_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    source_data_hash TEXT NOT NULL,
    source_data_ref TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS rows_by_run_index ON rows(run_id, row_index);

CREATE TABLE IF NOT EXISTS tokens (
    token_id TEXT PRIMARY KEY,
    row_id TEXT NOT NULL REFERENCES rows(row_id),
    fork_group_id TEXT,
    join_group_id TEXT,
    expand_group_id TEXT,
    branch_name TEXT,
    step_in_pipeline INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tokens_by_row ON tokens(row_id);

CREATE TABLE IF NOT EXISTS token_parents (
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (token_id, parent_token_id, ordinal)
);

CREATE TABLE IF NOT EXISTS node_states (
    state_id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    node_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_ms INTEGER,
    output_hash TEXT,
    error_json TEXT,
    context_before_json TEXT,
    UNIQUE (token_id, node_id, attempt)
);
CREATE INDEX IF NOT EXISTS node_states_by_token_step
    ON node_states(token_id, step_index, attempt);

CREATE TABLE IF NOT EXISTS operations (
    operation_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    node_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    input_data_ref TEXT,
    input_data_hash TEXT,
    output_data_ref TEXT,
    output_data_hash TEXT,
    error_message TEXT,
    duration_ms INTEGER
);

CREATE TABLE IF NOT EXISTS calls (
    call_id TEXT PRIMARY KEY,
    state_id TEXT,
    operation_id TEXT,
    call_index INTEGER NOT NULL,
    call_type TEXT NOT NULL,
    status TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_ref TEXT,
    response_hash TEXT,
    response_ref TEXT,
    error_json TEXT,
    latency_ms INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (state_id, call_index),
    UNIQUE (operation_id, call_index),
    CHECK ((state_id IS NULL) <> (operation_id IS NULL))
);

CREATE TABLE IF NOT EXISTS routing_events (
    event_id TEXT PRIMARY KEY,
    state_id TEXT NOT NULL,
    edge_id TEXT NOT NULL,
    routing_group_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    mode TEXT NOT NULL,
    created_at TEXT NOT NULL,
    reason_hash TEXT,
    reason_ref TEXT
);
CREATE INDEX IF NOT EXISTS routing_events_by_group ON routing_events(routing_group_id);

CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    node_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    flushed_at TEXT
);

CREATE TABLE IF NOT EXISTS batch_members (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id)
);

CREATE TABLE IF NOT EXISTS batch_outputs (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id)
);

CREATE TABLE IF NOT EXISTS token_outcomes (
    outcome_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL REFERENCES tokens(token_id),
    outcome TEXT NOT NULL,
    is_terminal INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    sink_name TEXT,
    batch_id TEXT,
    fork_group_id TEXT,
    join_group_id TEXT,
    expand_group_id TEXT,
    error_hash TEXT,
    context_json TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS token_outcomes_one_terminal
    ON token_outcomes(token_id) WHERE is_terminal = 1;
CREATE INDEX IF NOT EXISTS token_outcomes_by_row
    ON token_outcomes(token_id, recorded_at);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    produced_by_state_id TEXT,
    sink_node_id TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    path_or_uri TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS validation_errors (
    error_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    node_id TEXT,
    row_data_json TEXT NOT NULL,
    error TEXT NOT NULL,
    schema_mode TEXT NOT NULL,
    destination TEXT NOT NULL,
    violation_type TEXT,
    normalized_field_name TEXT,
    original_field_name TEXT,
    expected_type TEXT,
    actual_type TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    token_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    aggregation_state_json TEXT,
    upstream_topology_hash TEXT NOT NULL,
    checkpoint_node_config_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    format_version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS checkpoints_by_run_seq
    ON checkpoints(run_id, sequence_number);
";

/// Applies the schema to `conn`, creating tables and indexes if absent,
/// stamping [`SCHEMA_VERSION`] when the database is new, and rejecting a
/// database stamped with any other version (forward- or
/// backward-incompatible, since this crate ships no migration path).
///
/// # Errors
///
/// Returns [`StoreError::Sqlite`] if any DDL statement fails, or
/// [`StoreError::SchemaVersionMismatch`] if an existing database carries a
/// `schema_meta.version` other than [`SCHEMA_VERSION`].
pub fn apply(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(DDL)?;
    let stamped: Option<i64> = conn
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match stamped {
        None => {
            conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [SCHEMA_VERSION])?;
        }
        Some(found) if found == SCHEMA_VERSION => {}
        Some(found) => {
            return Err(StoreError::SchemaVersionMismatch { expected: SCHEMA_VERSION, found });
        }
    }
    Ok(())
}
