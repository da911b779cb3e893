// crates/elspeth-store-sqlite/src/store.rs
// ============================================================================
// Module: ELSPETH Landscape Recorder
// Description: SQLite-backed audit recorder implementing C2/C3 and the
//              storage half of C9 (§4.2, §6.3).
// Purpose: Durable, transactional home for every audited entity; the only
//          place allowed to decide that an old row is superseded.
// Dependencies: elspeth-core, elspeth-token, rusqlite, serde_json, time
// ============================================================================

//! ## Overview
//! `LandscapeStore` owns one `SQLite` connection behind a mutex. Every
//! operation that must be atomic (fork/expand/coalesce plus their parent
//! outcome, complete-state plus its terminal fields) runs inside a single
//! `rusqlite` transaction so a crash mid-write can never leave a child
//! token without its parent's outcome recorded, or vice versa.
//!
//! Call-index allocation (§4.2.2) is cached in memory but seeded from
//! `SELECT MAX(call_index)` the first time a given parent is touched,
//! so a recorder recreated against an existing database after a crash
//! resumes indexing exactly where the crashed process left off.

use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use elspeth_core::hashing::HashAlgorithm;
use elspeth_core::hashing::hash_canonical_json;
use elspeth_core::identifiers::ArtifactId;
use elspeth_core::identifiers::BatchId;
use elspeth_core::identifiers::CheckpointId;
use elspeth_core::identifiers::EdgeId;
use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::OperationId;
use elspeth_core::identifiers::OutcomeId;
use elspeth_core::identifiers::RowId;
use elspeth_core::identifiers::RunId;
use elspeth_core::identifiers::StateId;
use elspeth_core::identifiers::TokenId;
use elspeth_core::model::Call;
use elspeth_core::model::CallParent;
use elspeth_core::model::Edge;
use elspeth_core::model::ExportStatus;
use elspeth_core::model::Node;
use elspeth_core::model::NodeState;
use elspeth_core::model::NodeStateStatus;
use elspeth_core::model::Operation;
use elspeth_core::model::OperationType;
use elspeth_core::model::Outcome;
use elspeth_core::model::OutcomeDetail;
use elspeth_core::model::RoutingEvent;
use elspeth_core::model::RoutingMode;
use elspeth_core::model::Row;
use elspeth_core::model::Run;
use elspeth_core::model::RunStatus;
use elspeth_core::model::Token;
use elspeth_core::model::TokenOutcome;
use elspeth_token::TokenManager;

use crate::config::SqliteStoreConfig;
use crate::error::StoreError;
use crate::schema;

/// Durable landscape recorder: the SQLite half of C2/C3 plus checkpoint
/// storage for C9.
///
/// # Invariants
/// - One `LandscapeStore` per open database; callers share it behind an
///   `Arc` across worker threads rather than opening several stores
///   against the same file (`SQLite`'s WAL mode tolerates multiple
///   connections, but the in-process call-index cache does not).
pub struct LandscapeStore {
    conn: Mutex<Connection>,
    call_index_cache: Mutex<HashMap<String, u32>>,
    tokens: TokenManager,
}

/// Field-level detail for a `validation_errors` row, populated when the
/// violation can be attributed to one field (a type mismatch) rather than
/// the row as a whole (an unexpected or missing field).
#[derive(Debug, Clone, Copy)]
pub struct ValidationFieldDetail<'a> {
    /// Normalized (canonical) field name.
    pub normalized_field_name: &'a str,
    /// Field name as it appeared in the original source.
    pub original_field_name: &'a str,
    /// Declared `python_type` tag.
    pub expected_type: &'a str,
    /// `python_type` tag of the value actually observed.
    pub actual_type: &'a str,
}

impl LandscapeStore {
    /// Opens (creating if absent) a `SQLite` database at `config.path` and
    /// applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the connection cannot be opened,
    /// pragmas cannot be applied, or the schema cannot be created.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, StoreError> {
        let conn = if config.is_in_memory() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&config.path)?
        };
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};",
            config.journal_mode.pragma_value()
        ))?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous = {};",
            config.sync_mode.pragma_value()
        ))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            call_index_cache: Mutex::new(HashMap::new()),
            tokens: TokenManager::new(),
        })
    }

    #[allow(
        clippy::significant_drop_tightening,
        reason = "the mutex guard is held for the statement's lifetime, not released early"
    )]
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        #[allow(
            clippy::unwrap_used,
            reason = "a poisoned connection mutex means a prior writer panicked mid-transaction; \
                      the store cannot recover and must propagate the poison, not paper over it"
        )]
        self.conn.lock().unwrap()
    }

    // ========================================================================
    // SECTION: Run
    // ========================================================================

    /// Begins a new run, recording its canonical config hash (§4.2.2).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Hashing`] if `settings` fails to canonicalize,
    /// or [`StoreError::Sqlite`] on a write failure.
    pub fn begin_run(
        &self,
        run_id: RunId,
        settings: &serde_json::Value,
        canonical_version: &str,
        now: OffsetDateTime,
    ) -> Result<Run, StoreError> {
        let config_hash = hash_canonical_json(HashAlgorithm::Sha256, settings)?;
        let run = Run {
            run_id,
            started_at: now,
            completed_at: None,
            config_hash: config_hash.value,
            canonical_version: canonical_version.to_owned(),
            status: RunStatus::Running,
            export_status: None,
        };
        self.conn().execute(
            "INSERT INTO runs (run_id, started_at, completed_at, config_hash, settings_json, \
             canonical_version, status, export_status) VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, NULL)",
            params![
                run.run_id.as_str(),
                fmt_time(run.started_at),
                run.config_hash,
                serde_json::to_string(settings)?,
                run.canonical_version,
                enum_to_str(&run.status),
            ],
        )?;
        Ok(run)
    }

    /// Transitions `run_id` to a terminal status. A run that is already
    /// terminal must never be transitioned again (§3.2); callers are
    /// expected to check [`Self::get_run`] first.
    ///
    /// # Panics
    ///
    /// Panics if `run_id` does not exist: completing a run that was never
    /// begun is a framework bug, not a recoverable condition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    #[allow(
        clippy::panic,
        reason = "completing an unknown run is an internal invariant violation, not user-facing"
    )]
    pub fn complete_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        export_status: Option<ExportStatus>,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let export_status_str = export_status.map(|value| enum_to_str(&value));
        let updated = self.conn().execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, export_status = ?3 WHERE run_id = ?4",
            params![enum_to_str(&status), fmt_time(now), export_status_str, run_id.as_str()],
        )?;
        assert!(updated == 1, "complete_run called on unknown run_id {run_id}");
        Ok(())
    }

    /// Reads back a run by ID.
    ///
    /// # Panics
    ///
    /// Panics if the stored `status` or `export_status` fails to hydrate,
    /// or if a terminal run has a NULL `completed_at` (§8.1 "Audit
    /// readability").
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    #[allow(
        clippy::panic,
        clippy::panic_in_result_fn,
        reason = "corrupt run status/timestamp data is a framework bug, never user-facing"
    )]
    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        self.conn()
            .query_row(
                "SELECT started_at, completed_at, config_hash, canonical_version, status, \
                 export_status FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| {
                    let started_at: String = row.get(0)?;
                    let completed_at: Option<String> = row.get(1)?;
                    let config_hash: String = row.get(2)?;
                    let canonical_version: String = row.get(3)?;
                    let status: String = row.get(4)?;
                    let export_status: Option<String> = row.get(5)?;
                    Ok((started_at, completed_at, config_hash, canonical_version, status, export_status))
                },
            )
            .optional()?
            .map(|(started_at, completed_at, config_hash, canonical_version, status, export_status)| {
                let status: RunStatus = enum_from_str(&status);
                let completed_at = completed_at.map(|value| parse_time(&value));
                assert!(
                    !status.is_terminal() || completed_at.is_some(),
                    "terminal run {run_id} has NULL completed_at"
                );
                Run {
                    run_id: run_id.clone(),
                    started_at: parse_time(&started_at),
                    completed_at,
                    config_hash,
                    canonical_version,
                    status,
                    export_status: export_status.map(|value| enum_from_str(&value)),
                }
            })
            .map_or_else(|| Ok(None), |run| Ok(Some(run)))
    }

    // ========================================================================
    // SECTION: Node / Edge
    // ========================================================================

    /// Registers `node`, or confirms an existing registration under the
    /// same `node_id` carries identical plugin metadata (§4.2.2:
    /// "re-registration with identical inputs is idempotent").
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NodeConflict`] if `node_id` is already
    /// registered with different plugin metadata, or [`StoreError::Sqlite`]
    /// on a write failure.
    pub fn register_node(&self, node: &Node) -> Result<(), StoreError> {
        let conn = self.conn();
        if let Some(existing) = conn
            .query_row(
                "SELECT plugin_name, node_type, plugin_version, determinism, config_hash FROM \
                 nodes WHERE node_id = ?1 AND run_id = ?2",
                params![node.node_id.as_str(), node.run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
        {
            let matches = existing
                == (
                    node.plugin_name.clone(),
                    enum_to_str(&node.node_type),
                    node.plugin_version.clone(),
                    enum_to_str(&node.determinism),
                    node.config_hash.clone(),
                );
            if matches {
                return Ok(());
            }
            return Err(StoreError::NodeConflict { node_id: node.node_id.clone() });
        }
        conn.execute(
            "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, plugin_version, \
             determinism, config_hash, config_json, registered_at, sequence_in_pipeline) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                node.node_id.as_str(),
                node.run_id.as_str(),
                node.plugin_name,
                enum_to_str(&node.node_type),
                node.plugin_version,
                enum_to_str(&node.determinism),
                node.config_hash,
                serde_json::to_string(&node.config_json)?,
                fmt_time(node.registered_at),
                node.sequence_in_pipeline,
            ],
        )?;
        Ok(())
    }

    /// Registers a directed edge between two nodes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the edge violates the
    /// `(run_id, from_node_id, label)` uniqueness constraint (duplicate
    /// outgoing label, §3.2) or on any other write failure.
    pub fn register_edge(&self, edge: &Edge) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.edge_id.as_str(),
                edge.run_id.as_str(),
                edge.from_node_id.as_str(),
                edge.to_node_id.as_str(),
                edge.label,
                enum_to_str(&edge.default_mode),
                fmt_time(edge.created_at),
            ],
        )?;
        Ok(())
    }

    /// Attaches (or replaces) a node's schema contract, once it is known.
    /// For `OBSERVED` contracts this is typically called after a node's
    /// first row has been seen, not at registration time, so it is a
    /// separate call rather than a field on [`Node`] itself (§3.1, §6.3).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NodeNotFound`] if `node_id` is not
    /// registered for `run_id`, or [`StoreError::Sqlite`]/[`StoreError::Hashing`]
    /// on a write failure.
    pub fn record_node_schema(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        contract: &elspeth_core::model::SchemaContract,
    ) -> Result<(), StoreError> {
        let schema_hash = contract.version_hash()?;
        let updated = self.conn().execute(
            "UPDATE nodes SET schema_hash = ?1, schema_mode = ?2, schema_fields_json = ?3 \
             WHERE node_id = ?4 AND run_id = ?5",
            params![
                schema_hash.value,
                enum_to_str(&contract.mode),
                serde_json::to_string(&contract.fields)?,
                node_id.as_str(),
                run_id.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NodeNotFound(node_id.clone()));
        }
        Ok(())
    }

    // ========================================================================
    // SECTION: Row / Token
    // ========================================================================

    /// Records a newly emitted source row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Hashing`] if `payload` fails to canonicalize,
    /// or [`StoreError::Sqlite`] on a write failure.
    pub fn create_row(
        &self,
        row_id: RowId,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        payload: &serde_json::Value,
        now: OffsetDateTime,
    ) -> Result<Row, StoreError> {
        let source_data_hash = hash_canonical_json(HashAlgorithm::Sha256, payload)?;
        let row = Row {
            row_id,
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash: source_data_hash.value,
            source_data_ref: None,
            created_at: now,
        };
        self.conn().execute(
            "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
             source_data_ref, created_at) VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            #[allow(
                clippy::cast_possible_wrap,
                reason = "row_index values stay far below i64::MAX for any real run"
            )]
            params![
                row.row_id.as_str(),
                row.run_id.as_str(),
                row.source_node_id.as_str(),
                row.row_index as i64,
                row.source_data_hash,
                fmt_time(row.created_at),
            ],
        )?;
        Ok(row)
    }

    /// Creates the root token for `row`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    pub fn create_token(
        &self,
        token_id: TokenId,
        row_id: &RowId,
        now: OffsetDateTime,
    ) -> Result<Token, StoreError> {
        let token = self.tokens.create_token(token_id, row_id.clone(), now);
        self.insert_token(&self.conn(), &token)?;
        Ok(token)
    }

    fn insert_token(&self, conn: &Connection, token: &Token) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO tokens (token_id, row_id, fork_group_id, join_group_id, \
             expand_group_id, branch_name, step_in_pipeline, created_at) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                token.token_id.as_str(),
                token.row_id.as_str(),
                token.fork_group_id,
                token.join_group_id,
                token.expand_group_id,
                token.branch_name,
                token.step_in_pipeline,
                fmt_time(token.created_at),
            ],
        )?;
        Ok(())
    }

    fn insert_token_parent(
        &self,
        conn: &Connection,
        token_id: &TokenId,
        parent_token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO token_parents (token_id, parent_token_id, ordinal) VALUES (?1, ?2, ?3)",
            params![token_id.as_str(), parent_token_id.as_str(), ordinal],
        )?;
        Ok(())
    }

    /// Forks `parent` into one child token per branch, atomically
    /// recording the children, their `(child, parent, 0)` parentage, and
    /// the parent's `FORKED` outcome (§4.2.2).
    ///
    /// # Errors
    ///
    /// Returns [`elspeth_token::TokenError`] (wrapped) if `branches` is
    /// empty or contains duplicates, or [`StoreError::Sqlite`] on a write
    /// failure.
    #[allow(clippy::too_many_arguments, reason = "mirrors the fork contract in full, §4.2.2")]
    pub fn fork_token(
        &self,
        run_id: &RunId,
        parent: &Token,
        parent_data: &serde_json::Value,
        branches: &[String],
        fork_group_id: String,
        next_token_id: impl FnMut(usize) -> TokenId,
        override_data: Option<&serde_json::Value>,
        now: OffsetDateTime,
    ) -> Result<Vec<(Token, serde_json::Value)>, StoreError> {
        let children = self.tokens.fork_token(
            parent,
            parent_data,
            branches,
            fork_group_id.clone(),
            next_token_id,
            override_data,
            now,
        )?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (child, _) in &children {
            self.insert_token(&tx, child)?;
            self.insert_token_parent(&tx, &child.token_id, &parent.token_id, 0)?;
        }
        self.write_outcome(
            &tx,
            OutcomeId::new(uuid_like("outcome")),
            run_id,
            &parent.token_id,
            OutcomeDetail::Forked { fork_group_id },
            now,
            None,
        )?;
        tx.commit()?;
        Ok(children)
    }

    /// Expands `parent` into one child token per item, atomically
    /// recording the children and the parent's outcome. The parent's
    /// outcome is `EXPANDED` unless `consumed_in_batch` names the batch
    /// an aggregation transform consumed it into instead (§3.3, §4.2.2).
    ///
    /// # Errors
    ///
    /// Returns [`elspeth_token::TokenError`] (wrapped) if `items` is empty,
    /// or [`StoreError::Sqlite`] on a write failure.
    pub fn expand_token(
        &self,
        run_id: &RunId,
        parent: &Token,
        items: Vec<serde_json::Value>,
        expand_group_id: String,
        next_token_id: impl FnMut(usize) -> TokenId,
        consumed_in_batch: Option<BatchId>,
        now: OffsetDateTime,
    ) -> Result<Vec<(Token, serde_json::Value)>, StoreError> {
        let children =
            self.tokens.expand_token(parent, items, expand_group_id.clone(), next_token_id, now)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (child, _) in &children {
            self.insert_token(&tx, child)?;
            self.insert_token_parent(&tx, &child.token_id, &parent.token_id, 0)?;
        }
        let detail = match consumed_in_batch {
            Some(batch_id) => OutcomeDetail::ConsumedInBatch { batch_id },
            None => OutcomeDetail::Expanded { expand_group_id },
        };
        self.write_outcome(
            &tx,
            OutcomeId::new(uuid_like("outcome")),
            run_id,
            &parent.token_id,
            detail,
            now,
            None,
        )?;
        tx.commit()?;
        Ok(children)
    }

    /// Merges `members` into one coalesced token, atomically recording it,
    /// a `(child, member, ordinal)` parent row per member, and a
    /// `COALESCED` outcome for every member token (§4.8: "every consumed
    /// branch token gets an explicit outcome, success or failure").
    ///
    /// # Errors
    ///
    /// Returns [`elspeth_token::TokenError`] (wrapped) if `members` is
    /// empty, or [`StoreError::Sqlite`] on a write failure.
    pub fn coalesce_tokens(
        &self,
        run_id: &RunId,
        members: &[Token],
        merged_data: serde_json::Value,
        join_group_id: String,
        coalesced_token_id: TokenId,
        now: OffsetDateTime,
    ) -> Result<(Token, serde_json::Value), StoreError> {
        let (token, data) = self.tokens.coalesce_tokens(
            members,
            merged_data,
            join_group_id.clone(),
            coalesced_token_id,
            now,
        )?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        self.insert_token(&tx, &token)?;
        for (ordinal, member) in members.iter().enumerate() {
            self.insert_token_parent(
                &tx,
                &token.token_id,
                &member.token_id,
                u32::try_from(ordinal).unwrap_or(u32::MAX),
            )?;
            self.write_outcome(
                &tx,
                OutcomeId::new(uuid_like("outcome")),
                run_id,
                &member.token_id,
                OutcomeDetail::Coalesced { join_group_id: join_group_id.clone() },
                now,
                None,
            )?;
        }
        tx.commit()?;
        Ok((token, data))
    }

    // ========================================================================
    // SECTION: NodeState
    // ========================================================================

    /// Opens a node state for `(token_id, node_id, attempt)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if `(token_id, node_id, attempt)`
    /// already exists, or on any other write failure.
    pub fn begin_node_state(
        &self,
        state_id: StateId,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: String,
        now: OffsetDateTime,
    ) -> Result<NodeState, StoreError> {
        let state =
            NodeState::open(state_id, token_id, node_id, step_index, attempt, input_hash, now);
        self.conn().execute(
            "INSERT INTO node_states (state_id, token_id, node_id, step_index, attempt, status, \
             input_hash, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                state.state_id.as_str(),
                state.token_id.as_str(),
                state.node_id.as_str(),
                state.step_index,
                state.attempt,
                enum_to_str(&state.status),
                state.input_hash,
                fmt_time(state.started_at),
            ],
        )?;
        Ok(state)
    }

    /// Completes `state_id` with a terminal status, duration, and either
    /// an output hash (`Completed`) or a structured error (`Failed`).
    ///
    /// # Panics
    ///
    /// Panics if `state_id` does not exist or is already terminal:
    /// re-completing a terminal state is a framework bug (§4.2.3, §7).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    #[allow(
        clippy::panic,
        clippy::panic_in_result_fn,
        reason = "re-completing a terminal node state is an internal invariant violation"
    )]
    pub fn complete_node_state(
        &self,
        state_id: &StateId,
        status: NodeStateStatus,
        output_hash: Option<String>,
        error_json: Option<&serde_json::Value>,
        now: OffsetDateTime,
        started_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        assert!(status != NodeStateStatus::Open, "complete_node_state requires a terminal status");
        let duration_ms = u64::try_from((now - started_at).whole_milliseconds()).unwrap_or(0);
        let error_text = error_json.map(serde_json::to_string).transpose()?;
        let updated = self.conn().execute(
            "UPDATE node_states SET status = ?1, completed_at = ?2, duration_ms = ?3, \
             output_hash = ?4, error_json = ?5 WHERE state_id = ?6 AND status = 'OPEN'",
            params![
                enum_to_str(&status),
                fmt_time(now),
                duration_ms,
                output_hash,
                error_text,
                state_id.as_str(),
            ],
        )?;
        assert!(
            updated == 1,
            "complete_node_state called on unknown or already-terminal state {state_id}"
        );
        Ok(())
    }

    // ========================================================================
    // SECTION: Call / Operation
    // ========================================================================

    /// Allocates the next `call_index` for `state_id`, seeding the
    /// in-memory cache from `MAX(call_index)` on first access so resume
    /// continues a crashed process's sequence (§4.2.2, §8.1 "Call-index
    /// monotonicity").
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn allocate_call_index(&self, state_id: &StateId) -> Result<u32, StoreError> {
        self.allocate_index(&format!("state:{state_id}"), "state_id", state_id.as_str())
    }

    /// Same as [`Self::allocate_call_index`] but for operation-parented
    /// calls.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn allocate_operation_call_index(
        &self,
        operation_id: &OperationId,
    ) -> Result<u32, StoreError> {
        self.allocate_index(
            &format!("operation:{operation_id}"),
            "operation_id",
            operation_id.as_str(),
        )
    }

    fn allocate_index(
        &self,
        cache_key: &str,
        column: &str,
        parent_id: &str,
    ) -> Result<u32, StoreError> {
        let mut cache = self.call_index_cache.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(next) = cache.get_mut(cache_key) {
            let allocated = *next;
            *next += 1;
            return Ok(allocated);
        }
        let seeded: Option<i64> = self.conn().query_row(
            &format!("SELECT MAX(call_index) FROM calls WHERE {column} = ?1"),
            params![parent_id],
            |row| row.get(0),
        )?;
        let next = seeded.map_or(0, |max| u32::try_from(max + 1).unwrap_or(0));
        cache.insert(cache_key.to_owned(), next + 1);
        Ok(next)
    }

    /// Records a call parented by a node state.
    ///
    /// # Panics
    ///
    /// Panics if `call.parent` is not [`CallParent::State`]: calling this
    /// method for an operation-parented call is a caller contract bug, not
    /// a recoverable condition — use [`Self::record_operation_call`]
    /// instead.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if `(state_id, call_index)` is not
    /// unique, or on any other write failure.
    #[allow(
        clippy::panic,
        clippy::panic_in_result_fn,
        reason = "wrong-parent-kind call site is an internal wiring bug"
    )]
    pub fn record_call(&self, call: &Call) -> Result<(), StoreError> {
        let CallParent::State(ref state_id) = call.parent else {
            panic!("record_call requires a state-parented Call, got {:?}", call.parent);
        };
        self.insert_call(call, Some(state_id.as_str()), None)
    }

    /// Records a call parented by a source/sink operation.
    ///
    /// # Panics
    ///
    /// Panics if `call.parent` is not [`CallParent::Operation`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if `(operation_id, call_index)` is
    /// not unique, or on any other write failure.
    #[allow(
        clippy::panic,
        clippy::panic_in_result_fn,
        reason = "wrong-parent-kind call site is an internal wiring bug"
    )]
    pub fn record_operation_call(&self, call: &Call) -> Result<(), StoreError> {
        let CallParent::Operation(ref operation_id) = call.parent else {
            panic!("record_operation_call requires an operation-parented Call, got {:?}", call.parent);
        };
        self.insert_call(call, None, Some(operation_id.as_str()))
    }

    fn insert_call(
        &self,
        call: &Call,
        state_id: Option<&str>,
        operation_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let error_text = call.error_json.as_ref().map(serde_json::to_string).transpose()?;
        self.conn().execute(
            "INSERT INTO calls (call_id, state_id, operation_id, call_index, call_type, status, \
             request_hash, request_ref, response_hash, response_ref, error_json, latency_ms, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                call.call_id.as_str(),
                state_id,
                operation_id,
                call.call_index,
                enum_to_str(&call.call_type),
                enum_to_str(&call.status),
                call.request_hash,
                call.request_ref,
                call.response_hash,
                call.response_ref,
                error_text,
                call.latency_ms,
                fmt_time(call.created_at),
            ],
        )?;
        Ok(())
    }

    /// Opens a source-load or sink-write operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    pub fn begin_operation(
        &self,
        operation_id: OperationId,
        run_id: RunId,
        node_id: NodeId,
        operation_type: OperationType,
        now: OffsetDateTime,
    ) -> Result<Operation, StoreError> {
        let operation = Operation {
            operation_id,
            run_id,
            node_id,
            operation_type,
            started_at: now,
            completed_at: None,
            status: NodeStateStatus::Open,
            input_data_ref: None,
            input_data_hash: None,
            output_data_ref: None,
            output_data_hash: None,
            error_message: None,
            duration_ms: None,
        };
        self.conn().execute(
            "INSERT INTO operations (operation_id, run_id, node_id, operation_type, started_at, \
             status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                operation.operation_id.as_str(),
                operation.run_id.as_str(),
                operation.node_id.as_str(),
                enum_to_str(&operation.operation_type),
                fmt_time(operation.started_at),
                enum_to_str(&operation.status),
            ],
        )?;
        Ok(operation)
    }

    /// Completes an operation with a terminal status.
    ///
    /// # Panics
    ///
    /// Panics if `operation_id` does not exist or is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    #[allow(
        clippy::panic,
        clippy::panic_in_result_fn,
        reason = "re-completing a terminal operation is an internal invariant violation"
    )]
    #[allow(clippy::too_many_arguments, reason = "mirrors the operation-completion contract")]
    pub fn complete_operation(
        &self,
        operation_id: &OperationId,
        status: NodeStateStatus,
        output_data_hash: Option<String>,
        error_message: Option<String>,
        now: OffsetDateTime,
        started_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        assert!(status != NodeStateStatus::Open, "complete_operation requires a terminal status");
        let duration_ms = u64::try_from((now - started_at).whole_milliseconds()).unwrap_or(0);
        let updated = self.conn().execute(
            "UPDATE operations SET status = ?1, completed_at = ?2, duration_ms = ?3, \
             output_data_hash = ?4, error_message = ?5 WHERE operation_id = ?6 AND status = 'OPEN'",
            params![
                enum_to_str(&status),
                fmt_time(now),
                duration_ms,
                output_data_hash,
                error_message,
                operation_id.as_str(),
            ],
        )?;
        assert!(
            updated == 1,
            "complete_operation called on unknown or already-terminal operation {operation_id}"
        );
        Ok(())
    }

    // ========================================================================
    // SECTION: RoutingEvent
    // ========================================================================

    /// Records one edge crossing. Callers assign a shared
    /// `routing_group_id` across every edge chosen at a single decision
    /// point (§3.2).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Hashing`] if `reason` fails to canonicalize,
    /// or [`StoreError::Sqlite`] on a write failure.
    pub fn record_routing_event(
        &self,
        event_id: String,
        state_id: &StateId,
        edge_id: &EdgeId,
        routing_group_id: String,
        ordinal: u32,
        mode: RoutingMode,
        reason: Option<&serde_json::Value>,
        now: OffsetDateTime,
    ) -> Result<RoutingEvent, StoreError> {
        let reason_hash = reason
            .map(|value| hash_canonical_json(HashAlgorithm::Sha256, value))
            .transpose()?
            .map(|digest| digest.value);
        let event = RoutingEvent {
            event_id,
            state_id: state_id.clone(),
            edge_id: edge_id.clone(),
            routing_group_id,
            ordinal,
            mode,
            created_at: now,
            reason_hash,
            reason_ref: None,
        };
        self.conn().execute(
            "INSERT INTO routing_events (event_id, state_id, edge_id, routing_group_id, \
             ordinal, mode, created_at, reason_hash, reason_ref) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
            params![
                event.event_id,
                event.state_id.as_str(),
                event.edge_id.as_str(),
                event.routing_group_id,
                event.ordinal,
                enum_to_str(&event.mode),
                fmt_time(event.created_at),
                event.reason_hash,
            ],
        )?;
        Ok(event)
    }

    // ========================================================================
    // SECTION: Batch
    // ========================================================================

    /// Opens a new batch for an aggregation node.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    pub fn create_batch(
        &self,
        batch_id: BatchId,
        run_id: &RunId,
        node_id: &NodeId,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO batches (batch_id, run_id, node_id, created_at, flushed_at) VALUES \
             (?1, ?2, ?3, ?4, NULL)",
            params![batch_id.as_str(), run_id.as_str(), node_id.as_str(), fmt_time(now)],
        )?;
        Ok(())
    }

    /// Appends `token_id` as a member of `batch_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    pub fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
            params![batch_id.as_str(), token_id.as_str(), ordinal],
        )?;
        Ok(())
    }

    /// Marks `batch_id` flushed and records its output tokens.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    pub fn flush_batch(
        &self,
        batch_id: &BatchId,
        outputs: &[TokenId],
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE batches SET flushed_at = ?1 WHERE batch_id = ?2",
            params![fmt_time(now), batch_id.as_str()],
        )?;
        for (ordinal, token_id) in outputs.iter().enumerate() {
            tx.execute(
                "INSERT INTO batch_outputs (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
                params![batch_id.as_str(), token_id.as_str(), ordinal],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // SECTION: TokenOutcome
    // ========================================================================

    /// Records a token outcome, enforcing exactly-one-terminal-outcome
    /// via the database's partial unique index (§4.2.3, §8.1).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateTerminalOutcome`] if `token_id`
    /// already has a terminal outcome, [`StoreError::Hashing`] if
    /// `context` fails to canonicalize, or [`StoreError::Sqlite`] on any
    /// other write failure.
    pub fn record_token_outcome(
        &self,
        outcome_id: OutcomeId,
        run_id: &RunId,
        token_id: &TokenId,
        detail: OutcomeDetail,
        now: OffsetDateTime,
        context: Option<&serde_json::Value>,
    ) -> Result<TokenOutcome, StoreError> {
        let conn = self.conn();
        self.write_outcome(&conn, outcome_id, run_id, token_id, detail, now, context)
    }

    fn write_outcome(
        &self,
        conn: &Connection,
        outcome_id: OutcomeId,
        run_id: &RunId,
        token_id: &TokenId,
        detail: OutcomeDetail,
        now: OffsetDateTime,
        context: Option<&serde_json::Value>,
    ) -> Result<TokenOutcome, StoreError> {
        let context_text = context.map(serde_json::to_string).transpose()?;
        let outcome = TokenOutcome {
            outcome_id,
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            detail,
            recorded_at: now,
            context_json: context.cloned(),
        };
        let (sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, error_hash) =
            match &outcome.detail {
                OutcomeDetail::Completed { sink_name } | OutcomeDetail::Routed { sink_name } => {
                    (Some(sink_name.clone()), None, None, None, None, None)
                }
                OutcomeDetail::Forked { fork_group_id } => {
                    (None, None, Some(fork_group_id.clone()), None, None, None)
                }
                OutcomeDetail::Failed { error_hash } | OutcomeDetail::Quarantined { error_hash } => {
                    (None, None, None, None, None, Some(error_hash.clone()))
                }
                OutcomeDetail::ConsumedInBatch { batch_id }
                | OutcomeDetail::Buffered { batch_id } => {
                    (None, Some(batch_id.clone()), None, None, None, None)
                }
                OutcomeDetail::Coalesced { join_group_id } => {
                    (None, None, None, Some(join_group_id.clone()), None, None)
                }
                OutcomeDetail::Expanded { expand_group_id } => {
                    (None, None, None, None, Some(expand_group_id.clone()), None)
                }
            };
        let is_terminal = i64::from(outcome.is_terminal());
        let result = conn.execute(
            "INSERT INTO token_outcomes (outcome_id, run_id, token_id, outcome, is_terminal, \
             recorded_at, sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, \
             error_hash, context_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13)",
            params![
                outcome.outcome_id.as_str(),
                outcome.run_id.as_str(),
                outcome.token_id.as_str(),
                enum_to_str(&outcome.detail.outcome()),
                is_terminal,
                fmt_time(outcome.recorded_at),
                sink_name,
                batch_id.map(|id: BatchId| id.to_string()),
                fork_group_id,
                join_group_id,
                expand_group_id,
                error_hash,
                context_text,
            ],
        );
        match result {
            Ok(_) => Ok(outcome),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateTerminalOutcome(token_id.clone()))
            }
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    /// Returns the terminal outcome for `token_id`, if one has been
    /// recorded.
    ///
    /// # Panics
    ///
    /// Panics if a stored `outcome` column fails to hydrate, or if a row
    /// marked terminal is missing its required side field (§8.1 "Audit
    /// readability").
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn get_token_outcome(&self, token_id: &TokenId) -> Result<Option<TokenOutcome>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT outcome_id, run_id, outcome, recorded_at, sink_name, batch_id, \
             fork_group_id, join_group_id, expand_group_id, error_hash, context_json FROM \
             token_outcomes WHERE token_id = ?1 AND is_terminal = 1",
        )?;
        let row = stmt
            .query_row(params![token_id.as_str()], |row| Self::hydrate_outcome_row(row, token_id))
            .optional()?;
        Ok(row)
    }

    /// Returns every outcome ever recorded for the tokens descending from
    /// `row_id`, in recording order (§4.2.2, used by recovery to find the
    /// set of terminal events a row produced before a crash).
    ///
    /// # Panics
    ///
    /// Panics on the same invalid-data conditions as
    /// [`Self::get_token_outcome`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn get_token_outcomes_for_row(
        &self,
        row_id: &RowId,
    ) -> Result<Vec<TokenOutcome>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT o.outcome_id, o.run_id, o.outcome, o.recorded_at, o.sink_name, o.batch_id, \
             o.fork_group_id, o.join_group_id, o.expand_group_id, o.error_hash, o.context_json, \
             o.token_id FROM token_outcomes o JOIN tokens t ON t.token_id = o.token_id WHERE \
             t.row_id = ?1 ORDER BY o.recorded_at ASC",
        )?;
        let rows = stmt
            .query_map(params![row_id.as_str()], |row| {
                let token_id: String = row.get(11)?;
                Self::hydrate_outcome_row(row, &TokenId::new(token_id))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[allow(
        clippy::panic,
        clippy::panic_in_result_fn,
        reason = "bad persisted outcome data is a framework/audit-integrity bug, never user-facing"
    )]
    fn hydrate_outcome_row(
        row: &rusqlite::Row<'_>,
        token_id: &TokenId,
    ) -> rusqlite::Result<TokenOutcome> {
        let outcome_id: String = row.get(0)?;
        let run_id: String = row.get(1)?;
        let outcome_str: String = row.get(2)?;
        let recorded_at: String = row.get(3)?;
        let sink_name: Option<String> = row.get(4)?;
        let batch_id: Option<String> = row.get(5)?;
        let fork_group_id: Option<String> = row.get(6)?;
        let join_group_id: Option<String> = row.get(7)?;
        let expand_group_id: Option<String> = row.get(8)?;
        let error_hash: Option<String> = row.get(9)?;
        let context_json: Option<String> = row.get(10)?;

        let outcome: Outcome = enum_from_str(&outcome_str);
        let detail = match outcome {
            Outcome::Completed => OutcomeDetail::Completed {
                sink_name: sink_name
                    .unwrap_or_else(|| panic!("COMPLETED outcome for {token_id} missing sink_name")),
            },
            Outcome::Routed => OutcomeDetail::Routed {
                sink_name: sink_name
                    .unwrap_or_else(|| panic!("ROUTED outcome for {token_id} missing sink_name")),
            },
            Outcome::Forked => OutcomeDetail::Forked {
                fork_group_id: fork_group_id.unwrap_or_else(|| {
                    panic!("FORKED outcome for {token_id} missing fork_group_id")
                }),
            },
            Outcome::Failed => OutcomeDetail::Failed {
                error_hash: error_hash
                    .unwrap_or_else(|| panic!("FAILED outcome for {token_id} missing error_hash")),
            },
            Outcome::Quarantined => OutcomeDetail::Quarantined {
                error_hash: error_hash.unwrap_or_else(|| {
                    panic!("QUARANTINED outcome for {token_id} missing error_hash")
                }),
            },
            Outcome::ConsumedInBatch => OutcomeDetail::ConsumedInBatch {
                batch_id: BatchId::new(batch_id.unwrap_or_else(|| {
                    panic!("CONSUMED_IN_BATCH outcome for {token_id} missing batch_id")
                })),
            },
            Outcome::Coalesced => OutcomeDetail::Coalesced {
                join_group_id: join_group_id.unwrap_or_else(|| {
                    panic!("COALESCED outcome for {token_id} missing join_group_id")
                }),
            },
            Outcome::Expanded => OutcomeDetail::Expanded {
                expand_group_id: expand_group_id.unwrap_or_else(|| {
                    panic!("EXPANDED outcome for {token_id} missing expand_group_id")
                }),
            },
            Outcome::Buffered => OutcomeDetail::Buffered {
                batch_id: BatchId::new(batch_id.unwrap_or_else(|| {
                    panic!("BUFFERED outcome for {token_id} missing batch_id")
                })),
            },
        };
        Ok(TokenOutcome {
            outcome_id: OutcomeId::new(outcome_id),
            run_id: RunId::new(run_id),
            token_id: token_id.clone(),
            detail,
            recorded_at: parse_time(&recorded_at),
            context_json: context_json
                .map(|text| serde_json::from_str(&text))
                .transpose()
                .unwrap_or_else(|err| panic!("corrupt context_json for {token_id}: {err}")),
        })
    }

    // ========================================================================
    // SECTION: Artifact / ValidationError
    // ========================================================================

    /// Records a sink-produced artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    pub fn record_artifact(
        &self,
        artifact_id: ArtifactId,
        run_id: &RunId,
        produced_by_state_id: Option<&StateId>,
        sink_node_id: &NodeId,
        artifact_type: &str,
        path_or_uri: &str,
        content_hash: &str,
        size_bytes: u64,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO artifacts (artifact_id, run_id, produced_by_state_id, sink_node_id, \
             artifact_type, path_or_uri, content_hash, size_bytes, created_at) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                artifact_id.as_str(),
                run_id.as_str(),
                produced_by_state_id.map(elspeth_core::identifiers::StateId::as_str),
                sink_node_id.as_str(),
                artifact_type,
                path_or_uri,
                content_hash,
                #[allow(
                    clippy::cast_possible_wrap,
                    reason = "artifact sizes stay far below i64::MAX"
                )]
                {
                    size_bytes as i64
                },
                fmt_time(now),
            ],
        )?;
        Ok(())
    }

    /// Records a schema contract violation that quarantined a row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    #[allow(clippy::too_many_arguments, reason = "mirrors the validation_errors table in full")]
    pub fn record_validation_error(
        &self,
        error_id: String,
        run_id: &RunId,
        node_id: Option<&NodeId>,
        row_data: &serde_json::Value,
        error: &str,
        schema_mode: elspeth_core::model::SchemaMode,
        destination: &str,
        violation_type: Option<&str>,
        field_detail: Option<ValidationFieldDetail<'_>>,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let (normalized_field_name, original_field_name, expected_type, actual_type) = field_detail
            .map_or((None, None, None, None), |detail| {
                (
                    Some(detail.normalized_field_name),
                    Some(detail.original_field_name),
                    Some(detail.expected_type),
                    Some(detail.actual_type),
                )
            });
        self.conn().execute(
            "INSERT INTO validation_errors (error_id, run_id, node_id, row_data_json, error, \
             schema_mode, destination, violation_type, normalized_field_name, \
             original_field_name, expected_type, actual_type, created_at) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                error_id,
                run_id.as_str(),
                node_id.map(NodeId::as_str),
                serde_json::to_string(row_data)?,
                error,
                enum_to_str(&schema_mode),
                destination,
                violation_type,
                normalized_field_name,
                original_field_name,
                expected_type,
                actual_type,
                fmt_time(now),
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // SECTION: Checkpoint
    // ========================================================================

    /// Persists a checkpoint. Callers allocate a monotone
    /// `sequence_number` per run; the latest by `sequence_number` wins
    /// (§3.3).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a write failure.
    #[allow(clippy::too_many_arguments, reason = "mirrors the checkpoints table in full")]
    pub fn create_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        sequence_number: u64,
        aggregation_state: Option<&serde_json::Value>,
        upstream_topology_hash: &str,
        checkpoint_node_config_hash: &str,
        format_version: u32,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id, \
             sequence_number, aggregation_state_json, upstream_topology_hash, \
             checkpoint_node_config_hash, created_at, format_version) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                checkpoint_id.as_str(),
                run_id.as_str(),
                token_id.as_str(),
                node_id.as_str(),
                sequence_number,
                aggregation_state.map(serde_json::to_string).transpose()?,
                upstream_topology_hash,
                checkpoint_node_config_hash,
                fmt_time(now),
                format_version,
            ],
        )?;
        Ok(())
    }

    /// Returns the most recent checkpoint for `run_id` by
    /// `sequence_number`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<crate::checkpoint::StoredCheckpoint>, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT checkpoint_id, token_id, node_id, sequence_number, aggregation_state_json, \
             upstream_topology_hash, checkpoint_node_config_hash, format_version FROM checkpoints \
             WHERE run_id = ?1 ORDER BY sequence_number DESC LIMIT 1",
            params![run_id.as_str()],
            crate::checkpoint::StoredCheckpoint::from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Returns the highest `row_index` among rows whose tokens recorded at
    /// least one terminal outcome, used by recovery to compute the
    /// unprocessed set by `row_index` rather than `sequence_number`
    /// (§4.9.2, §8.1 "Unprocessed-rows correctness under forks").
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn max_terminal_row_index(&self, run_id: &RunId) -> Result<Option<u64>, StoreError> {
        let value: Option<i64> = self.conn().query_row(
            "SELECT MAX(r.row_index) FROM rows r JOIN tokens t ON t.row_id = r.row_id JOIN \
             token_outcomes o ON o.token_id = t.token_id WHERE r.run_id = ?1 AND o.is_terminal = 1",
            params![run_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(value.map(|value| u64::try_from(value).unwrap_or(0)))
    }

    /// Returns `row_id`s for `run_id` with `row_index > checkpoint_row_index`,
    /// in ascending `row_index` order (§4.9.2, §8.1: forks can produce
    /// multiple terminal events per row, so recovery must key off
    /// `row_index`, never `sequence_number`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on a read failure.
    pub fn unprocessed_row_ids(
        &self,
        run_id: &RunId,
        checkpoint_row_index: u64,
    ) -> Result<Vec<RowId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT row_id FROM rows WHERE run_id = ?1 AND row_index > ?2 ORDER BY row_index ASC",
        )?;
        #[allow(clippy::cast_possible_wrap, reason = "row indices stay far below i64::MAX")]
        let rows = stmt
            .query_map(params![run_id.as_str(), checkpoint_row_index as i64], |row| {
                row.get::<_, String>(0)
            })?
            .map(|value| value.map(RowId::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

#[allow(
    clippy::panic,
    reason = "an OffsetDateTime built from this crate's own clock reads always format as RFC3339"
)]
fn fmt_time(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|err| panic!("a valid OffsetDateTime always formats as RFC3339: {err}"))
}

#[allow(
    clippy::panic,
    reason = "a timestamp that fails to parse is corrupt audit data, a framework bug"
)]
fn parse_time(value: &str) -> OffsetDateTime {
    OffsetDateTime::parse(value, &Rfc3339)
        .unwrap_or_else(|err| panic!("corrupt timestamp in audit store: {value}: {err}"))
}

#[allow(
    clippy::panic,
    reason = "every enum passed here is a unit-variant SCREAMING_SNAKE_CASE enum from \
              elspeth_core::model; failing to serialize to a JSON string is unreachable \
              outside a serde_json regression"
)]
fn enum_to_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(text)) => text,
        other => panic!("enum failed to serialize to a JSON string: {other:?}"),
    }
}

#[allow(
    clippy::panic,
    reason = "an unrecognized enum string in the audit store is corrupt data, a framework bug"
)]
fn enum_from_str<T: DeserializeOwned>(value: &str) -> T {
    serde_json::from_value(serde_json::Value::String(value.to_owned()))
        .unwrap_or_else(|err| panic!("unrecognized enum value in audit store: {value}: {err}"))
}

/// Generates a collision-resistant identifier suffix for internally
/// minted IDs (outcome rows written as a side effect of fork/expand/
/// coalesce, where the caller does not supply one). Not a `UUID`
/// implementation: it borrows process-local entropy (an atomic counter)
/// rather than pulling in a dedicated crate for an internal-only id.
fn uuid_like(prefix: &str) -> String {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let next = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{next:016x}")
}
