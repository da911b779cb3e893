// crates/elspeth-store-sqlite/tests/sqlite_store_unit.rs
// ============================================================================
// Test: Landscape Store Integration
// Description: Exercises LandscapeStore against a real SQLite connection,
//              covering run lifecycle, node/edge registration, the
//              one-terminal-outcome-per-token constraint, fork atomicity,
//              journal mode pragmas, and concurrent access.
// ============================================================================

#![allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]

use std::sync::Arc;
use std::thread;

use serde_json::json;
use time::OffsetDateTime;

use elspeth_core::hashing::CANONICAL_VERSION;
use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::OutcomeId;
use elspeth_core::identifiers::RowId;
use elspeth_core::identifiers::RunId;
use elspeth_core::identifiers::TokenId;
use elspeth_core::model::Determinism;
use elspeth_core::model::Node;
use elspeth_core::model::NodeType;
use elspeth_core::model::OutcomeDetail;
use elspeth_core::model::RunStatus;
use elspeth_store_sqlite::LandscapeStore;
use elspeth_store_sqlite::SqliteStoreConfig;
use elspeth_store_sqlite::SqliteStoreMode;
use elspeth_store_sqlite::SqliteSyncMode;
use elspeth_store_sqlite::StoreError;

fn open_memory_store() -> LandscapeStore {
    LandscapeStore::open(&SqliteStoreConfig::in_memory()).unwrap()
}

fn node(run_id: &RunId, name: &str, node_type: NodeType, now: OffsetDateTime) -> Node {
    Node {
        node_id: NodeId::new(name.to_string()),
        run_id: run_id.clone(),
        plugin_name: format!("{name}-plugin"),
        node_type,
        plugin_version: "1.0.0".to_string(),
        determinism: Determinism::Deterministic,
        config_hash: "deadbeef".to_string(),
        config_json: json!({}),
        registered_at: now,
        sequence_in_pipeline: Some(0),
    }
}

#[test]
fn begin_run_then_get_run_round_trips_every_field() {
    let store = open_memory_store();
    let run_id = RunId::new("run-1");
    let now = OffsetDateTime::now_utc();
    let settings = json!({ "pipeline": "demo" });

    let created = store.begin_run(run_id.clone(), &settings, CANONICAL_VERSION, now).unwrap();
    assert_eq!(created.status, RunStatus::Running);
    assert!(created.completed_at.is_none());

    let fetched = store.get_run(&run_id).unwrap().expect("run must exist");
    assert_eq!(fetched.run_id, run_id);
    assert_eq!(fetched.config_hash, created.config_hash);
    assert_eq!(fetched.canonical_version, CANONICAL_VERSION);
    assert_eq!(fetched.status, RunStatus::Running);
    assert!(fetched.completed_at.is_none());
}

#[test]
fn complete_run_transitions_status_and_stamps_completed_at() {
    let store = open_memory_store();
    let run_id = RunId::new("run-2");
    let now = OffsetDateTime::now_utc();

    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();
    store.complete_run(&run_id, RunStatus::Completed, None, now).unwrap();

    let fetched = store.get_run(&run_id).unwrap().expect("run must exist");
    assert_eq!(fetched.status, RunStatus::Completed);
    assert!(fetched.completed_at.is_some());
}

#[test]
#[should_panic(expected = "complete_run called on unknown run_id")]
fn complete_run_on_unknown_run_id_panics() {
    let store = open_memory_store();
    let now = OffsetDateTime::now_utc();
    let _ = store.complete_run(&RunId::new("never-begun"), RunStatus::Completed, None, now);
}

#[test]
fn get_run_returns_none_for_unknown_run() {
    let store = open_memory_store();
    assert!(store.get_run(&RunId::new("missing")).unwrap().is_none());
}

#[test]
fn register_node_is_idempotent_for_identical_metadata() {
    let store = open_memory_store();
    let run_id = RunId::new("run-3");
    let now = OffsetDateTime::now_utc();
    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();

    let n = node(&run_id, "source", NodeType::Source, now);
    store.register_node(&n).unwrap();
    store.register_node(&n).unwrap();
}

#[test]
fn register_node_rejects_conflicting_redefinition() {
    let store = open_memory_store();
    let run_id = RunId::new("run-4");
    let now = OffsetDateTime::now_utc();
    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();

    let n = node(&run_id, "source", NodeType::Source, now);
    store.register_node(&n).unwrap();

    let mut conflicting = n.clone();
    conflicting.plugin_version = "2.0.0".to_string();
    let err = store.register_node(&conflicting).unwrap_err();
    assert!(matches!(err, StoreError::NodeConflict { .. }));
}

#[test]
fn token_outcomes_enforce_exactly_one_terminal_outcome() {
    let store = open_memory_store();
    let run_id = RunId::new("run-5");
    let now = OffsetDateTime::now_utc();
    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();

    let source = node(&run_id, "source", NodeType::Source, now);
    store.register_node(&source).unwrap();

    let row = store
        .create_row(RowId::new("row-1"), &run_id, &source.node_id, 0, &json!({ "id": 1 }), now)
        .unwrap();
    let token = store.create_token(TokenId::new("token-1"), &row.row_id, now).unwrap();

    store
        .record_token_outcome(
            OutcomeId::new("outcome-1"),
            &run_id,
            &token.token_id,
            OutcomeDetail::Completed { sink_name: "out".to_string() },
            now,
            None,
        )
        .unwrap();

    let second = store.record_token_outcome(
        OutcomeId::new("outcome-2"),
        &run_id,
        &token.token_id,
        OutcomeDetail::Completed { sink_name: "out".to_string() },
        now,
        None,
    );
    assert!(matches!(second, Err(StoreError::DuplicateTerminalOutcome(ref id)) if *id == token.token_id));

    let recorded = store.get_token_outcome(&token.token_id).unwrap().expect("outcome must exist");
    assert!(matches!(recorded.detail, OutcomeDetail::Completed { .. }));
}

#[test]
fn fork_token_atomically_records_children_and_parent_outcome() {
    let store = open_memory_store();
    let run_id = RunId::new("run-6");
    let now = OffsetDateTime::now_utc();
    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();

    let source = node(&run_id, "source", NodeType::Source, now);
    store.register_node(&source).unwrap();

    let row = store
        .create_row(RowId::new("row-2"), &run_id, &source.node_id, 0, &json!({ "id": 2 }), now)
        .unwrap();
    let parent = store.create_token(TokenId::new("token-parent"), &row.row_id, now).unwrap();

    let mut next = 0usize;
    let children = store
        .fork_token(
            &run_id,
            &parent,
            &json!({ "id": 2 }),
            &["a".to_string(), "b".to_string()],
            "fork-group-1".to_string(),
            |_index| {
                next += 1;
                TokenId::new(format!("token-child-{next}"))
            },
            None,
            now,
        )
        .unwrap();

    assert_eq!(children.len(), 2);
    assert!(children.iter().any(|(token, _)| token.branch_name.as_deref() == Some("a")));
    assert!(children.iter().any(|(token, _)| token.branch_name.as_deref() == Some("b")));
    assert!(children.iter().all(|(token, _)| token.fork_group_id.as_deref() == Some("fork-group-1")));

    let parent_outcome = store.get_token_outcome(&parent.token_id).unwrap().expect("must be recorded");
    assert!(matches!(
        parent_outcome.detail,
        OutcomeDetail::Forked { ref fork_group_id } if fork_group_id == "fork-group-1"
    ));

    // A fork outcome is not terminal, so the parent token can still take a
    // later terminal outcome without tripping the one-terminal constraint.
    store
        .record_token_outcome(
            OutcomeId::new("outcome-parent-terminal"),
            &run_id,
            &parent.token_id,
            OutcomeDetail::Failed { error_hash: "irrelevant".to_string() },
            now,
            None,
        )
        .unwrap();
}

#[test]
fn fork_token_rejects_empty_branch_list() {
    let store = open_memory_store();
    let run_id = RunId::new("run-7");
    let now = OffsetDateTime::now_utc();
    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();

    let source = node(&run_id, "source", NodeType::Source, now);
    store.register_node(&source).unwrap();
    let row = store
        .create_row(RowId::new("row-3"), &run_id, &source.node_id, 0, &json!({}), now)
        .unwrap();
    let parent = store.create_token(TokenId::new("token-3"), &row.row_id, now).unwrap();

    let err = store.fork_token(
        &run_id,
        &parent,
        &json!({}),
        &[],
        "fork-empty".to_string(),
        |index| TokenId::new(format!("child-{index}")),
        None,
        now,
    );
    assert!(matches!(err, Err(StoreError::Token(_))));
}

#[test]
fn sqlite_store_sets_wal_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wal.sqlite");
    let store = LandscapeStore::open(&SqliteStoreConfig::file(&path)).unwrap();
    let _ = store.get_run(&RunId::new("unused")).unwrap();
    assert!(path.exists());
}

#[test]
fn sqlite_store_sets_delete_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("delete.sqlite");
    let mut config = SqliteStoreConfig::file(&path);
    config.journal_mode = SqliteStoreMode::Delete;
    config.sync_mode = SqliteSyncMode::Normal;
    let store = LandscapeStore::open(&config).unwrap();
    let _ = store.get_run(&RunId::new("unused")).unwrap();
    assert!(path.exists());
}

#[test]
fn opening_a_store_stamped_with_a_foreign_schema_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sqlite");
    {
        let store = LandscapeStore::open(&SqliteStoreConfig::file(&path)).unwrap();
        drop(store);
    }

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute("UPDATE schema_meta SET version = 9999", []).unwrap();
    drop(conn);

    let err = LandscapeStore::open(&SqliteStoreConfig::file(&path)).unwrap_err();
    assert!(matches!(
        err,
        StoreError::SchemaVersionMismatch { found: 9999, .. }
    ));
}

#[test]
fn sqlite_store_supports_concurrent_run_creation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concurrent.sqlite");
    let store = Arc::new(LandscapeStore::open(&SqliteStoreConfig::file(&path)).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let run_id = RunId::new(format!("concurrent-run-{index}"));
                let now = OffsetDateTime::now_utc();
                store.begin_run(run_id, &json!({ "index": index }), CANONICAL_VERSION, now).unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for index in 0..8 {
        let run_id = RunId::new(format!("concurrent-run-{index}"));
        assert!(store.get_run(&run_id).unwrap().is_some());
    }
}

#[test]
fn max_terminal_row_index_tracks_only_rows_with_terminal_outcomes() {
    let store = open_memory_store();
    let run_id = RunId::new("run-8");
    let now = OffsetDateTime::now_utc();
    store.begin_run(run_id.clone(), &json!({}), CANONICAL_VERSION, now).unwrap();

    let source = node(&run_id, "source", NodeType::Source, now);
    store.register_node(&source).unwrap();

    assert_eq!(store.max_terminal_row_index(&run_id).unwrap(), None);

    for index in 0..3u64 {
        let row = store
            .create_row(
                RowId::new(format!("row-term-{index}")),
                &run_id,
                &source.node_id,
                index,
                &json!({ "id": index }),
                now,
            )
            .unwrap();
        let token =
            store.create_token(TokenId::new(format!("token-term-{index}")), &row.row_id, now).unwrap();
        store
            .record_token_outcome(
                OutcomeId::new(format!("outcome-term-{index}")),
                &run_id,
                &token.token_id,
                OutcomeDetail::Completed { sink_name: "out".to_string() },
                now,
                None,
            )
            .unwrap();
    }

    assert_eq!(store.max_terminal_row_index(&run_id).unwrap(), Some(2));
}
