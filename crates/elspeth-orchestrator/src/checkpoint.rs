// crates/elspeth-orchestrator/src/checkpoint.rs
// ============================================================================
// Module: ELSPETH Checkpoint & Recovery (C9)
// Description: Computes topology/config hashes for checkpoint binding,
//              decides whether a run can resume, and computes the
//              unprocessed-row set (§4.9).
// ============================================================================

use serde::Serialize;
use thiserror::Error;

use elspeth_core::hashing::HashAlgorithm;
use elspeth_core::hashing::hash_canonical_json;
use elspeth_core::identifiers::RowId;
use elspeth_core::identifiers::RunId;
use elspeth_core::model::RunStatus;
use elspeth_graph::ExecutionGraph;
use elspeth_store_sqlite::LandscapeStore;
use elspeth_store_sqlite::StoreError;
use elspeth_store_sqlite::StoredCheckpoint;

use crate::config::CURRENT_CHECKPOINT_FORMAT_VERSION;

/// Why a checkpoint cannot be used to resume a run (§4.9.3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IncompatibleCheckpointError {
    /// The run has no persisted checkpoint to resume from.
    #[error("run {0} has no checkpoint")]
    NoCheckpoint(RunId),
    /// The run is not in a resumable status (only a FAILED or
    /// CANCELLED run may resume; COMPLETED and RUNNING are rejected).
    #[error("run {run_id} has status {status:?}, which cannot resume")]
    NotResumable {
        /// The run.
        run_id: RunId,
        /// Its current status.
        status: RunStatus,
    },
    /// The run does not exist at all.
    #[error("run {0} was not found")]
    RunNotFound(RunId),
    /// The checkpoint's `format_version` is missing (`NULL`), which is
    /// always a rejection (§4.9.3: "missing/NULL format_version... ->
    /// IncompatibleCheckpointError").
    #[error("checkpoint for run {0} has no format_version")]
    MissingFormatVersion(RunId),
    /// The checkpoint's `format_version` does not exactly match the
    /// current build's version. Both older and newer versions are
    /// rejected (§4.9.2: "neither older nor newer").
    #[error(
        "checkpoint format_version {found} does not match the version this build writes \
         ({expected})"
    )]
    FormatVersionMismatch {
        /// The version recorded on the checkpoint.
        found: u32,
        /// The version this build requires.
        expected: u32,
    },
    /// The checkpoint's `upstream_topology_hash` does not match the
    /// graph about to be executed.
    #[error("checkpoint topology hash {stored} does not match the current graph's {current}")]
    TopologyMismatch {
        /// Hash recorded on the checkpoint.
        stored: String,
        /// Hash of the graph about to resume.
        current: String,
    },
    /// The checkpoint node's `config_hash` does not match the current
    /// configuration for that node.
    #[error(
        "checkpoint node config hash {stored} does not match the current configuration's {current}"
    )]
    NodeConfigMismatch {
        /// Hash recorded on the checkpoint.
        stored: String,
        /// Hash of the node's current configuration.
        current: String,
    },
}

/// A canonical, hashable view of a graph's structure: nodes (by id,
/// type, and plugin identity) and edges (by endpoints and label),
/// independent of registration timestamps or config payloads.
/// Feeds `upstream_topology_hash` (§4.9.1).
#[derive(Debug, Serialize)]
struct TopologySnapshot {
    nodes: Vec<TopologyNode>,
    edges: Vec<TopologyEdge>,
}

#[derive(Debug, Serialize)]
struct TopologyNode {
    node_id: String,
    node_type: String,
    plugin_name: String,
}

#[derive(Debug, Serialize)]
struct TopologyEdge {
    from_node_id: String,
    to_node_id: String,
    label: String,
}

/// Computes the canonical hash of `graph`'s structure, used both when
/// persisting a checkpoint and when validating one for resume
/// (§4.9.1: "`upstream_topology_hash`: canonical hash of the complete
/// graph structure").
///
/// # Errors
///
/// Returns [`elspeth_core::hashing::HashError`] if the snapshot cannot
/// be canonicalized (practically unreachable: every field is a plain
/// string).
pub fn topology_hash(graph: &ExecutionGraph) -> Result<String, elspeth_core::hashing::HashError> {
    let mut nodes = Vec::new();
    // ExecutionGraph doesn't expose a node iterator directly; route
    // through get_sinks/get_source plus edge endpoints to name every
    // node deterministically, then look each one up for its type.
    let mut node_ids: std::collections::BTreeSet<elspeth_core::identifiers::NodeId> =
        std::collections::BTreeSet::new();
    if let Some(source) = graph.get_source() {
        node_ids.insert(source.clone());
    }
    for sink in graph.get_sinks() {
        node_ids.insert(sink.clone());
    }
    for edge in graph.get_edges() {
        node_ids.insert(edge.from_node_id.clone());
        node_ids.insert(edge.to_node_id.clone());
    }
    for node_id in node_ids {
        let node = graph.get_node_info(&node_id).map_err(|err| {
            elspeth_core::hashing::HashError::Canonicalization(err.to_string())
        })?;
        nodes.push(TopologyNode {
            node_id: node.node_id.as_str().to_string(),
            node_type: format!("{:?}", node.node_type),
            plugin_name: node.plugin_name.clone(),
        });
    }

    let edges = graph
        .get_edges()
        .iter()
        .map(|edge| TopologyEdge {
            from_node_id: edge.from_node_id.as_str().to_string(),
            to_node_id: edge.to_node_id.as_str().to_string(),
            label: edge.label.clone(),
        })
        .collect();

    let snapshot = TopologySnapshot { nodes, edges };
    Ok(hash_canonical_json(HashAlgorithm::Sha256, &snapshot)?.as_str().to_string())
}

/// Decision on whether a run may resume from its latest checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    /// The run may resume from this checkpoint.
    Yes {
        /// The checkpoint to resume from.
        checkpoint: StoredCheckpoint,
    },
    /// The run may not resume, for the given reason.
    No(IncompatibleCheckpointError),
}

/// Consults the recorder and an already-validated graph to decide
/// whether `run_id` can resume (§4.9.2).
///
/// # Errors
///
/// Returns [`StoreError`] if the recorder cannot be read.
pub fn can_resume(
    store: &LandscapeStore,
    run_id: &RunId,
    graph: &ExecutionGraph,
    current_node_config_hash: impl Fn(&elspeth_core::identifiers::NodeId) -> Option<String>,
) -> Result<ResumeDecision, StoreError> {
    let Some(run) = store.get_run(run_id)? else {
        return Ok(ResumeDecision::No(IncompatibleCheckpointError::RunNotFound(run_id.clone())));
    };
    if matches!(run.status, RunStatus::Completed | RunStatus::Running) {
        return Ok(ResumeDecision::No(IncompatibleCheckpointError::NotResumable {
            run_id: run_id.clone(),
            status: run.status,
        }));
    }

    let Some(checkpoint) = store.latest_checkpoint(run_id)? else {
        return Ok(ResumeDecision::No(IncompatibleCheckpointError::NoCheckpoint(run_id.clone())));
    };

    if checkpoint.format_version != CURRENT_CHECKPOINT_FORMAT_VERSION {
        return Ok(ResumeDecision::No(IncompatibleCheckpointError::FormatVersionMismatch {
            found: checkpoint.format_version,
            expected: CURRENT_CHECKPOINT_FORMAT_VERSION,
        }));
    }

    let current_topology_hash = match topology_hash(graph) {
        Ok(hash) => hash,
        Err(err) => {
            return Ok(ResumeDecision::No(IncompatibleCheckpointError::TopologyMismatch {
                stored: checkpoint.upstream_topology_hash.clone(),
                current: format!("unhashable: {err}"),
            }));
        }
    };
    if checkpoint.upstream_topology_hash != current_topology_hash {
        return Ok(ResumeDecision::No(IncompatibleCheckpointError::TopologyMismatch {
            stored: checkpoint.upstream_topology_hash.clone(),
            current: current_topology_hash,
        }));
    }

    if let Some(current_config_hash) = current_node_config_hash(&checkpoint.node_id)
        && current_config_hash != checkpoint.checkpoint_node_config_hash
    {
        return Ok(ResumeDecision::No(IncompatibleCheckpointError::NodeConfigMismatch {
            stored: checkpoint.checkpoint_node_config_hash.clone(),
            current: current_config_hash,
        }));
    }

    Ok(ResumeDecision::Yes { checkpoint })
}

/// Returns the row ids a resumed run still needs to process, computed
/// by `row_index` rather than `sequence_number` (§4.9.2, §8.1
/// "Unprocessed-rows correctness under forks": a forked row can
/// produce several terminal token outcomes, so only `row_index`
/// monotonicity is a safe recovery boundary).
///
/// # Errors
///
/// Returns [`StoreError`] if the recorder cannot be read.
pub fn unprocessed_rows(
    store: &LandscapeStore,
    run_id: &RunId,
) -> Result<Vec<RowId>, StoreError> {
    let checkpoint_row_index = store.max_terminal_row_index(run_id)?.unwrap_or(0);
    store.unprocessed_row_ids(run_id, checkpoint_row_index)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use elspeth_core::identifiers::EdgeId;
    use elspeth_core::identifiers::NodeId;
    use elspeth_core::model::Determinism;
    use elspeth_core::model::Edge;
    use elspeth_core::model::Node;
    use elspeth_core::model::NodeType;
    use elspeth_core::model::RoutingMode;
    use serde_json::json;
    use time::OffsetDateTime;

    fn node(id: &str, node_type: NodeType) -> Node {
        Node {
            node_id: NodeId::new(id),
            run_id: RunId::new("run-1"),
            plugin_name: format!("plugin-{id}"),
            node_type,
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config_hash: "deadbeef".to_string(),
            config_json: json!({}),
            registered_at: OffsetDateTime::UNIX_EPOCH,
            sequence_in_pipeline: None,
        }
    }

    fn linear_graph() -> ExecutionGraph {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("source", NodeType::Source));
        graph.add_node(node("sink", NodeType::Sink));
        graph.add_edge(Edge {
            edge_id: EdgeId::new("source-sink-continue"),
            run_id: RunId::new("run-1"),
            from_node_id: NodeId::new("source"),
            to_node_id: NodeId::new("sink"),
            label: "continue".to_string(),
            default_mode: RoutingMode::Move,
            created_at: OffsetDateTime::UNIX_EPOCH,
        });
        graph
    }

    #[test]
    fn topology_hash_is_stable_across_rebuilds_of_the_same_graph() {
        let first = topology_hash(&linear_graph()).unwrap();
        let second = topology_hash(&linear_graph()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn topology_hash_changes_when_an_edge_label_changes() {
        let mut other = linear_graph();
        other.add_edge(Edge {
            edge_id: EdgeId::new("source-sink-alt"),
            run_id: RunId::new("run-1"),
            from_node_id: NodeId::new("source"),
            to_node_id: NodeId::new("sink"),
            label: "alternate".to_string(),
            default_mode: RoutingMode::Move,
            created_at: OffsetDateTime::UNIX_EPOCH,
        });
        assert_ne!(topology_hash(&linear_graph()).unwrap(), topology_hash(&other).unwrap());
    }
}
