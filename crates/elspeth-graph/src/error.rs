// crates/elspeth-graph/src/error.rs
// ============================================================================
// Module: ELSPETH Graph Errors
// Description: Validation failures for the execution graph.
// ============================================================================

use thiserror::Error;

use elspeth_core::identifiers::NodeId;

/// Errors raised while building or validating an [`crate::ExecutionGraph`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph contains a cycle; `path` is the sequence of node IDs
    /// walked before the cycle closed, in discovery order.
    #[error("graph contains a cycle: {}", format_cycle(.path))]
    Cycle {
        /// Node IDs visited on the path that closed a cycle.
        path: Vec<NodeId>,
    },
    /// The graph does not have exactly one source node.
    #[error("graph must have exactly one source node, found {found}")]
    SourceCount {
        /// Number of source nodes actually found.
        found: usize,
    },
    /// The graph has no sink nodes.
    #[error("graph must have at least one sink node")]
    NoSinks,
    /// A node has two or more outgoing edges sharing the same label.
    #[error(
        "node '{node_id}' has duplicate outgoing edge label '{label}'; edge labels must be \
         unique per source node"
    )]
    DuplicateEdgeLabel {
        /// The offending node.
        node_id: NodeId,
        /// The duplicated label.
        label: String,
    },
    /// A referenced node does not exist in the graph.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    /// A gate route pointed at a sink or node name that does not exist.
    #[error("route target '{target}' does not name a known node")]
    UnknownRouteTarget {
        /// The unresolved target name.
        target: String,
    },
}

/// Renders a cycle path as `"a -> b -> c"` for the error message.
fn format_cycle(path: &[NodeId]) -> String {
    path.iter().map(NodeId::as_str).collect::<Vec<_>>().join(" -> ")
}
