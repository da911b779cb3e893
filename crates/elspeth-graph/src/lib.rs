// crates/elspeth-graph/src/lib.rs
// ============================================================================
// Crate: elspeth-graph
// Description: DAG multigraph describing a pipeline's node/edge topology.
// ============================================================================

//! Wraps a hand-rolled adjacency-list multigraph with the domain
//! operations the orchestrator needs: acyclicity, single-source /
//! at-least-one-sink validation, unique-outgoing-label validation,
//! topological ordering, and route resolution (§4.5).
//!
//! The graph is a multigraph: a node may have several outgoing edges to
//! the same destination carrying different labels (a fork gate routing
//! multiple branches to one sink), so edges are keyed by
//! `(from_node, label)` rather than `(from_node, to_node)`.

mod error;

pub use error::GraphError;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use elspeth_core::identifiers::NodeId;
use elspeth_core::model::Edge;
use elspeth_core::model::Node;
use elspeth_core::model::NodeType;

/// A validated (or validatable) execution graph.
///
/// # Invariants
/// - Edges are keyed by `(from_node, label)`; within a node, labels are
///   unique once [`ExecutionGraph::validate`] has succeeded.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    /// Registered nodes keyed by ID.
    nodes: BTreeMap<NodeId, Node>,
    /// Declared registration order, used as a stable iteration order for
    /// topological sorting ties.
    node_order: Vec<NodeId>,
    /// Registered edges, in registration order.
    edges: Vec<Edge>,
    /// `(from_node, label)` -> edge index, the orchestrator's routing key.
    route_resolution: HashMap<(NodeId, String), usize>,
    /// `from_node` -> indices into `edges` for its outgoing edges.
    out_adjacency: HashMap<NodeId, Vec<usize>>,
}

impl ExecutionGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of registered edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Whether `node_id` has been registered.
    #[must_use]
    pub fn has_node(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Registers a node. Re-registering the same `node_id` overwrites
    /// the previous entry without otherwise affecting the graph's
    /// topology.
    pub fn add_node(&mut self, node: Node) {
        if !self.nodes.contains_key(&node.node_id) {
            self.node_order.push(node.node_id.clone());
        }
        self.nodes.insert(node.node_id.clone(), node);
    }

    /// Registers a directed, labelled edge from `edge.from_node_id` to
    /// `edge.to_node_id`. The `(from_node_id, label)` pair becomes the
    /// orchestrator's route resolution key.
    pub fn add_edge(&mut self, edge: Edge) {
        let key = (edge.from_node_id.clone(), edge.label.clone());
        let index = self.edges.len();
        self.out_adjacency.entry(edge.from_node_id.clone()).or_default().push(index);
        self.route_resolution.insert(key, index);
        self.edges.push(edge);
    }

    /// Returns the registered node info for `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::NodeNotFound`] if no such node exists.
    pub fn get_node_info(&self, node_id: &NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(node_id).ok_or_else(|| GraphError::NodeNotFound(node_id.clone()))
    }

    /// Returns all registered edges, in registration order.
    #[must_use]
    pub fn get_edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the sole source node, or `None` if there is not exactly
    /// one.
    #[must_use]
    pub fn get_source(&self) -> Option<&NodeId> {
        let mut sources = self.nodes.values().filter(|node| node.node_type == NodeType::Source);
        let first = sources.next()?;
        if sources.next().is_some() {
            return None;
        }
        Some(&first.node_id)
    }

    /// Returns every sink node.
    #[must_use]
    pub fn get_sinks(&self) -> Vec<&NodeId> {
        self.nodes
            .values()
            .filter(|node| node.node_type == NodeType::Sink)
            .map(|node| &node.node_id)
            .collect()
    }

    /// Returns the full `(from_node, label) -> to_node` resolution
    /// table the orchestrator uses to route tokens after a gate
    /// evaluates.
    #[must_use]
    pub fn get_route_resolution_map(&self) -> HashMap<(NodeId, String), NodeId> {
        self.route_resolution
            .iter()
            .map(|(key, &index)| (key.clone(), self.edges[index].to_node_id.clone()))
            .collect()
    }

    /// Resolves the edge leaving `from_node` labelled `label`, if any.
    #[must_use]
    pub fn resolve_route(&self, from_node: &NodeId, label: &str) -> Option<&Edge> {
        let index = *self.route_resolution.get(&(from_node.clone(), label.to_string()))?;
        Some(&self.edges[index])
    }

    /// Whether the graph is acyclic.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Validates structural invariants required before execution
    /// (§4.5): acyclicity, exactly one source, at least one sink, and
    /// unique outgoing edge labels per node.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant as a [`GraphError`].
    pub fn validate(&self) -> Result<(), GraphError> {
        if let Some(path) = self.find_cycle() {
            return Err(GraphError::Cycle { path });
        }

        let source_count =
            self.nodes.values().filter(|node| node.node_type == NodeType::Source).count();
        if source_count != 1 {
            return Err(GraphError::SourceCount { found: source_count });
        }

        if self.get_sinks().is_empty() {
            return Err(GraphError::NoSinks);
        }

        for (node_id, edge_indices) in &self.out_adjacency {
            let mut labels_seen = HashSet::new();
            for &index in edge_indices {
                let label = &self.edges[index].label;
                if !labels_seen.insert(label.clone()) {
                    return Err(GraphError::DuplicateEdgeLabel {
                        node_id: node_id.clone(),
                        label: label.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Returns nodes in topological order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        if let Some(path) = self.find_cycle() {
            return Err(GraphError::Cycle { path });
        }

        let mut in_degree: HashMap<NodeId, usize> =
            self.node_order.iter().map(|id| (id.clone(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to_node_id.clone()).or_insert(0) += 1;
        }

        let mut ready: Vec<NodeId> = self
            .node_order
            .iter()
            .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = ready.pop() {
            order.push(node_id.clone());
            if let Some(edge_indices) = self.out_adjacency.get(&node_id) {
                for &index in edge_indices {
                    let to_node = &self.edges[index].to_node_id;
                    if let Some(degree) = in_degree.get_mut(to_node) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(to_node.clone());
                        }
                    }
                }
            }
            // Keep deterministic output: process newly-ready nodes in
            // declared registration order rather than adjacency order.
            ready.sort_by_key(|id| self.node_order.iter().position(|n| n == id));
        }

        Ok(order)
    }

    /// Depth-first cycle search. Returns the walked path up to and
    /// including the node that closed the cycle, in discovery order.
    fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let mut marks: HashMap<NodeId, MarkState> = HashMap::new();
        let mut stack: Vec<NodeId> = Vec::new();

        for start in &self.node_order {
            if marks.contains_key(start) {
                continue;
            }
            if let Some(path) = self.visit(start, &mut marks, &mut stack) {
                return Some(path);
            }
        }
        None
    }

    /// Recursive DFS step for [`ExecutionGraph::find_cycle`]; returns the
    /// cycle path the first time it walks back onto an in-progress node.
    fn visit(
        &self,
        node_id: &NodeId,
        marks: &mut HashMap<NodeId, MarkState>,
        stack: &mut Vec<NodeId>,
    ) -> Option<Vec<NodeId>> {
        match marks.get(node_id) {
            Some(MarkState::Done) => return None,
            Some(MarkState::InProgress) => {
                let start = stack.iter().position(|id| id == node_id).unwrap_or(0);
                let mut cycle = stack[start ..].to_vec();
                cycle.push(node_id.clone());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node_id.clone(), MarkState::InProgress);
        stack.push(node_id.clone());

        if let Some(edge_indices) = self.out_adjacency.get(node_id) {
            for &index in edge_indices {
                let to_node = self.edges[index].to_node_id.clone();
                if let Some(path) = self.visit(&to_node, marks, stack) {
                    return Some(path);
                }
            }
        }

        stack.pop();
        marks.insert(node_id.clone(), MarkState::Done);
        None
    }
}

/// DFS visitation mark used by [`ExecutionGraph::find_cycle`].
#[derive(PartialEq, Eq, Clone, Copy)]
enum MarkState {
    /// On the current DFS stack; revisiting it means a cycle closed.
    InProgress,
    /// Fully explored with no cycle found through it.
    Done,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use elspeth_core::identifiers::EdgeId;
    use elspeth_core::identifiers::RunId;
    use elspeth_core::model::Determinism;
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

    fn edge(from: &str, to: &str, label: &str) -> Edge {
        Edge {
            edge_id: EdgeId::new(format!("{from}-{to}-{label}")),
            run_id: RunId::new("run-1"),
            from_node_id: NodeId::new(from),
            to_node_id: NodeId::new(to),
            label: label.to_string(),
            default_mode: elspeth_core::model::RoutingMode::Move,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn linear_graph() -> ExecutionGraph {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("source", NodeType::Source));
        graph.add_node(node("transform", NodeType::Transform));
        graph.add_node(node("sink", NodeType::Sink));
        graph.add_edge(edge("source", "transform", "continue"));
        graph.add_edge(edge("transform", "sink", "continue"));
        graph
    }

    #[test]
    fn validates_a_well_formed_linear_graph() {
        let graph = linear_graph();
        graph.validate().unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![
            NodeId::new("source"),
            NodeId::new("transform"),
            NodeId::new("sink"),
        ]);
    }

    #[test]
    fn rejects_a_graph_with_no_source() {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("sink", NodeType::Sink));
        assert_eq!(graph.validate().unwrap_err(), GraphError::SourceCount { found: 0 });
    }

    #[test]
    fn rejects_a_graph_with_two_sources() {
        let mut graph = linear_graph();
        graph.add_node(node("source2", NodeType::Source));
        assert_eq!(graph.validate().unwrap_err(), GraphError::SourceCount { found: 2 });
    }

    #[test]
    fn rejects_a_graph_with_no_sinks() {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("source", NodeType::Source));
        assert_eq!(graph.validate().unwrap_err(), GraphError::NoSinks);
    }

    #[test]
    fn rejects_a_cycle() {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("a", NodeType::Source));
        graph.add_node(node("b", NodeType::Transform));
        graph.add_edge(edge("a", "b", "continue"));
        graph.add_edge(edge("b", "a", "continue"));
        let error = graph.validate().unwrap_err();
        assert!(matches!(error, GraphError::Cycle { .. }));
    }

    #[test]
    fn rejects_duplicate_outgoing_edge_labels() {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("gate", NodeType::Gate));
        graph.add_node(node("sink_a", NodeType::Sink));
        graph.add_node(node("sink_b", NodeType::Sink));
        graph.add_edge(edge("gate", "sink_a", "flagged"));
        graph.add_edge(edge("gate", "sink_b", "flagged"));
        let error = graph.validate().unwrap_err();
        assert!(matches!(error, GraphError::DuplicateEdgeLabel { .. }));
    }

    #[test]
    fn fork_gate_may_route_multiple_labels_to_the_same_sink() {
        let mut graph = ExecutionGraph::new();
        graph.add_node(node("gate", NodeType::Gate));
        graph.add_node(node("sink", NodeType::Sink));
        graph.add_node(node("source", NodeType::Source));
        graph.add_edge(edge("source", "gate", "continue"));
        graph.add_edge(edge("gate", "sink", "branch_a"));
        graph.add_edge(edge("gate", "sink", "branch_b"));
        graph.validate().unwrap();
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn resolves_routes_by_from_node_and_label() {
        let graph = linear_graph();
        let resolved = graph.resolve_route(&NodeId::new("source"), "continue").unwrap();
        assert_eq!(resolved.to_node_id, NodeId::new("transform"));
        assert!(graph.resolve_route(&NodeId::new("source"), "missing").is_none());
    }

    #[test]
    fn node_not_found_is_reported_explicitly() {
        let graph = linear_graph();
        let error = graph.get_node_info(&NodeId::new("nonexistent")).unwrap_err();
        assert_eq!(error, GraphError::NodeNotFound(NodeId::new("nonexistent")));
    }
}
