// crates/elspeth-orchestrator/src/graph_builder.rs
// ============================================================================
// Module: ELSPETH Pipeline Configuration & Graph Building
// Description: Translates a declarative pipeline configuration into a
//              validated execution graph, following the six build rules
//              for topology construction (§4.5).
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use elspeth_coalesce::CoalesceNodeConfig;
use elspeth_core::hashing::HashAlgorithm;
use elspeth_core::hashing::hash_canonical_json;
use elspeth_core::identifiers::EdgeId;
use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RunId;
use elspeth_core::model::Determinism;
use elspeth_core::model::Edge;
use elspeth_core::model::Node;
use elspeth_core::model::NodeType;
use elspeth_core::model::RoutingMode;
use elspeth_expr::GateCondition;
use elspeth_graph::ExecutionGraph;

use crate::config::GateRoutingConfig;
use crate::config::OrchestratorConfig;
use crate::config::RouteTarget;
use crate::error::OrchestratorError;
use crate::ids::IdMinter;

/// One pipeline node's registration data, shared by every node kind
/// (§6.2: "every node declares `plugin`, `plugin_version`, `determinism`,
/// and its plugin-specific `options`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeclaration {
    /// The node's declared name within the pipeline, unique per node
    /// kind. Forms half of the node's deterministic id.
    pub name: String,
    /// The plugin implementation backing this node.
    pub plugin: String,
    /// A free-form version string for the plugin build.
    pub plugin_version: String,
    /// The node's declared determinism class.
    pub determinism: Determinism,
    /// Plugin-specific configuration, hashed into `config_hash`.
    pub options: Value,
}

/// A trigger deciding when an aggregation node flushes its buffered
/// rows (§4.3: "aggregation nodes batch rows until a trigger fires").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTrigger {
    /// Flush after `n` buffered rows.
    Count(usize),
    /// Flush whenever the named field's value changes from the
    /// previously buffered row (a "group consecutive rows" trigger).
    BoundaryField(String),
    /// Never flush early; only drain at end-of-source.
    EndOfSource,
}

/// One declared aggregation node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationDeclaration {
    /// Shared node registration data.
    pub node: NodeDeclaration,
    /// What triggers this node's batch flush.
    pub trigger: BatchTrigger,
}

/// One declared gate node (§4.5 rule 4, §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDeclaration {
    /// Shared node registration data.
    pub node: NodeDeclaration,
    /// A config-gate's expression source. `None` means this gate is
    /// backed by a registered [`crate::plugin::GatePlugin`] instead
    /// (§6.1: "Config-gates use the expression evaluator directly
    /// without plugin code").
    pub condition: Option<String>,
    /// The gate's routing table.
    pub routes: GateRoutingConfig,
}

/// One declared coalesce node (§4.5 rule 5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceDeclaration {
    /// Shared node registration data.
    pub node: NodeDeclaration,
    /// The join policy and merge strategy.
    pub config: CoalesceNodeConfig,
}

/// The full declarative shape of a pipeline (§6.2: "`datasource`,
/// `row_plugins`, `aggregations`, `gates`, `coalesce`, `sinks`,
/// `output_sink`, `orchestrator_config`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The single source node.
    pub datasource: NodeDeclaration,
    /// Transform nodes, chained in declared order.
    pub row_plugins: Vec<NodeDeclaration>,
    /// Aggregation nodes, following the transform chain in declared
    /// order.
    pub aggregations: Vec<AggregationDeclaration>,
    /// Gate nodes, following the aggregation chain in declared order.
    pub gates: Vec<GateDeclaration>,
    /// Coalesce (join) nodes, each reachable from a gate's `fork_to`.
    pub coalesce: Vec<CoalesceDeclaration>,
    /// Named sinks.
    pub sinks: HashMap<String, NodeDeclaration>,
    /// The name of the sink every unrouted token ultimately reaches.
    pub output_sink: String,
    /// Orchestrator-level runtime configuration.
    pub orchestrator_config: OrchestratorConfig,
}

/// The result of building a [`PipelineConfig`] into an [`ExecutionGraph`],
/// plus the side-tables the engine needs to drive it (routing tables,
/// coalesce configuration, and the node rows to register for audit).
#[derive(Debug)]
pub struct BuiltGraph {
    /// The validated execution graph.
    pub graph: ExecutionGraph,
    /// Every node registered while building the graph, in registration
    /// order, ready for `LandscapeStore::register_node`.
    pub nodes: Vec<Node>,
    /// The single source node's id.
    pub source_node: NodeId,
    /// The output sink's node id.
    pub output_sink: NodeId,
    /// Sink name → node id.
    pub sink_nodes: HashMap<String, NodeId>,
    /// Gate node id → its declared routing table.
    pub gate_routing: HashMap<NodeId, GateRoutingConfig>,
    /// Gate node id → its parsed condition, for config-gates.
    pub gate_conditions: HashMap<NodeId, GateCondition>,
    /// Coalesce node id → its join configuration.
    pub coalesce_configs: HashMap<NodeId, CoalesceNodeConfig>,
    /// Aggregation node id → its flush trigger.
    pub aggregation_triggers: HashMap<NodeId, BatchTrigger>,
    /// The set of aggregation node ids, for quick membership checks.
    pub aggregation_nodes: HashSet<NodeId>,
}

fn make_node(
    node_id: NodeId,
    run_id: &RunId,
    decl: &NodeDeclaration,
    node_type: NodeType,
    sequence: u32,
    now: OffsetDateTime,
) -> Result<Node, OrchestratorError> {
    let config_hash = hash_canonical_json(HashAlgorithm::Sha256, &decl.options)?.as_str().to_string();
    Ok(Node {
        node_id,
        run_id: run_id.clone(),
        plugin_name: decl.plugin.clone(),
        node_type,
        plugin_version: decl.plugin_version.clone(),
        determinism: decl.determinism,
        config_hash,
        config_json: decl.options.clone(),
        registered_at: now,
        sequence_in_pipeline: Some(sequence),
    })
}

fn continue_edge(
    id_minter: &IdMinter,
    run_id: &RunId,
    from: NodeId,
    to: NodeId,
    now: OffsetDateTime,
) -> Edge {
    Edge {
        edge_id: EdgeId::new(id_minter.mint()),
        run_id: run_id.clone(),
        from_node_id: from,
        to_node_id: to,
        label: "continue".to_string(),
        default_mode: RoutingMode::Move,
        created_at: now,
    }
}

/// Builds and validates an [`ExecutionGraph`] from `config` (§4.5).
///
/// # Errors
///
/// Returns [`OrchestratorError::Graph`] if the built graph is cyclic,
/// has no source or sink, or has duplicate outgoing edge labels.
/// Returns [`OrchestratorError::UnknownRouteTarget`] if a gate or
/// coalesce node names a sink or branch that was never declared.
/// Returns [`OrchestratorError::Expression`] if a config-gate's
/// condition fails to parse.
/// Returns [`OrchestratorError::Coalesce`] if a coalesce node's policy
/// is invalid.
#[allow(clippy::too_many_lines, reason = "Linear topology construction reads best unbroken.")]
pub fn build_graph(
    config: &PipelineConfig,
    run_id: &RunId,
    now: OffsetDateTime,
) -> Result<BuiltGraph, OrchestratorError> {
    let mut graph = ExecutionGraph::new();
    let mut nodes = Vec::new();
    let mut sequence: u32 = 0;
    let id_minter = IdMinter::new("edge");

    let source_node_id = NodeId::new(format!("source:{}", config.datasource.name));
    let source_node = make_node(source_node_id.clone(), run_id, &config.datasource, NodeType::Source, sequence, now)?;
    graph.add_node(source_node.clone());
    nodes.push(source_node);
    sequence += 1;

    let mut linear_nodes = vec![source_node_id.clone()];
    let mut aggregation_nodes = HashSet::new();
    let mut aggregation_triggers = HashMap::new();

    for decl in &config.row_plugins {
        let node_id = NodeId::new(format!("transform:{}", decl.name));
        let node = make_node(node_id.clone(), run_id, decl, NodeType::Transform, sequence, now)?;
        graph.add_node(node.clone());
        nodes.push(node);
        sequence += 1;
        linear_nodes.push(node_id);
    }

    for agg in &config.aggregations {
        let node_id = NodeId::new(format!("aggregation:{}", agg.node.name));
        let node = make_node(node_id.clone(), run_id, &agg.node, NodeType::Aggregation, sequence, now)?;
        graph.add_node(node.clone());
        nodes.push(node);
        sequence += 1;
        linear_nodes.push(node_id.clone());
        aggregation_nodes.insert(node_id.clone());
        aggregation_triggers.insert(node_id, agg.trigger.clone());
    }

    let mut edges = Vec::new();
    for pair in linear_nodes.windows(2) {
        edges.push(continue_edge(&id_minter, run_id, pair[0].clone(), pair[1].clone(), now));
    }

    let mut sink_nodes = HashMap::new();
    for (name, decl) in &config.sinks {
        let node_id = NodeId::new(format!("sink:{name}"));
        let node = make_node(node_id.clone(), run_id, decl, NodeType::Sink, sequence, now)?;
        graph.add_node(node.clone());
        nodes.push(node);
        sequence += 1;
        sink_nodes.insert(name.clone(), node_id);
    }
    let output_sink_node = sink_nodes
        .get(&config.output_sink)
        .cloned()
        .ok_or_else(|| OrchestratorError::UnconfiguredSink(config.output_sink.clone()))?;

    let mut coalesce_configs = HashMap::new();
    let mut branch_targets: HashMap<String, NodeId> = HashMap::new();
    for coalesce_decl in &config.coalesce {
        coalesce_decl.config.validate().map_err(OrchestratorError::Coalesce)?;
        let node_id = NodeId::new(format!("coalesce:{}", coalesce_decl.node.name));
        let node = make_node(node_id.clone(), run_id, &coalesce_decl.node, NodeType::Coalesce, sequence, now)?;
        graph.add_node(node.clone());
        nodes.push(node);
        sequence += 1;
        for branch in &coalesce_decl.config.branches {
            branch_targets.insert(branch.clone(), node_id.clone());
        }
        coalesce_configs.insert(node_id.clone(), coalesce_decl.config.clone());
        edges.push(continue_edge(&id_minter, run_id, node_id, output_sink_node.clone(), now));
    }

    let last_linear = linear_nodes.last().cloned().unwrap_or_else(|| source_node_id.clone());

    let mut gate_node_ids = Vec::with_capacity(config.gates.len());
    for gate_decl in &config.gates {
        let node_id = NodeId::new(format!("gate:{}", gate_decl.node.name));
        let node = make_node(node_id.clone(), run_id, &gate_decl.node, NodeType::Gate, sequence, now)?;
        graph.add_node(node.clone());
        nodes.push(node);
        sequence += 1;
        gate_node_ids.push(node_id);
    }

    if let Some(first_gate) = gate_node_ids.first() {
        edges.push(continue_edge(&id_minter, run_id, last_linear.clone(), first_gate.clone(), now));
    }

    let mut gate_routing = HashMap::new();
    let mut gate_conditions = HashMap::new();
    for (index, gate_decl) in config.gates.iter().enumerate() {
        let node_id = gate_node_ids[index].clone();
        let next_stage = gate_node_ids.get(index + 1).cloned().unwrap_or_else(|| output_sink_node.clone());

        if let Some(source) = &gate_decl.condition {
            let condition = GateCondition::parse(source)?;
            gate_conditions.insert(node_id.clone(), condition);
        }

        for (label, target) in &gate_decl.routes.routes {
            match target {
                RouteTarget::Continue => {
                    edges.push(continue_edge(&id_minter, run_id, node_id.clone(), next_stage.clone(), now));
                }
                RouteTarget::Sink(sink_name) => {
                    let to = sink_nodes
                        .get(sink_name)
                        .cloned()
                        .ok_or_else(|| OrchestratorError::UnknownRouteTarget(sink_name.clone()))?;
                    edges.push(Edge {
                        edge_id: EdgeId::new(id_minter.mint()),
                        run_id: run_id.clone(),
                        from_node_id: node_id.clone(),
                        to_node_id: to,
                        label: label.clone(),
                        default_mode: RoutingMode::Move,
                        created_at: now,
                    });
                }
                RouteTarget::Fork { fork_to } => {
                    for branch in fork_to {
                        let to = branch_targets
                            .get(branch)
                            .cloned()
                            .or_else(|| sink_nodes.get(branch).cloned())
                            .ok_or_else(|| OrchestratorError::UnknownRouteTarget(branch.clone()))?;
                        edges.push(Edge {
                            edge_id: EdgeId::new(id_minter.mint()),
                            run_id: run_id.clone(),
                            from_node_id: node_id.clone(),
                            to_node_id: to,
                            label: branch.clone(),
                            default_mode: RoutingMode::Copy,
                            created_at: now,
                        });
                    }
                }
            }
        }

        gate_routing.insert(node_id, gate_decl.routes.clone());
    }

    let last_stage = gate_node_ids.last().cloned().unwrap_or_else(|| last_linear.clone());
    for edge in &edges {
        graph.add_edge(edge.clone());
    }
    if graph.resolve_route(&last_stage, "continue").is_none() {
        let fallback = continue_edge(&id_minter, run_id, last_stage, output_sink_node.clone(), now);
        graph.add_edge(fallback);
    }

    graph.validate()?;

    Ok(BuiltGraph {
        graph,
        nodes,
        source_node: source_node_id,
        output_sink: output_sink_node,
        sink_nodes,
        gate_routing,
        gate_conditions,
        coalesce_configs,
        aggregation_triggers,
        aggregation_nodes,
    })
}
