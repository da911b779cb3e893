// demos/pipeline-smoke/src/main.rs
// ============================================================================
// Module: Pipeline Smoke Demo
// Description: Minimal end-to-end pipeline run using in-memory adapters.
// Purpose: Demonstrate wiring a Source/Transform/Sink through a real Runner.
// Dependencies: elspeth-core, elspeth-orchestrator, elspeth-store-sqlite,
//               elspeth-telemetry
// ============================================================================

//! ## Overview
//! Runs a minimal pipeline against an in-memory source and sink. This demo
//! is backend-agnostic and suitable for quick verification that a pipeline
//! config builds a valid graph and drives to completion.

use std::collections::HashMap;
use std::io::Write;

use serde_json::Value;
use serde_json::json;
use time::OffsetDateTime;

use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RunId;
use elspeth_core::model::Determinism;
use elspeth_core::model::RunStatus;
use elspeth_core::model::SchemaContract;
use elspeth_core::model::SchemaMode;
use elspeth_orchestrator::Runner;
use elspeth_orchestrator::config::CheckpointConfig;
use elspeth_orchestrator::config::ConcurrencyConfig;
use elspeth_orchestrator::config::GateRoutingConfig;
use elspeth_orchestrator::config::OrchestratorConfig;
use elspeth_orchestrator::config::RateLimitConfig;
use elspeth_orchestrator::config::RetryConfig;
use elspeth_orchestrator::config::RouteTarget;
use elspeth_orchestrator::config::SecureMode;
use elspeth_orchestrator::graph_builder::GateDeclaration;
use elspeth_orchestrator::graph_builder::NodeDeclaration;
use elspeth_orchestrator::graph_builder::PipelineConfig;
use elspeth_orchestrator::graph_builder::build_graph;
use elspeth_orchestrator::plugin::ArtifactDescriptor;
use elspeth_orchestrator::plugin::PluginContext;
use elspeth_orchestrator::plugin::Sink;
use elspeth_orchestrator::plugin::SinkError;
use elspeth_orchestrator::plugin::Source;
use elspeth_orchestrator::plugin::SourceError;
use elspeth_orchestrator::plugin::SourceRow;
use elspeth_orchestrator::plugin::TransformOutcome;
use elspeth_store_sqlite::LandscapeStore;
use elspeth_store_sqlite::SqliteStoreConfig;
use elspeth_telemetry::BackpressureMode;
use elspeth_telemetry::DispatcherConfig;
use elspeth_telemetry::Granularity;
use elspeth_telemetry::TelemetryDispatcher;

/// Yields three fixed rows, one with a value below the approval threshold.
struct DemoSource {
    /// Remaining rows to yield.
    rows: std::vec::IntoIter<Value>,
    /// The schema every yielded row conforms to.
    schema: SchemaContract,
}

impl DemoSource {
    /// Builds a source preloaded with three demo orders.
    fn new() -> Self {
        let rows = vec![
            json!({ "id": 1, "amount": 250 }),
            json!({ "id": 2, "amount": 9 }),
            json!({ "id": 3, "amount": 4200 }),
        ];
        Self { rows: rows.into_iter(), schema: SchemaContract { fields: Vec::new(), mode: SchemaMode::Observed, locked: false } }
    }
}

impl Source for DemoSource {
    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn plugin_version(&self) -> &str {
        "demo-1.0.0"
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
        Ok(self.rows.next().map(SourceRow::Valid))
    }
}

/// Passes every row through unchanged.
struct IdentityTransform;

impl elspeth_orchestrator::plugin::Transform for IdentityTransform {
    fn process(&self, rows: &[Value], _ctx: &PluginContext) -> TransformOutcome {
        TransformOutcome::Success(rows.to_vec())
    }
}

/// Writes every received row to stdout instead of real storage.
struct PrintingSink {
    /// Prefix printed before each row this sink receives.
    label: &'static str,
}

impl Sink for PrintingSink {
    fn write(&self, rows: &[Value], _ctx: &PluginContext) -> Result<ArtifactDescriptor, SinkError> {
        for row in rows {
            write_line(self.label, &row.to_string())?;
        }
        Ok(ArtifactDescriptor {
            path_or_uri: format!("demo://{}", self.label),
            content_hash: "n/a".to_string(),
            size_bytes: 0,
        })
    }
}

/// Shared node registration fields for a plugin with no configuration.
fn bare_node(name: &str, plugin: &str) -> NodeDeclaration {
    NodeDeclaration {
        name: name.to_string(),
        plugin: plugin.to_string(),
        plugin_version: "demo-1.0.0".to_string(),
        determinism: Determinism::Deterministic,
        options: json!({}),
    }
}

/// Builds the pipeline config used by this demo: a source, a passthrough
/// transform, a config-gate routing on `amount >= 100`, and two sinks.
fn build_pipeline() -> PipelineConfig {
    let mut sinks = HashMap::new();
    sinks.insert("approved".to_string(), bare_node("approved", "printing-sink"));
    sinks.insert("rejected".to_string(), bare_node("rejected", "printing-sink"));

    let mut routes = HashMap::new();
    routes.insert("true".to_string(), RouteTarget::Sink("approved".to_string()));
    routes.insert("false".to_string(), RouteTarget::Sink("rejected".to_string()));

    PipelineConfig {
        datasource: bare_node("orders", "demo-source"),
        row_plugins: vec![bare_node("passthrough", "identity")],
        aggregations: Vec::new(),
        gates: vec![GateDeclaration {
            node: bare_node("amount_check", "config-gate"),
            condition: Some("row['amount'] >= 100".to_string()),
            routes: GateRoutingConfig { routes },
        }],
        coalesce: Vec::new(),
        sinks,
        output_sink: "approved".to_string(),
        orchestrator_config: OrchestratorConfig {
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            checkpoint: CheckpointConfig::default(),
            telemetry: DispatcherConfig {
                enabled: true,
                granularity: Granularity::Lifecycle,
                backpressure_mode: BackpressureMode::Block,
                queue_capacity: 64,
                max_consecutive_failures: 3,
                fail_on_total_exporter_failure: false,
            },
            secure_mode: SecureMode::Strict,
            sink_error_policies: HashMap::new(),
        },
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = build_pipeline();
    let run_id = RunId::new("demo-run-1");
    let now = OffsetDateTime::now_utc();

    let built = build_graph(&pipeline, &run_id, now)?;
    let store = LandscapeStore::open(&SqliteStoreConfig::in_memory())?;
    let telemetry = TelemetryDispatcher::new(pipeline.orchestrator_config.telemetry)?;
    let settings = serde_json::to_value(&pipeline)?;

    let registry = elspeth_orchestrator::PluginRegistry::new(Box::new(DemoSource::new()))
        .with_transform(NodeId::new("transform:passthrough"), Box::new(IdentityTransform))
        .with_sink("approved", Box::new(PrintingSink { label: "approved" }))
        .with_sink("rejected", Box::new(PrintingSink { label: "rejected" }));

    let runner = Runner::new(store, telemetry, built, registry, pipeline.orchestrator_config.clone(), run_id, settings);
    let summary = runner.run()?;

    write_line("Status", run_status_label(summary.status))?;
    write_line("Rows ingested", &summary.rows_ingested.to_string())?;
    write_line("Tokens completed", &summary.tokens_completed.to_string())?;
    write_line("Tokens failed", &summary.tokens_failed.to_string())?;

    Ok(())
}

/// Writes a labeled line to stdout.
fn write_line(label: &str, value: &str) -> Result<(), std::io::Error> {
    let mut out = std::io::stdout();
    writeln!(out, "{label}: {value}")
}

/// Returns a stable label for a run's terminal status.
const fn run_status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}
