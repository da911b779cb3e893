// crates/elspeth-orchestrator/src/run.rs
// ============================================================================
// Module: ELSPETH Run Loop
// Description: Drives a built pipeline to completion: row ingestion,
//              transform/gate/aggregation/coalesce dispatch, sink writes,
//              checkpointing, and telemetry (C7, §4, §5, §7).
// ============================================================================

//! ## Overview
//! [`Runner`] owns one run end to end. It reads rows from a [`Source`],
//! pushes each token through the built graph one node at a time via an
//! in-memory work queue, and drives every other subsystem in the
//! workspace around that queue: [`LandscapeStore`] for the audit trail,
//! [`TelemetryDispatcher`] for lifecycle events, [`CoalesceExecutor`]
//! for joins, and the retry/rate-limit primitives in [`crate::retry`]
//! for capacity-limited transforms.
//!
//! Rows are processed one at a time, each to exhaustion (every token its
//! ingestion produces, including every fork/expand/coalesce descendant,
//! is drained before the next row is read). `orchestrator_config.concurrency`
//! is carried on the configuration surface and honored structurally
//! (workers would pull from the same queue), but this build drives the
//! queue on the calling thread rather than spreading it across a pool;
//! see `DESIGN.md` for the reasoning.
//!
//! A [`Transform`] never sees a store handle or a request/response
//! payload to hash, so an `ExternalCall`-determinism node's invocation
//! is audited as an [`TelemetryEvent::ExternalCallCompleted`] event
//! (status and duration only), not as a per-call [`elspeth_core::model::Call`]
//! row — the trait contract carries nothing richer to record.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;

use elspeth_coalesce::AcceptOutcome;
use elspeth_coalesce::BranchArrival;
use elspeth_coalesce::CoalesceError;
use elspeth_coalesce::CoalesceExecutor;
use elspeth_coalesce::CoalesceMerger;
use elspeth_coalesce::CoalesceNodeConfig;
use elspeth_coalesce::ReadyJoin;
use elspeth_coalesce::ResolveOutcome;
use elspeth_core::hashing::HashAlgorithm;
use elspeth_core::hashing::hash_canonical_json;
use elspeth_core::identifiers::ArtifactId;
use elspeth_core::identifiers::BatchId;
use elspeth_core::identifiers::CallId;
use elspeth_core::identifiers::CheckpointId;
use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::OperationId;
use elspeth_core::identifiers::OutcomeId;
use elspeth_core::identifiers::RowId;
use elspeth_core::identifiers::RunId;
use elspeth_core::identifiers::StateId;
use elspeth_core::identifiers::TokenId;
use elspeth_core::model::CallStatus;
use elspeth_core::model::Determinism;
use elspeth_core::model::NodeStateStatus;
use elspeth_core::model::NodeType;
use elspeth_core::model::OperationType;
use elspeth_core::model::Outcome;
use elspeth_core::model::OutcomeDetail;
use elspeth_core::model::RunStatus;
use elspeth_core::model::Token;
use elspeth_store_sqlite::LandscapeStore;
use elspeth_telemetry::TelemetryDispatcher;
use elspeth_telemetry::TelemetryEvent;

use crate::checkpoint;
use crate::config::CheckpointTrigger;
use crate::config::OrchestratorConfig;
use crate::config::RouteTarget;
use crate::config::SecureMode;
use crate::config::SinkErrorPolicy;
use crate::error::OrchestratorError;
use crate::graph_builder::BuiltGraph;
use crate::ids::IdMinter;
use crate::plugin::GatePlugin;
use crate::plugin::PluginContext;
use crate::plugin::QuarantineDestination;
use crate::plugin::Sink;
use crate::plugin::SinkError;
use crate::plugin::Source;
use crate::plugin::SourceRow;
use crate::plugin::Transform;
use crate::plugin::TransformOutcome;
use crate::retry::AcquireOutcome;
use crate::retry::RateLimiter;
use crate::retry::backoff_delay;
use crate::retry::within_retry_budget;

// ============================================================================
// SECTION: Plugin Registry
// ============================================================================

/// Every plugin implementation a run needs, keyed the way the built
/// graph names them: transforms and gates by [`NodeId`], sinks and
/// coalesce mergers by their declared name (§6.1).
pub struct PluginRegistry {
    /// The pipeline's single row source.
    source: Box<dyn Source>,
    /// Transform and aggregation plugins, keyed by node id.
    transforms: HashMap<NodeId, Box<dyn Transform>>,
    /// Plugin-backed gate implementations, keyed by node id. A
    /// config-gate (parsed condition) never appears here.
    gates: HashMap<NodeId, Box<dyn GatePlugin>>,
    /// Sink plugins, keyed by declared sink name.
    sinks: HashMap<String, Box<dyn Sink>>,
    /// Registered custom coalesce mergers, keyed by the name a
    /// `MergeStrategy::Custom` names.
    coalesce_mergers: HashMap<String, Arc<dyn CoalesceMerger>>,
}

impl PluginRegistry {
    /// Builds a registry around the pipeline's source. Transforms,
    /// gates, sinks, and coalesce mergers are attached afterward with
    /// the `with_*` builders.
    #[must_use]
    pub fn new(source: Box<dyn Source>) -> Self {
        Self {
            source,
            transforms: HashMap::new(),
            gates: HashMap::new(),
            sinks: HashMap::new(),
            coalesce_mergers: HashMap::new(),
        }
    }

    /// Attaches a transform or aggregation plugin for `node_id`.
    #[must_use]
    pub fn with_transform(mut self, node_id: NodeId, transform: Box<dyn Transform>) -> Self {
        self.transforms.insert(node_id, transform);
        self
    }

    /// Attaches a plugin-backed gate for `node_id`.
    #[must_use]
    pub fn with_gate(mut self, node_id: NodeId, gate: Box<dyn GatePlugin>) -> Self {
        self.gates.insert(node_id, gate);
        self
    }

    /// Attaches a sink plugin under `name`.
    #[must_use]
    pub fn with_sink(mut self, name: impl Into<String>, sink: Box<dyn Sink>) -> Self {
        self.sinks.insert(name.into(), sink);
        self
    }

    /// Registers a custom coalesce merger under `name`.
    #[must_use]
    pub fn with_coalesce_merger(mut self, name: impl Into<String>, merger: Arc<dyn CoalesceMerger>) -> Self {
        self.coalesce_mergers.insert(name.into(), merger);
        self
    }
}

// ============================================================================
// SECTION: Id Minting
// ============================================================================

/// One [`IdMinter`] per entity kind the run loop mints itself.
struct Ids {
    /// Mints [`RowId`] suffixes.
    row: IdMinter,
    /// Mints [`TokenId`] suffixes.
    token: IdMinter,
    /// Mints [`StateId`] suffixes.
    state: IdMinter,
    /// Mints [`CallId`] suffixes.
    call: IdMinter,
    /// Mints [`OperationId`] suffixes.
    operation: IdMinter,
    /// Mints [`BatchId`] suffixes.
    batch: IdMinter,
    /// Mints [`ArtifactId`] suffixes.
    artifact: IdMinter,
    /// Mints [`OutcomeId`] suffixes.
    outcome: IdMinter,
    /// Mints [`CheckpointId`] suffixes.
    checkpoint: IdMinter,
    /// Mints `routing_events.event_id` suffixes.
    event: IdMinter,
    /// Mints `validation_errors.error_id` suffixes.
    validation_error: IdMinter,
    /// Mints fork group identifiers.
    fork_group: IdMinter,
    /// Mints expand group identifiers.
    expand_group: IdMinter,
    /// Mints join group identifiers.
    join_group: IdMinter,
    /// Mints routing group identifiers.
    routing_group: IdMinter,
}

impl Ids {
    /// Builds a fresh, zeroed set of per-entity id minters.
    fn new() -> Self {
        Self {
            row: IdMinter::new("row"),
            token: IdMinter::new("token"),
            state: IdMinter::new("state"),
            call: IdMinter::new("call"),
            operation: IdMinter::new("operation"),
            batch: IdMinter::new("batch"),
            artifact: IdMinter::new("artifact"),
            outcome: IdMinter::new("outcome"),
            checkpoint: IdMinter::new("checkpoint"),
            event: IdMinter::new("event"),
            validation_error: IdMinter::new("verr"),
            fork_group: IdMinter::new("fork"),
            expand_group: IdMinter::new("expand"),
            join_group: IdMinter::new("join"),
            routing_group: IdMinter::new("route"),
        }
    }
}

// ============================================================================
// SECTION: Work Queue
// ============================================================================

/// One token awaiting dispatch at `node_id`, carrying the row data it
/// currently owns.
struct QueueItem {
    /// The token in flight.
    token: Token,
    /// The row data this token currently carries.
    data: Value,
    /// The node this item is waiting to be processed by.
    node_id: NodeId,
}

/// How a buffered sink row reached its sink, for the outcome it records
/// once the write succeeds.
#[derive(Debug, Clone, Copy)]
enum SinkRowKind {
    /// Reached the designated output sink through the ordinary
    /// continue chain.
    Completed,
    /// Reached a named sink via an explicit gate route.
    Routed,
}

impl SinkRowKind {
    /// The terminal [`Outcome`] this row kind records on a successful
    /// write.
    fn outcome(self) -> Outcome {
        match self {
            Self::Completed => Outcome::Completed,
            Self::Routed => Outcome::Routed,
        }
    }
}

/// One row buffered for a sink's next write.
struct BufferedSinkRow {
    /// The token that produced this row.
    token: Token,
    /// The row data to write.
    data: Value,
    /// How this row reached the sink.
    kind: SinkRowKind,
}

/// Rows buffered for one aggregation node awaiting its flush trigger.
struct AggregationBuffer {
    /// The open batch these rows belong to.
    batch_id: BatchId,
    /// Member tokens, in arrival order.
    tokens: Vec<Token>,
    /// Member row data, in arrival order, parallel to `tokens`.
    rows: Vec<Value>,
    /// The last-seen boundary field value, for `BoundaryField` triggers.
    boundary_value: Option<Value>,
}

// ============================================================================
// SECTION: Run Summary
// ============================================================================

/// What a completed (or aborted) run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// The run this summarizes.
    pub run_id: RunId,
    /// The run's terminal status.
    pub status: RunStatus,
    /// Rows read from the source, valid or quarantined.
    pub rows_ingested: u64,
    /// Tokens that reached a `COMPLETED` or `ROUTED` terminal outcome.
    pub tokens_completed: u64,
    /// Tokens that reached a `FAILED` terminal outcome.
    pub tokens_failed: u64,
}

// ============================================================================
// SECTION: Runner
// ============================================================================

/// Drives one run of a built pipeline to completion (§4, §5, §7).
pub struct Runner {
    /// The audit recorder.
    store: LandscapeStore,
    /// The telemetry fan-out.
    telemetry: TelemetryDispatcher,
    /// The validated graph and its routing side-tables.
    built: BuiltGraph,
    /// Plugin implementations backing the built graph's nodes.
    registry: PluginRegistry,
    /// Runtime configuration (retry, rate limit, checkpoint, telemetry,
    /// secure mode, sink error policies).
    config: OrchestratorConfig,
    /// The run being executed.
    run_id: RunId,
    /// The canonicalized pipeline configuration, hashed into the run
    /// record at `begin_run`.
    settings: Value,
    /// Entity id minters.
    ids: Ids,
    /// Sink node id → declared sink name, the reverse of
    /// `built.sink_nodes`.
    sink_names: HashMap<NodeId, String>,
    /// Token-bucket limiter governing `ExternalCall`-determinism
    /// transforms.
    rate_limiter: RateLimiter,
    /// Pending coalesce joins.
    coalesce: CoalesceExecutor,
    /// Rows buffered per aggregation node, awaiting their flush
    /// trigger.
    aggregation_buffers: HashMap<NodeId, AggregationBuffer>,
    /// Rows buffered per sink node, awaiting their next write.
    sink_buffers: HashMap<NodeId, Vec<BufferedSinkRow>>,
    /// Tokens awaiting dispatch, in FIFO order.
    queue: VecDeque<QueueItem>,
    /// Next `row_index` to assign to an ingested row.
    next_row_index: u64,
    /// Next checkpoint `sequence_number` to assign.
    checkpoint_sequence: u64,
    /// Rows read from the source so far.
    rows_ingested: u64,
    /// Tokens that reached a `COMPLETED`/`ROUTED` terminal outcome so
    /// far.
    tokens_completed: u64,
    /// Tokens that reached a `FAILED` terminal outcome so far.
    tokens_failed: u64,
}

impl Runner {
    /// Builds a runner ready to drive `run_id` to completion.
    #[must_use]
    pub fn new(
        store: LandscapeStore,
        telemetry: TelemetryDispatcher,
        built: BuiltGraph,
        registry: PluginRegistry,
        config: OrchestratorConfig,
        run_id: RunId,
        settings: Value,
    ) -> Self {
        let sink_names =
            built.sink_nodes.iter().map(|(name, node_id)| (node_id.clone(), name.clone())).collect();
        let rate_limiter = RateLimiter::new(config.rate_limit);
        let mut coalesce = CoalesceExecutor::new();
        for (name, merger) in &registry.coalesce_mergers {
            coalesce.register_merger(name.clone(), Arc::clone(merger));
        }
        Self {
            store,
            telemetry,
            built,
            registry,
            config,
            run_id,
            settings,
            ids: Ids::new(),
            sink_names,
            rate_limiter,
            coalesce,
            aggregation_buffers: HashMap::new(),
            sink_buffers: HashMap::new(),
            queue: VecDeque::new(),
            next_row_index: 0,
            checkpoint_sequence: 0,
            rows_ingested: 0,
            tokens_completed: 0,
            tokens_failed: 0,
        }
    }

    /// Runs the pipeline to completion, recording the run's terminal
    /// status before returning.
    ///
    /// # Errors
    ///
    /// Returns the first [`OrchestratorError`] raised while driving the
    /// run. The run's terminal status is always persisted as
    /// `COMPLETED` or `FAILED` before this returns, regardless of
    /// which.
    pub fn run(mut self) -> Result<RunSummary, OrchestratorError> {
        let started_at = OffsetDateTime::now_utc();
        self.store.begin_run(
            self.run_id.clone(),
            &self.settings,
            elspeth_core::hashing::CANONICAL_VERSION,
            started_at,
        )?;
        for node in &self.built.nodes {
            self.store.register_node(node)?;
        }
        for edge in self.built.graph.get_edges() {
            self.store.register_edge(edge)?;
        }
        self.telemetry.dispatch(TelemetryEvent::RunStarted {
            run_id: self.run_id.clone(),
            canonical_version: elspeth_core::hashing::CANONICAL_VERSION.to_string(),
            at: started_at,
        });

        let drive_result = self.drive();

        let status = if drive_result.is_ok() { RunStatus::Completed } else { RunStatus::Failed };
        let finished_at = OffsetDateTime::now_utc();
        self.store.complete_run(&self.run_id, status, None, finished_at)?;
        self.telemetry.dispatch(TelemetryEvent::RunFinished {
            run_id: self.run_id.clone(),
            status,
            at: finished_at,
        });
        self.telemetry.flush()?;
        self.telemetry.shutdown();

        drive_result?;
        Ok(RunSummary {
            run_id: self.run_id,
            status,
            rows_ingested: self.rows_ingested,
            tokens_completed: self.tokens_completed,
            tokens_failed: self.tokens_failed,
        })
    }

    /// Reads every row from the source, draining each row's full
    /// cascade before the next read, then drains every still-open
    /// aggregation, coalesce, and sink.
    fn drive(&mut self) -> Result<(), OrchestratorError> {
        let operation_started_at = OffsetDateTime::now_utc();
        let operation_id = OperationId::new(self.ids.operation.mint());
        self.store.begin_operation(
            operation_id.clone(),
            self.run_id.clone(),
            self.built.source_node.clone(),
            OperationType::SourceLoad,
            operation_started_at,
        )?;

        let read_result = self.read_source();

        let (status, error_message) = match &read_result {
            Ok(()) => (NodeStateStatus::Completed, None),
            Err(error) => (NodeStateStatus::Failed, Some(error.to_string())),
        };
        let operation_completed_at = OffsetDateTime::now_utc();
        self.store.complete_operation(
            &operation_id,
            status,
            None,
            error_message,
            operation_completed_at,
            operation_started_at,
        )?;
        read_result?;

        self.flush_all_aggregations()?;
        self.flush_all_coalesce()?;
        self.flush_all_sinks()?;
        Ok(())
    }

    /// The source-load pass proper: `on_start`, the read loop, then
    /// `on_complete`/`close`.
    fn read_source(&mut self) -> Result<(), OrchestratorError> {
        self.registry.source.on_start()?;
        loop {
            if self.telemetry.should_abort() {
                return Err(OrchestratorError::TelemetryExportersExhausted);
            }
            match self.registry.source.next_row()? {
                Some(source_row) => {
                    self.ingest_row(source_row)?;
                    self.tick_coalesce()?;
                }
                None => break,
            }
        }
        self.registry.source.on_complete()?;
        self.registry.source.close()?;
        Ok(())
    }

    /// Turns one row read from the source into either a validation
    /// error (quarantined rows) or a new root token, then drains its
    /// full cascade before returning.
    fn ingest_row(&mut self, source_row: SourceRow) -> Result<(), OrchestratorError> {
        let now = OffsetDateTime::now_utc();
        match source_row {
            SourceRow::Valid(data) => {
                let row_id = RowId::new(self.ids.row.mint());
                let row = self.store.create_row(
                    row_id,
                    &self.run_id,
                    &self.built.source_node,
                    self.next_row_index,
                    &data,
                    now,
                )?;
                self.next_row_index += 1;
                self.rows_ingested += 1;

                let token_id = TokenId::new(self.ids.token.mint());
                let token = self.store.create_token(token_id, &row.row_id, now)?;
                let next_target = self.continue_target(&self.built.source_node)?;
                self.queue.push_back(QueueItem { token, data, node_id: next_target });
            }
            SourceRow::Quarantined { row, error, destination } => {
                self.rows_ingested += 1;
                let schema_mode = self.registry.source.output_schema().mode;
                self.store.record_validation_error(
                    self.ids.validation_error.mint(),
                    &self.run_id,
                    Some(&self.built.source_node),
                    &row,
                    &error,
                    schema_mode,
                    &quarantine_destination_label(&destination),
                    None,
                    None,
                    now,
                )?;
                if let QuarantineDestination::Sink(sink_name) = destination {
                    let node_id = self
                        .built
                        .sink_nodes
                        .get(&sink_name)
                        .cloned()
                        .ok_or_else(|| OrchestratorError::UnconfiguredSink(sink_name.clone()))?;
                    let ctx = PluginContext { run_id: self.run_id.clone(), node_id };
                    let plugin = self
                        .registry
                        .sinks
                        .get(&sink_name)
                        .ok_or_else(|| OrchestratorError::UnconfiguredSink(sink_name.clone()))?;
                    plugin.write(std::slice::from_ref(&row), &ctx)?;
                }
            }
        }
        self.drain_queue()?;
        self.flush_all_sinks()?;
        self.maybe_checkpoint()?;
        Ok(())
    }

    /// Processes every queued item until none remain, including every
    /// item newly queued while processing another.
    fn drain_queue(&mut self) -> Result<(), OrchestratorError> {
        while let Some(item) = self.queue.pop_front() {
            self.process_item(item)?;
        }
        Ok(())
    }

    /// Dispatches one queued item by its current node's structural
    /// role.
    fn process_item(&mut self, item: QueueItem) -> Result<(), OrchestratorError> {
        let node_type = self.built.graph.get_node_info(&item.node_id)?.node_type;
        match node_type {
            NodeType::Transform => self.step_transform(item),
            NodeType::Aggregation => self.step_aggregation(item),
            NodeType::Gate => self.step_gate(item),
            NodeType::Coalesce => self.step_coalesce(item),
            NodeType::Sink => {
                let kind = if item.node_id == self.built.output_sink {
                    SinkRowKind::Completed
                } else {
                    SinkRowKind::Routed
                };
                self.sink_buffers.entry(item.node_id).or_default().push(BufferedSinkRow {
                    token: item.token,
                    data: item.data,
                    kind,
                });
                Ok(())
            }
            NodeType::Source => Ok(()),
        }
    }

    // ========================================================================
    // SECTION: Transform
    // ========================================================================

    /// Runs a row-at-a-time transform, retrying retryable failures per
    /// the configured backoff policy until it succeeds, exhausts its
    /// retry budget, or fails non-retryably.
    fn step_transform(&mut self, item: QueueItem) -> Result<(), OrchestratorError> {
        let node_id = item.node_id.clone();
        let node_info = self.built.graph.get_node_info(&node_id)?.clone();
        let creates_tokens = {
            let plugin = self
                .registry
                .transforms
                .get(&node_id)
                .ok_or_else(|| OrchestratorError::UnconfiguredTransform(node_id.clone()))?;
            plugin.creates_tokens()
        };
        let ctx = PluginContext { run_id: self.run_id.clone(), node_id: node_id.clone() };

        let retry_started = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let attempt_started_at = OffsetDateTime::now_utc();
            let input_hash = hash_canonical_json(HashAlgorithm::Sha256, &item.data)?.value;
            let state_id = StateId::new(self.ids.state.mint());
            self.store.begin_node_state(
                state_id.clone(),
                item.token.token_id.clone(),
                node_id.clone(),
                node_info.sequence_in_pipeline.unwrap_or(0),
                attempt + 1,
                input_hash,
                attempt_started_at,
            )?;

            if node_info.determinism == Determinism::ExternalCall {
                self.apply_rate_limit();
            }

            let outcome = {
                let plugin = self
                    .registry
                    .transforms
                    .get(&node_id)
                    .ok_or_else(|| OrchestratorError::UnconfiguredTransform(node_id.clone()))?;
                plugin.process(std::slice::from_ref(&item.data), &ctx)
            };
            let completed_at = OffsetDateTime::now_utc();

            if node_info.determinism == Determinism::ExternalCall {
                let status = match &outcome {
                    TransformOutcome::Success(_) => CallStatus::Success,
                    TransformOutcome::Failure { .. } => CallStatus::Error,
                };
                let duration_ms =
                    u64::try_from((completed_at - attempt_started_at).whole_milliseconds()).unwrap_or(0);
                self.telemetry.dispatch(TelemetryEvent::ExternalCallCompleted {
                    run_id: self.run_id.clone(),
                    call_id: CallId::new(self.ids.call.mint()),
                    node_id: node_id.clone(),
                    status,
                    duration_ms,
                    at: completed_at,
                });
            }

            match outcome {
                TransformOutcome::Success(outputs) => {
                    let output_hash = hash_canonical_json(HashAlgorithm::Sha256, &outputs)?.value;
                    self.store.complete_node_state(
                        &state_id,
                        NodeStateStatus::Completed,
                        Some(output_hash),
                        None,
                        completed_at,
                        attempt_started_at,
                    )?;
                    let duration_ms = u64::try_from((completed_at - attempt_started_at).whole_milliseconds())
                        .unwrap_or(0);
                    self.telemetry.dispatch(TelemetryEvent::TransformCompleted {
                        run_id: self.run_id.clone(),
                        token_id: item.token.token_id.clone(),
                        node_id: node_id.clone(),
                        duration_ms,
                        at: completed_at,
                    });
                    return self.emit_transform_outputs(&item, &node_id, outputs, creates_tokens, completed_at);
                }
                TransformOutcome::Failure { reason, retryable } => {
                    let error_json = serde_json::json!({ "reason": reason, "retryable": retryable });
                    self.store.complete_node_state(
                        &state_id,
                        NodeStateStatus::Failed,
                        None,
                        Some(&error_json),
                        completed_at,
                        attempt_started_at,
                    )?;

                    if retryable && within_retry_budget(&self.config.retry, retry_started.elapsed()) {
                        let delay = backoff_delay(&self.config.retry, attempt);
                        std::thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }

                    return self.fail_token(&item.token, &node_id, &reason, completed_at);
                }
            }
        }
    }

    /// Applies a successful transform's outputs: reuses the same token
    /// for a single-output row-at-a-time transform, or expands into one
    /// fresh token per output row for a `creates_tokens` transform.
    fn emit_transform_outputs(
        &mut self,
        item: &QueueItem,
        node_id: &NodeId,
        outputs: Vec<Value>,
        creates_tokens: bool,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        let next_target = self.continue_target(node_id)?;

        if !creates_tokens {
            if outputs.len() > 1 {
                return self.fail_token(
                    &item.token,
                    node_id,
                    "transform produced multiple output rows without declaring creates_tokens",
                    now,
                );
            }
            if let Some(data) = outputs.into_iter().next() {
                self.queue.push_back(QueueItem { token: item.token.clone(), data, node_id: next_target });
            }
            return Ok(());
        }

        if outputs.is_empty() {
            return Ok(());
        }

        let expand_group_id = self.ids.expand_group.mint();
        let children = self.store.expand_token(
            &self.run_id,
            &item.token,
            outputs,
            expand_group_id,
            |_index| TokenId::new(self.ids.token.mint()),
            None,
            now,
        )?;
        for (child_token, child_data) in children {
            self.queue.push_back(QueueItem {
                token: child_token,
                data: child_data,
                node_id: next_target.clone(),
            });
        }
        Ok(())
    }

    /// Blocks (cooperatively) until the rate limiter yields a token.
    fn apply_rate_limit(&self) {
        loop {
            match self.rate_limiter.try_acquire() {
                AcquireOutcome::Acquired => return,
                AcquireOutcome::Backoff(duration) => std::thread::sleep(duration),
            }
        }
    }

    // ========================================================================
    // SECTION: Aggregation
    // ========================================================================

    /// Buffers one row into its aggregation node, flushing first if a
    /// `BoundaryField` trigger's value just changed, and after if a
    /// `Count` trigger has been reached.
    fn step_aggregation(&mut self, item: QueueItem) -> Result<(), OrchestratorError> {
        let node_id = item.node_id.clone();
        let trigger = self
            .built
            .aggregation_triggers
            .get(&node_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnconfiguredTransform(node_id.clone()))?;

        if let crate::graph_builder::BatchTrigger::BoundaryField(field) = &trigger {
            let boundary_changed = self
                .aggregation_buffers
                .get(&node_id)
                .and_then(|buffer| buffer.boundary_value.as_ref())
                .is_some_and(|previous| *previous != item.data[field]);
            if boundary_changed {
                self.flush_aggregation(&node_id)?;
            }
        }

        let now = OffsetDateTime::now_utc();
        let buffer = self.ensure_aggregation_buffer(&node_id, now)?;
        let ordinal = u32::try_from(buffer.tokens.len()).unwrap_or(u32::MAX);
        let batch_id = buffer.batch_id.clone();
        self.store.add_batch_member(&batch_id, &item.token.token_id, ordinal)?;

        let buffer = self
            .aggregation_buffers
            .get_mut(&node_id)
            .ok_or_else(|| OrchestratorError::UnconfiguredTransform(node_id.clone()))?;
        if let crate::graph_builder::BatchTrigger::BoundaryField(field) = &trigger {
            buffer.boundary_value = Some(item.data[field].clone());
        }
        buffer.tokens.push(item.token.clone());
        buffer.rows.push(item.data.clone());
        let buffered_count = buffer.tokens.len();

        self.store.record_token_outcome(
            OutcomeId::new(self.ids.outcome.mint()),
            &self.run_id,
            &item.token.token_id,
            OutcomeDetail::ConsumedInBatch { batch_id },
            now,
            None,
        )?;

        let should_flush = match &trigger {
            crate::graph_builder::BatchTrigger::Count(count) => buffered_count >= *count,
            crate::graph_builder::BatchTrigger::BoundaryField(_)
            | crate::graph_builder::BatchTrigger::EndOfSource => false,
        };
        if should_flush {
            self.flush_aggregation(&node_id)?;
        }
        Ok(())
    }

    /// Returns the aggregation buffer for `node_id`, opening a new
    /// batch if one is not already open.
    fn ensure_aggregation_buffer(
        &mut self,
        node_id: &NodeId,
        now: OffsetDateTime,
    ) -> Result<&mut AggregationBuffer, OrchestratorError> {
        if !self.aggregation_buffers.contains_key(node_id) {
            let batch_id = BatchId::new(self.ids.batch.mint());
            self.store.create_batch(batch_id.clone(), &self.run_id, node_id, now)?;
            self.aggregation_buffers.insert(
                node_id.clone(),
                AggregationBuffer { batch_id, tokens: Vec::new(), rows: Vec::new(), boundary_value: None },
            );
        }
        self.aggregation_buffers
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::UnconfiguredTransform(node_id.clone()))
    }

    /// Flushes `node_id`'s open batch (if any) through its transform,
    /// enqueuing one fresh token per output row or failing every member
    /// token if the transform fails.
    fn flush_aggregation(&mut self, node_id: &NodeId) -> Result<(), OrchestratorError> {
        let Some(buffer) = self.aggregation_buffers.remove(node_id) else {
            return Ok(());
        };
        if buffer.tokens.is_empty() {
            return Ok(());
        }
        let now = OffsetDateTime::now_utc();
        let ctx = PluginContext { run_id: self.run_id.clone(), node_id: node_id.clone() };
        let outcome = {
            let plugin = self
                .registry
                .transforms
                .get(node_id)
                .ok_or_else(|| OrchestratorError::UnconfiguredTransform(node_id.clone()))?;
            plugin.process(&buffer.rows, &ctx)
        };

        match outcome {
            TransformOutcome::Success(outputs) => {
                let representative_row_id = buffer.tokens[0].row_id.clone();
                let next_target = self.continue_target(node_id)?;
                let mut output_token_ids = Vec::with_capacity(outputs.len());
                for data in outputs {
                    let token_id = TokenId::new(self.ids.token.mint());
                    let token = self.store.create_token(token_id.clone(), &representative_row_id, now)?;
                    output_token_ids.push(token_id);
                    self.queue.push_back(QueueItem { token, data, node_id: next_target.clone() });
                }
                self.store.flush_batch(&buffer.batch_id, &output_token_ids, now)?;
            }
            TransformOutcome::Failure { reason, .. } => {
                for token in &buffer.tokens {
                    self.fail_token(token, node_id, &reason, now)?;
                }
                self.store.flush_batch(&buffer.batch_id, &[], now)?;
            }
        }

        if matches!(self.config.checkpoint.trigger, CheckpointTrigger::AggregationBoundary) {
            self.persist_checkpoint()?;
        }
        Ok(())
    }

    /// Flushes every aggregation node with rows still buffered, then
    /// drains whatever that produced.
    fn flush_all_aggregations(&mut self) -> Result<(), OrchestratorError> {
        let node_ids: Vec<NodeId> = self.aggregation_buffers.keys().cloned().collect();
        for node_id in node_ids {
            self.flush_aggregation(&node_id)?;
        }
        self.drain_queue()
    }

    // ========================================================================
    // SECTION: Gate
    // ========================================================================

    /// Evaluates a gate's routing label (via its parsed condition or
    /// plugin) and routes the token accordingly.
    fn step_gate(&mut self, item: QueueItem) -> Result<(), OrchestratorError> {
        let node_id = item.node_id.clone();
        let node_info = self.built.graph.get_node_info(&node_id)?.clone();
        let opened_at = OffsetDateTime::now_utc();
        let input_hash = hash_canonical_json(HashAlgorithm::Sha256, &item.data)?.value;
        let state_id = StateId::new(self.ids.state.mint());
        self.store.begin_node_state(
            state_id.clone(),
            item.token.token_id.clone(),
            node_id.clone(),
            node_info.sequence_in_pipeline.unwrap_or(0),
            1,
            input_hash,
            opened_at,
        )?;

        let label = match self.evaluate_gate_label(&node_id, &item.data) {
            Ok(label) => label,
            Err(error) => {
                let error_json = serde_json::json!({ "error": error.to_string() });
                let failed_at = OffsetDateTime::now_utc();
                self.store.complete_node_state(
                    &state_id,
                    NodeStateStatus::Failed,
                    None,
                    Some(&error_json),
                    failed_at,
                    opened_at,
                )?;
                return self.fail_token(&item.token, &node_id, &error.to_string(), failed_at);
            }
        };

        let evaluated_at = OffsetDateTime::now_utc();
        let output_hash = hash_canonical_json(HashAlgorithm::Sha256, &serde_json::json!(label))?.value;
        self.store.complete_node_state(
            &state_id,
            NodeStateStatus::Completed,
            Some(output_hash),
            None,
            evaluated_at,
            opened_at,
        )?;
        self.telemetry.dispatch(TelemetryEvent::GateEvaluated {
            run_id: self.run_id.clone(),
            token_id: item.token.token_id.clone(),
            node_id: node_id.clone(),
            result: serde_json::json!(label),
            at: evaluated_at,
        });

        self.route_gate_token(&item, &node_id, &label, &state_id, evaluated_at)
    }

    /// Computes a gate's route label: the stringified result of its
    /// parsed condition for a config-gate, or the plugin's chosen label
    /// for a plugin-backed gate.
    fn evaluate_gate_label(&self, node_id: &NodeId, data: &Value) -> Result<String, OrchestratorError> {
        if let Some(condition) = self.built.gate_conditions.get(node_id) {
            let value = condition.evaluate(data)?;
            return Ok(stringify_route_label(&value));
        }
        let ctx = PluginContext { run_id: self.run_id.clone(), node_id: node_id.clone() };
        let plugin = self
            .registry
            .gates
            .get(node_id)
            .ok_or_else(|| OrchestratorError::UnconfiguredGate(node_id.clone()))?;
        let decision = plugin.evaluate(data, &ctx)?;
        Ok(decision.label)
    }

    /// Routes a token per its gate's declared target for `label`:
    /// continues it, buffers it onto a sink, or forks it across
    /// branches.
    fn route_gate_token(
        &mut self,
        item: &QueueItem,
        node_id: &NodeId,
        label: &str,
        state_id: &StateId,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        let target = self
            .built
            .gate_routing
            .get(node_id)
            .and_then(|routing| routing.routes.get(label))
            .cloned()
            .ok_or_else(|| OrchestratorError::UnresolvedRoute {
                node_id: node_id.clone(),
                label: label.to_string(),
            })?;
        let routing_group_id = self.ids.routing_group.mint();

        match target {
            RouteTarget::Continue | RouteTarget::Sink(_) => {
                let edge = self
                    .built
                    .graph
                    .resolve_route(node_id, label)
                    .ok_or_else(|| OrchestratorError::UnresolvedRoute {
                        node_id: node_id.clone(),
                        label: label.to_string(),
                    })?
                    .clone();
                self.record_routing_crossing(state_id, &edge, &routing_group_id, 0, now)?;
                self.queue.push_back(QueueItem {
                    token: item.token.clone(),
                    data: item.data.clone(),
                    node_id: edge.to_node_id,
                });
            }
            RouteTarget::Fork { fork_to } => {
                let fork_group_id = self.ids.fork_group.mint();
                let children = self.store.fork_token(
                    &self.run_id,
                    &item.token,
                    &item.data,
                    &fork_to,
                    fork_group_id,
                    |_index| TokenId::new(self.ids.token.mint()),
                    None,
                    now,
                )?;
                for (ordinal, (branch, (child_token, child_data))) in
                    fork_to.iter().zip(children).enumerate()
                {
                    let edge = self
                        .built
                        .graph
                        .resolve_route(node_id, branch)
                        .ok_or_else(|| OrchestratorError::UnresolvedRoute {
                            node_id: node_id.clone(),
                            label: branch.clone(),
                        })?
                        .clone();
                    self.record_routing_crossing(
                        state_id,
                        &edge,
                        &routing_group_id,
                        u32::try_from(ordinal).unwrap_or(u32::MAX),
                        now,
                    )?;
                    self.queue.push_back(QueueItem {
                        token: child_token,
                        data: child_data,
                        node_id: edge.to_node_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Records one edge crossing for a routing decision.
    fn record_routing_crossing(
        &self,
        state_id: &StateId,
        edge: &elspeth_core::model::Edge,
        routing_group_id: &str,
        ordinal: u32,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        self.store.record_routing_event(
            self.ids.event.mint(),
            state_id,
            &edge.edge_id,
            routing_group_id.to_string(),
            ordinal,
            edge.default_mode,
            None,
            now,
        )?;
        Ok(())
    }

    // ========================================================================
    // SECTION: Coalesce
    // ========================================================================

    /// Feeds one branch arrival into its coalesce node, resolving
    /// immediately if it completes a join.
    fn step_coalesce(&mut self, item: QueueItem) -> Result<(), OrchestratorError> {
        let node_id = item.node_id.clone();
        let config = self
            .built
            .coalesce_configs
            .get(&node_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnconfiguredCoalesce(node_id.clone()))?;
        let now = OffsetDateTime::now_utc();
        let branch = item.token.branch_name.clone().unwrap_or_else(|| node_id.to_string());
        let row_id = item.token.row_id.clone();
        let arrival = BranchArrival { branch, token: item.token.clone(), data: item.data.clone() };

        let outcome = self.coalesce.accept(&config, node_id.clone(), row_id, arrival, now)?;
        match outcome {
            AcceptOutcome::Pending => Ok(()),
            AcceptOutcome::Ready(ready) => self.resolve_coalesce_ready(&node_id, &config, ready, now),
        }
    }

    /// Merges a ready join's members into one coalesced token and
    /// queues it for the node after the coalesce.
    fn resolve_coalesce_ready(
        &mut self,
        node_id: &NodeId,
        config: &CoalesceNodeConfig,
        ready: ReadyJoin,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        let merged = self.coalesce.merge(config, &ready)?;
        let members: Vec<Token> = ready.members.iter().map(|arrival| arrival.token.clone()).collect();
        let join_group_id = self.ids.join_group.mint();
        let coalesced_token_id = TokenId::new(self.ids.token.mint());
        let (token, data) =
            self.store.coalesce_tokens(&self.run_id, &members, merged, join_group_id, coalesced_token_id, now)?;
        let next_target = self.continue_target(node_id)?;
        self.queue.push_back(QueueItem { token, data, node_id: next_target });
        Ok(())
    }

    /// Records a `FAILED` outcome for every member of a join that could
    /// not be resolved under its policy.
    fn fail_coalesce_members(
        &mut self,
        node_id: &NodeId,
        error: &CoalesceError,
        members: Vec<BranchArrival>,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        let reason = error.to_string();
        for arrival in members {
            self.fail_token(&arrival.token, node_id, &reason, now)?;
        }
        Ok(())
    }

    /// Resolves any coalesce join whose timeout has elapsed.
    fn tick_coalesce(&mut self) -> Result<(), OrchestratorError> {
        let now = OffsetDateTime::now_utc();
        let resolutions = self.coalesce.tick(&self.built.coalesce_configs, now);
        self.apply_coalesce_resolutions(resolutions, now)
    }

    /// Drains every still-pending coalesce join at end-of-source under
    /// its terminal rule.
    fn flush_all_coalesce(&mut self) -> Result<(), OrchestratorError> {
        let now = OffsetDateTime::now_utc();
        let resolutions = self.coalesce.flush_pending(&self.built.coalesce_configs);
        self.apply_coalesce_resolutions(resolutions, now)
    }

    /// Applies a batch of coalesce resolutions (fired joins merged and
    /// queued, failed joins' members marked `FAILED`), then drains the
    /// queue.
    fn apply_coalesce_resolutions(
        &mut self,
        resolutions: Vec<((NodeId, RowId), ResolveOutcome)>,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        for ((node_id, _row_id), resolution) in resolutions {
            match resolution {
                ResolveOutcome::Fired(ready) => {
                    let config = self
                        .built
                        .coalesce_configs
                        .get(&node_id)
                        .cloned()
                        .ok_or_else(|| OrchestratorError::UnconfiguredCoalesce(node_id.clone()))?;
                    self.resolve_coalesce_ready(&node_id, &config, ready, now)?;
                }
                ResolveOutcome::Failed { error, members } => {
                    self.fail_coalesce_members(&node_id, &error, members, now)?;
                }
            }
        }
        self.drain_queue()
    }

    // ========================================================================
    // SECTION: Sink
    // ========================================================================

    /// Writes `node_id`'s buffered rows (if any), recording the
    /// produced artifact and a terminal outcome per row on success, or
    /// applying the sink's error policy on failure.
    fn flush_sink(&mut self, node_id: &NodeId) -> Result<(), OrchestratorError> {
        let Some(rows) = self.sink_buffers.remove(node_id) else {
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }
        let sink_name = self
            .sink_names
            .get(node_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnconfiguredSink(node_id.to_string()))?;
        let now = OffsetDateTime::now_utc();
        let ctx = PluginContext { run_id: self.run_id.clone(), node_id: node_id.clone() };
        let data: Vec<Value> = rows.iter().map(|row| row.data.clone()).collect();

        let write_result = {
            let plugin = self
                .registry
                .sinks
                .get(&sink_name)
                .ok_or_else(|| OrchestratorError::UnconfiguredSink(sink_name.clone()))?;
            plugin.write(&data, &ctx)
        };

        match write_result {
            Ok(artifact) => {
                let operation_id = OperationId::new(self.ids.operation.mint());
                self.store.begin_operation(
                    operation_id.clone(),
                    self.run_id.clone(),
                    node_id.clone(),
                    OperationType::SinkWrite,
                    now,
                )?;
                self.store.record_artifact(
                    ArtifactId::new(self.ids.artifact.mint()),
                    &self.run_id,
                    None,
                    node_id,
                    "sink_write",
                    &artifact.path_or_uri,
                    &artifact.content_hash,
                    artifact.size_bytes,
                    now,
                )?;
                let completed_at = OffsetDateTime::now_utc();
                self.store.complete_operation(
                    &operation_id,
                    NodeStateStatus::Completed,
                    Some(artifact.content_hash.clone()),
                    None,
                    completed_at,
                    now,
                )?;
                for row in &rows {
                    let detail = match row.kind {
                        SinkRowKind::Completed => OutcomeDetail::Completed { sink_name: sink_name.clone() },
                        SinkRowKind::Routed => OutcomeDetail::Routed { sink_name: sink_name.clone() },
                    };
                    self.store.record_token_outcome(
                        OutcomeId::new(self.ids.outcome.mint()),
                        &self.run_id,
                        &row.token.token_id,
                        detail,
                        completed_at,
                        None,
                    )?;
                    self.tokens_completed += 1;
                    self.telemetry.dispatch(TelemetryEvent::TokenCompleted {
                        run_id: self.run_id.clone(),
                        token_id: row.token.token_id.clone(),
                        outcome: row.kind.outcome(),
                        at: completed_at,
                    });
                }
                Ok(())
            }
            Err(write_error) => self.handle_sink_failure(node_id, &sink_name, rows, write_error, now),
        }
    }

    /// Applies a failed sink write's error policy: aborts the run under
    /// `STRICT` secure mode, fails every buffered token, or re-routes
    /// them to a named error sink.
    fn handle_sink_failure(
        &mut self,
        node_id: &NodeId,
        sink_name: &str,
        rows: Vec<BufferedSinkRow>,
        write_error: SinkError,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        let reason = write_error.to_string();
        if matches!(self.config.secure_mode, SecureMode::Strict) {
            return Err(OrchestratorError::Sink(write_error));
        }

        let policy =
            self.config.sink_error_policies.get(sink_name).cloned().unwrap_or(SinkErrorPolicy::FailTokens);
        match policy {
            SinkErrorPolicy::FailTokens => {
                for row in &rows {
                    self.fail_token(&row.token, node_id, &reason, now)?;
                }
                Ok(())
            }
            SinkErrorPolicy::RouteTo(error_sink_name) => {
                let error_node_id = self
                    .built
                    .sink_nodes
                    .get(&error_sink_name)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::UnconfiguredSink(error_sink_name.clone()))?;
                if &error_node_id == node_id {
                    for row in &rows {
                        self.fail_token(&row.token, node_id, &reason, now)?;
                    }
                    return Ok(());
                }
                for row in rows {
                    self.sink_buffers.entry(error_node_id.clone()).or_default().push(BufferedSinkRow {
                        token: row.token,
                        data: row.data,
                        kind: SinkRowKind::Routed,
                    });
                }
                self.flush_sink(&error_node_id)
            }
        }
    }

    /// Flushes every sink with rows still buffered.
    fn flush_all_sinks(&mut self) -> Result<(), OrchestratorError> {
        let node_ids: Vec<NodeId> = self.sink_buffers.keys().cloned().collect();
        for node_id in node_ids {
            self.flush_sink(&node_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // SECTION: Checkpoint
    // ========================================================================

    /// Persists a checkpoint if the configured trigger fires on the row
    /// just finished.
    fn maybe_checkpoint(&mut self) -> Result<(), OrchestratorError> {
        let should = match self.config.checkpoint.trigger {
            CheckpointTrigger::EveryRow => true,
            CheckpointTrigger::EveryNRows(n) => n > 0 && self.next_row_index % n == 0,
            CheckpointTrigger::AggregationBoundary => false,
        };
        if should {
            self.persist_checkpoint()?;
        }
        Ok(())
    }

    /// Persists one checkpoint per aggregation node with rows currently
    /// buffered.
    fn persist_checkpoint(&mut self) -> Result<(), OrchestratorError> {
        let now = OffsetDateTime::now_utc();
        let topology_hash = checkpoint::topology_hash(&self.built.graph)?;
        self.checkpoint_sequence += 1;
        let sequence_number = self.checkpoint_sequence;
        let format_version = self.config.checkpoint.format_version;

        for (node_id, buffer) in &self.aggregation_buffers {
            let Some(representative_token) = buffer.tokens.last() else {
                continue;
            };
            let state = serde_json::json!({
                "buffered_rows": buffer.rows,
                "boundary_value": buffer.boundary_value,
            });
            let node_config_hash = self.built.graph.get_node_info(node_id)?.config_hash.clone();
            self.store.create_checkpoint(
                CheckpointId::new(self.ids.checkpoint.mint()),
                &self.run_id,
                &representative_token.token_id,
                node_id,
                sequence_number,
                Some(&state),
                &topology_hash,
                &node_config_hash,
                format_version,
                now,
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // SECTION: Shared Helpers
    // ========================================================================

    /// Resolves the `continue` edge leaving `node_id`.
    fn continue_target(&self, node_id: &NodeId) -> Result<NodeId, OrchestratorError> {
        self.built
            .graph
            .resolve_route(node_id, "continue")
            .map(|edge| edge.to_node_id.clone())
            .ok_or_else(|| OrchestratorError::UnresolvedRoute {
                node_id: node_id.clone(),
                label: "continue".to_string(),
            })
    }

    /// Records a token's terminal `FAILED` outcome and its telemetry
    /// event.
    fn fail_token(
        &mut self,
        token: &Token,
        node_id: &NodeId,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<(), OrchestratorError> {
        let error_hash = hash_canonical_json(HashAlgorithm::Sha256, &serde_json::json!({ "reason": reason }))?
            .value;
        self.store.record_token_outcome(
            OutcomeId::new(self.ids.outcome.mint()),
            &self.run_id,
            &token.token_id,
            OutcomeDetail::Failed { error_hash },
            now,
            Some(&serde_json::json!({ "node_id": node_id.as_str(), "reason": reason })),
        )?;
        self.tokens_failed += 1;
        self.telemetry.dispatch(TelemetryEvent::TokenCompleted {
            run_id: self.run_id.clone(),
            token_id: token.token_id.clone(),
            outcome: Outcome::Failed,
            at: now,
        });
        Ok(())
    }
}

/// Labels a quarantine destination for the `validation_errors.destination`
/// column.
fn quarantine_destination_label(destination: &QuarantineDestination) -> String {
    match destination {
        QuarantineDestination::Sink(name) => name.clone(),
        QuarantineDestination::Discard => "discard".to_string(),
    }
}

/// Renders a gate condition's (or plugin's) result as a route label:
/// the raw text of a JSON string, or the JSON form of anything else
/// (`true`/`false` for booleans, the literal digits for numbers).
fn stringify_route_label(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use elspeth_coalesce::CoalesceNodeConfig;
    use elspeth_coalesce::CoalescePolicy;
    use elspeth_coalesce::MergeStrategy;
    use elspeth_core::model::SchemaContract;
    use elspeth_core::model::SchemaMode;
    use elspeth_store_sqlite::SqliteStoreConfig;
    use elspeth_telemetry::BackpressureMode;
    use elspeth_telemetry::DispatcherConfig;
    use elspeth_telemetry::Granularity;

    use super::*;
    use crate::config::CheckpointConfig;
    use crate::config::ConcurrencyConfig;
    use crate::config::GateRoutingConfig;
    use crate::config::RateLimitConfig;
    use crate::config::RetryConfig;
    use crate::graph_builder::CoalesceDeclaration;
    use crate::graph_builder::GateDeclaration;
    use crate::graph_builder::NodeDeclaration;
    use crate::graph_builder::PipelineConfig;
    use crate::graph_builder::build_graph;
    use crate::plugin::ArtifactDescriptor;
    use crate::plugin::SourceError;

    fn schema_contract() -> SchemaContract {
        SchemaContract { fields: Vec::new(), mode: SchemaMode::Observed, locked: false }
    }

    fn node_decl(name: &str, plugin: &str) -> NodeDeclaration {
        NodeDeclaration {
            name: name.to_string(),
            plugin: plugin.to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            options: json!({}),
        }
    }

    fn dispatcher_config() -> DispatcherConfig {
        DispatcherConfig {
            enabled: true,
            granularity: Granularity::Debug,
            backpressure_mode: BackpressureMode::Block,
            queue_capacity: 64,
            max_consecutive_failures: 3,
            fail_on_total_exporter_failure: false,
        }
    }

    fn test_orchestrator_config() -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                exponential_base: 2.0,
                jitter: 0.0,
                max_capacity_retry_seconds: 5,
            },
            rate_limit: RateLimitConfig::default(),
            checkpoint: CheckpointConfig::default(),
            telemetry: dispatcher_config(),
            secure_mode: SecureMode::Strict,
            sink_error_policies: HashMap::new(),
        }
    }

    /// Yields a fixed, preloaded row sequence, then `None`.
    struct VecSource {
        rows: std::vec::IntoIter<SourceRow>,
        schema: SchemaContract,
    }

    impl VecSource {
        fn new(rows: Vec<SourceRow>) -> Self {
            Self { rows: rows.into_iter(), schema: schema_contract() }
        }
    }

    impl Source for VecSource {
        fn determinism(&self) -> Determinism {
            Determinism::Deterministic
        }

        fn plugin_version(&self) -> &str {
            "1.0.0"
        }

        fn output_schema(&self) -> &SchemaContract {
            &self.schema
        }

        fn next_row(&mut self) -> Result<Option<SourceRow>, SourceError> {
            Ok(self.rows.next())
        }
    }

    /// Passes every row through unchanged.
    struct IdentityTransform;

    impl Transform for IdentityTransform {
        fn process(&self, rows: &[Value], _ctx: &PluginContext) -> TransformOutcome {
            TransformOutcome::Success(rows.to_vec())
        }
    }

    /// Fails the first attempt with a retryable error, then succeeds.
    struct FailOnceTransform {
        attempts: AtomicU32,
    }

    impl Transform for FailOnceTransform {
        fn process(&self, rows: &[Value], _ctx: &PluginContext) -> TransformOutcome {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                TransformOutcome::Failure {
                    reason: "transient capacity error".to_string(),
                    retryable: true,
                }
            } else {
                TransformOutcome::Success(rows.to_vec())
            }
        }
    }

    /// Appends every written row to a shared, externally inspectable
    /// buffer instead of touching any real storage.
    struct RecordingSink {
        rows: Arc<Mutex<Vec<Value>>>,
    }

    impl Sink for RecordingSink {
        fn write(&self, rows: &[Value], _ctx: &PluginContext) -> Result<ArtifactDescriptor, SinkError> {
            self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend_from_slice(rows);
            Ok(ArtifactDescriptor {
                path_or_uri: "mem://sink".to_string(),
                content_hash: "deadbeef".to_string(),
                size_bytes: 0,
            })
        }
    }

    fn build_runner(pipeline: PipelineConfig, registry: PluginRegistry) -> Runner {
        let run_id = RunId::new("run-test");
        let now = OffsetDateTime::now_utc();
        let built = build_graph(&pipeline, &run_id, now).unwrap();
        let store = LandscapeStore::open(&SqliteStoreConfig::in_memory()).unwrap();
        let telemetry = TelemetryDispatcher::new(dispatcher_config()).unwrap();
        let settings = serde_json::to_value(&pipeline).unwrap();
        Runner::new(store, telemetry, built, registry, pipeline.orchestrator_config.clone(), run_id, settings)
    }

    #[test]
    fn happy_path_single_sink_run_completes_every_row() {
        let source = Box::new(VecSource::new(vec![
            SourceRow::Valid(json!({ "id": 1 })),
            SourceRow::Valid(json!({ "id": 2 })),
        ]));

        let mut sinks = HashMap::new();
        sinks.insert("out".to_string(), node_decl("out", "recording-sink"));

        let pipeline = PipelineConfig {
            datasource: node_decl("in", "vec-source"),
            row_plugins: vec![node_decl("passthrough", "identity")],
            aggregations: Vec::new(),
            gates: Vec::new(),
            coalesce: Vec::new(),
            sinks,
            output_sink: "out".to_string(),
            orchestrator_config: test_orchestrator_config(),
        };

        let captured = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new(source)
            .with_transform(NodeId::new("transform:passthrough"), Box::new(IdentityTransform))
            .with_sink("out", Box::new(RecordingSink { rows: Arc::clone(&captured) }));

        let summary = build_runner(pipeline, registry).run().unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.rows_ingested, 2);
        assert_eq!(summary.tokens_completed, 2);
        assert_eq!(summary.tokens_failed, 0);
        assert_eq!(captured.lock().unwrap().len(), 2);
    }

    #[test]
    fn boolean_gate_routes_tokens_to_named_sinks() {
        let source = Box::new(VecSource::new(vec![
            SourceRow::Valid(json!({ "id": 1, "flag": true })),
            SourceRow::Valid(json!({ "id": 2, "flag": false })),
        ]));

        let mut sinks = HashMap::new();
        sinks.insert("approved".to_string(), node_decl("approved", "recording-sink"));
        sinks.insert("rejected".to_string(), node_decl("rejected", "recording-sink"));

        let mut routes = HashMap::new();
        routes.insert("true".to_string(), RouteTarget::Sink("approved".to_string()));
        routes.insert("false".to_string(), RouteTarget::Sink("rejected".to_string()));

        let pipeline = PipelineConfig {
            datasource: node_decl("in", "vec-source"),
            row_plugins: Vec::new(),
            aggregations: Vec::new(),
            gates: vec![GateDeclaration {
                node: node_decl("flagcheck", "config-gate"),
                condition: Some("row['flag'] == true".to_string()),
                routes: GateRoutingConfig { routes },
            }],
            coalesce: Vec::new(),
            sinks,
            output_sink: "approved".to_string(),
            orchestrator_config: test_orchestrator_config(),
        };

        let approved = Arc::new(Mutex::new(Vec::new()));
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new(source)
            .with_sink("approved", Box::new(RecordingSink { rows: Arc::clone(&approved) }))
            .with_sink("rejected", Box::new(RecordingSink { rows: Arc::clone(&rejected) }));

        let summary = build_runner(pipeline, registry).run().unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.tokens_completed, 2);
        assert_eq!(approved.lock().unwrap().len(), 1);
        assert_eq!(rejected.lock().unwrap().len(), 1);
    }

    #[test]
    fn quarantined_row_bypasses_token_creation_and_skips_the_primary_sink() {
        let source = Box::new(VecSource::new(vec![
            SourceRow::Valid(json!({ "id": 1 })),
            SourceRow::Quarantined {
                row: json!({ "id": "not-a-number" }),
                error: "id must be numeric".to_string(),
                destination: QuarantineDestination::Sink("quarantine".to_string()),
            },
        ]));

        let mut sinks = HashMap::new();
        sinks.insert("out".to_string(), node_decl("out", "recording-sink"));
        sinks.insert("quarantine".to_string(), node_decl("quarantine", "recording-sink"));

        let pipeline = PipelineConfig {
            datasource: node_decl("in", "vec-source"),
            row_plugins: Vec::new(),
            aggregations: Vec::new(),
            gates: Vec::new(),
            coalesce: Vec::new(),
            sinks,
            output_sink: "out".to_string(),
            orchestrator_config: test_orchestrator_config(),
        };

        let out = Arc::new(Mutex::new(Vec::new()));
        let quarantine = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new(source)
            .with_sink("out", Box::new(RecordingSink { rows: Arc::clone(&out) }))
            .with_sink("quarantine", Box::new(RecordingSink { rows: Arc::clone(&quarantine) }));

        let summary = build_runner(pipeline, registry).run().unwrap();

        assert_eq!(summary.rows_ingested, 2);
        assert_eq!(summary.tokens_completed, 1);
        assert_eq!(out.lock().unwrap().len(), 1);
        assert_eq!(quarantine.lock().unwrap().len(), 1);
    }

    #[test]
    fn transform_retries_a_retryable_failure_then_completes() {
        let source = Box::new(VecSource::new(vec![SourceRow::Valid(json!({ "id": 1 }))]));

        let mut sinks = HashMap::new();
        sinks.insert("out".to_string(), node_decl("out", "recording-sink"));

        let pipeline = PipelineConfig {
            datasource: node_decl("in", "vec-source"),
            row_plugins: vec![node_decl("flaky", "flaky-transform")],
            aggregations: Vec::new(),
            gates: Vec::new(),
            coalesce: Vec::new(),
            sinks,
            output_sink: "out".to_string(),
            orchestrator_config: test_orchestrator_config(),
        };

        let out = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new(source)
            .with_transform(
                NodeId::new("transform:flaky"),
                Box::new(FailOnceTransform { attempts: AtomicU32::new(0) }),
            )
            .with_sink("out", Box::new(RecordingSink { rows: Arc::clone(&out) }));

        let summary = build_runner(pipeline, registry).run().unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.tokens_completed, 1);
        assert_eq!(summary.tokens_failed, 0);
        assert_eq!(out.lock().unwrap().len(), 1);
    }

    #[test]
    fn forked_branches_coalesce_into_one_merged_token() {
        let source = Box::new(VecSource::new(vec![SourceRow::Valid(json!({ "id": 1 }))]));

        let mut sinks = HashMap::new();
        sinks.insert("out".to_string(), node_decl("out", "recording-sink"));

        let mut routes = HashMap::new();
        routes.insert("true".to_string(), RouteTarget::Fork { fork_to: vec!["a".to_string(), "b".to_string()] });
        routes.insert("false".to_string(), RouteTarget::Continue);

        let pipeline = PipelineConfig {
            datasource: node_decl("in", "vec-source"),
            row_plugins: Vec::new(),
            aggregations: Vec::new(),
            gates: vec![GateDeclaration {
                node: node_decl("fork_gate", "config-gate"),
                condition: Some("row['id'] >= 0".to_string()),
                routes: GateRoutingConfig { routes },
            }],
            coalesce: vec![CoalesceDeclaration {
                node: node_decl("join", "coalesce-join"),
                config: CoalesceNodeConfig {
                    branches: vec!["a".to_string(), "b".to_string()],
                    policy: CoalescePolicy::RequireAll,
                    merge: MergeStrategy::Union,
                    timeout_seconds: None,
                },
            }],
            sinks,
            output_sink: "out".to_string(),
            orchestrator_config: test_orchestrator_config(),
        };

        let out = Arc::new(Mutex::new(Vec::new()));
        let registry =
            PluginRegistry::new(source).with_sink("out", Box::new(RecordingSink { rows: Arc::clone(&out) }));

        let summary = build_runner(pipeline, registry).run().unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.rows_ingested, 1);
        assert_eq!(summary.tokens_completed, 1);
        assert_eq!(summary.tokens_failed, 0);
        assert_eq!(out.lock().unwrap().len(), 1);
    }
}
