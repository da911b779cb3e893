// crates/elspeth-orchestrator/src/config.rs
// ============================================================================
// Module: ELSPETH Orchestrator Configuration
// Description: Concurrency, retry, rate-limit, checkpoint, and routing
//              configuration shapes the orchestrator core accepts (§6.2,
//              §5).
// ============================================================================

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use elspeth_telemetry::DispatcherConfig;

/// Worker pool sizing (§5: "A pool of worker threads (bounded by
/// `concurrency.max_workers`) processes rows").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Number of worker threads processing rows concurrently.
    pub max_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

/// Row-level retry policy for capacity errors (§5: "exponential backoff
/// + jitter").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub exponential_base: f64,
    /// Jitter fraction (0.0–1.0) applied to each computed delay.
    pub jitter: f64,
    /// Upper bound, in seconds, on total time spent retrying a single
    /// capacity-limited call before giving up.
    pub max_capacity_retry_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: 0.2,
            max_capacity_retry_seconds: 120,
        }
    }
}

/// Token-bucket rate limiting for outbound external calls (§5: "Rate
/// limiter governs outbound external calls per service").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state request rate.
    pub requests_per_second: f64,
    /// Maximum burst size above the steady-state rate.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_second: 10.0, burst: 10 }
    }
}

/// When a checkpoint is persisted (§4.9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Persist a checkpoint after every row.
    EveryRow,
    /// Persist a checkpoint every `n` rows.
    EveryNRows(u64),
    /// Persist a checkpoint only at aggregation (batch flush)
    /// boundaries.
    AggregationBoundary,
}

/// Checkpoint configuration (§4.9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// When checkpoints are persisted.
    pub trigger: CheckpointTrigger,
    /// Checkpoint format version this build writes (§4.9.1: "format_version = 2").
    pub format_version: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { trigger: CheckpointTrigger::EveryRow, format_version: CURRENT_CHECKPOINT_FORMAT_VERSION }
    }
}

/// The checkpoint format version this build writes and accepts for
/// resume (§4.9.1, §4.9.2: exact-match only, neither older nor newer).
pub const CURRENT_CHECKPOINT_FORMAT_VERSION: u32 = 2;

/// Secure-mode posture (§5: "STRICT secure mode converts any sink
/// failure into a run-abort with non-zero exit").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureMode {
    /// Sink failures abort the run.
    Strict,
    /// Sink failures attach to the affected tokens; the run continues.
    Permissive,
}

/// Top-level orchestrator configuration (§6.2: `orchestrator_config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker pool sizing.
    pub concurrency: ConcurrencyConfig,
    /// Row-level retry policy.
    pub retry: RetryConfig,
    /// Outbound call rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Checkpoint cadence and format.
    pub checkpoint: CheckpointConfig,
    /// Telemetry dispatcher settings.
    pub telemetry: DispatcherConfig,
    /// Secure-mode posture.
    pub secure_mode: SecureMode,
    /// Per-sink error-handling policy. A sink with no entry here
    /// defaults to [`SinkErrorPolicy::FailTokens`] (§4.7.2).
    #[serde(default)]
    pub sink_error_policies: HashMap<String, SinkErrorPolicy>,
}

// ============================================================================
// SECTION: Gate Routing
// ============================================================================

/// One route target a gate's label may resolve to (§6.2: "any subset of
/// sink names plus `continue` and `fork` is allowed, with `fork_to`
/// required when `fork` appears").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Advance the token to the next node in topological order.
    Continue,
    /// Move or copy the token onto a named sink's edge.
    Sink(String),
    /// Expand the token into one child per named branch (C4 fork).
    Fork {
        /// Branch names, each becoming one child token.
        fork_to: Vec<String>,
    },
}

/// Declared routing table for one gate node (§6.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRoutingConfig {
    /// Route label → target. For a statically-boolean condition, keys
    /// must be exactly `{"true", "false"}` (§6.2).
    pub routes: HashMap<String, RouteTarget>,
}

/// A sink's behavior when its batch write fails (§4.7.2: "unless the
/// sink's `on_error` policy routes rows to a named error sink").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkErrorPolicy {
    /// Fail every token in the batch.
    FailTokens,
    /// Route every token in the batch to a named error sink instead.
    RouteTo(String),
}
