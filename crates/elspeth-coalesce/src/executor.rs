// crates/elspeth-coalesce/src/executor.rs
// ============================================================================
// Module: ELSPETH Coalesce Executor
// Description: Time-aware join engine merging parallel-path tokens (C8).
// ============================================================================

//! ## Overview
//! [`CoalesceExecutor`] holds one [`PendingJoin`] per `(coalesce node,
//! row)` in memory, exactly as described in §9's design notes ("in-memory
//! map keyed by `(coalesce_node_id, row_id)`"). A join can fire three
//! ways: naturally, the moment [`CoalesceExecutor::accept`] sees the
//! policy's condition satisfied; on a caller-driven [`CoalesceExecutor::tick`]
//! once a declared `timeout_seconds` has elapsed; or at end-of-source via
//! [`CoalesceExecutor::flush_pending`], which resolves every remaining
//! pending join under its policy's terminal rule regardless of timeout.
//!
//! This crate never writes to the audit trail itself: resolving a
//! [`ReadyJoin`] into a coalesced [`elspeth_core::model::Token`] and
//! recording `COALESCED`/`FAILED` outcomes for every consumed branch
//! token is the orchestrator's job, composing this executor with
//! `elspeth-store-sqlite::LandscapeStore::coalesce_tokens` (§4.8: "every
//! consumed branch token gets an explicit outcome, success or failure").

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use time::Duration;
use time::OffsetDateTime;

use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RowId;
use elspeth_core::model::Token;

use crate::error::CoalesceError;
use crate::policy::CoalesceNodeConfig;
use crate::policy::CoalescePolicy;
use crate::policy::MergeStrategy;

/// One branch's arrival at a coalesce node: the token that carried it and
/// the row data it contributed.
#[derive(Debug, Clone)]
pub struct BranchArrival {
    /// The branch name this arrival was routed under.
    pub branch: String,
    /// The token consumed by the join.
    pub token: Token,
    /// The row payload the branch carried.
    pub data: Value,
}

/// State held for one in-flight join: branches seen so far, keyed by
/// branch name so a duplicate arrival is detectable.
#[derive(Debug, Clone)]
struct PendingJoin {
    arrivals: HashMap<String, BranchArrival>,
    first_seen_at: OffsetDateTime,
}

/// A resolved join, ready to be merged and recorded.
#[derive(Debug, Clone)]
pub struct ReadyJoin {
    /// The coalesce node that resolved this join.
    pub node_id: NodeId,
    /// The row being joined.
    pub row_id: RowId,
    /// Every branch arrival consumed by this join, in the coalesce
    /// node's declared branch order (arrivals for undeclared branches,
    /// which should not occur under a validated graph, are appended
    /// after the declared ones).
    pub members: Vec<BranchArrival>,
}

/// Outcome of [`CoalesceExecutor::accept`].
#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    /// The branch was recorded; the join is still waiting on others.
    Pending,
    /// The join's policy condition was satisfied by this arrival.
    Ready(ReadyJoin),
}

/// Outcome of resolving a pending join via [`CoalesceExecutor::tick`] or
/// [`CoalesceExecutor::flush_pending`].
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// The join fired successfully.
    Fired(ReadyJoin),
    /// The join's policy was not satisfied by the time it was forced to
    /// resolve (timeout or end-of-source) and is not `best_effort`. Carries
    /// every branch arrival that had in fact shown up, so a caller can
    /// still attribute a terminal outcome to each consumed branch token
    /// (§4.8: "every consumed branch token's outcome is recorded as FAILED").
    Failed {
        /// Why the join could not resolve.
        error: CoalesceError,
        /// The branch arrivals that had shown up before resolution was
        /// forced, in branch-name order.
        members: Vec<BranchArrival>,
    },
}

/// A plugin-defined merge strategy (§6.1: "Coalesce merger"), registered
/// with the executor under the name a [`MergeStrategy::Custom`] refers
/// to.
pub trait CoalesceMerger: Send + Sync {
    /// Merges the arrived branch outputs into one row.
    ///
    /// # Errors
    ///
    /// Returns any error describing why the merge could not be
    /// performed; the executor wraps it in
    /// [`CoalesceError::MergerFailed`].
    fn merge(&self, members: &[BranchArrival]) -> Result<Value, String>;
}

/// Holds pending joins and dispatches merges once they resolve (§4.8).
#[derive(Default)]
pub struct CoalesceExecutor {
    pending: HashMap<(NodeId, RowId), PendingJoin>,
    mergers: HashMap<String, Arc<dyn CoalesceMerger>>,
}

impl CoalesceExecutor {
    /// Creates an executor with no pending joins and no registered
    /// custom mergers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a [`CoalesceMerger`] under `name`, making it available
    /// to any coalesce node configured with `MergeStrategy::Custom { name }`.
    pub fn register_merger(&mut self, name: impl Into<String>, merger: Arc<dyn CoalesceMerger>) {
        self.mergers.insert(name.into(), merger);
    }

    /// Number of joins currently pending (awaiting more branches or a
    /// timeout).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Accepts one branch arrival at `node_id` for `row_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::DuplicateBranchArrival`] if `branch` has
    /// already arrived for this `(node_id, row_id)` pending join.
    pub fn accept(
        &mut self,
        config: &CoalesceNodeConfig,
        node_id: NodeId,
        row_id: RowId,
        arrival: BranchArrival,
        now: OffsetDateTime,
    ) -> Result<AcceptOutcome, CoalesceError> {
        let key = (node_id.clone(), row_id.clone());
        let join = self.pending.entry(key.clone()).or_insert_with(|| PendingJoin {
            arrivals: HashMap::new(),
            first_seen_at: now,
        });
        if join.arrivals.contains_key(&arrival.branch) {
            return Err(CoalesceError::DuplicateBranchArrival {
                node_id,
                row_id,
                branch: arrival.branch,
            });
        }
        join.arrivals.insert(arrival.branch.clone(), arrival);

        if Self::is_ready(config, join.arrivals.len()) {
            let join = self.pending.remove(&key).unwrap_or_else(|| PendingJoin {
                arrivals: HashMap::new(),
                first_seen_at: now,
            });
            return Ok(AcceptOutcome::Ready(Self::order_members(config, node_id, row_id, join)));
        }
        Ok(AcceptOutcome::Pending)
    }

    /// Whether an in-flight join with `arrived` branches present should
    /// fire immediately under `config`'s policy, independent of timeout.
    fn is_ready(config: &CoalesceNodeConfig, arrived: usize) -> bool {
        if arrived >= config.branches.len() {
            // Every declared branch is present: always ready, regardless
            // of policy.
            return true;
        }
        match config.policy {
            CoalescePolicy::First => true,
            CoalescePolicy::RequireAll | CoalescePolicy::BestEffort => false,
            CoalescePolicy::Quorum(n) => arrived >= n,
        }
    }

    /// Evaluates every pending join against `configs`, resolving those
    /// whose declared `timeout_seconds` has elapsed. Joins still within
    /// their timeout (or with no timeout configured) are left pending.
    ///
    /// # Panics
    ///
    /// Panics if `configs` does not contain an entry for a node that has
    /// a pending join: callers must not tick against a configuration set
    /// narrower than the one joins were accepted under.
    #[allow(
        clippy::panic,
        reason = "a pending join for an unconfigured node is an internal invariant violation, not user-facing"
    )]
    pub fn tick(
        &mut self,
        configs: &HashMap<NodeId, CoalesceNodeConfig>,
        now: OffsetDateTime,
    ) -> Vec<((NodeId, RowId), ResolveOutcome)> {
        let expired: Vec<(NodeId, RowId)> = self
            .pending
            .iter()
            .filter(|(key, join)| {
                let config = configs
                    .get(&key.0)
                    .unwrap_or_else(|| panic!("no coalesce config registered for node {}", key.0));
                config.timeout_seconds.is_some_and(|timeout_seconds| {
                    now - join.first_seen_at >= Duration::seconds(i64::try_from(timeout_seconds).unwrap_or(i64::MAX))
                })
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .map(|key| {
                let config = &configs[&key.0];
                let join = self
                    .pending
                    .remove(&key)
                    .unwrap_or_else(|| panic!("resolved key vanished from the pending map"));
                let outcome = Self::resolve(config, key.0.clone(), key.1.clone(), join);
                (key, outcome)
            })
            .collect()
    }

    /// Drains every remaining pending join, resolving each under its
    /// policy's end-of-source terminal rule (§4.8: "the orchestrator
    /// calls `flush_pending()` which drains remaining pending joins
    /// under each policy's terminal rule").
    ///
    /// # Panics
    ///
    /// Panics if `configs` is missing an entry for a node with a pending
    /// join.
    #[allow(
        clippy::panic,
        reason = "a pending join for an unconfigured node is an internal invariant violation, not user-facing"
    )]
    pub fn flush_pending(
        &mut self,
        configs: &HashMap<NodeId, CoalesceNodeConfig>,
    ) -> Vec<((NodeId, RowId), ResolveOutcome)> {
        self.pending
            .drain()
            .map(|(key, join)| {
                let config = configs
                    .get(&key.0)
                    .unwrap_or_else(|| panic!("no coalesce config registered for node {}", key.0));
                let outcome = Self::resolve(config, key.0.clone(), key.1.clone(), join);
                (key, outcome)
            })
            .collect()
    }

    /// Forces resolution of one pending join under `config`'s terminal
    /// rule: `best_effort` always fires with whatever is present;
    /// `require_all`/`quorum`/`first` fire only if their condition is
    /// (still) met, else fail with the policy-specific error.
    fn resolve(
        config: &CoalesceNodeConfig,
        node_id: NodeId,
        row_id: RowId,
        join: PendingJoin,
    ) -> ResolveOutcome {
        let arrived = join.arrivals.len();
        let satisfied = match config.policy {
            CoalescePolicy::BestEffort | CoalescePolicy::First => true,
            CoalescePolicy::RequireAll => arrived == config.branches.len(),
            CoalescePolicy::Quorum(n) => arrived >= n,
        };
        if satisfied {
            return ResolveOutcome::Fired(Self::order_members(config, node_id, row_id, join));
        }
        let missing: Vec<String> = config
            .branches
            .iter()
            .filter(|branch| !join.arrivals.contains_key(*branch))
            .cloned()
            .collect();
        let mut members: Vec<BranchArrival> = join.arrivals.into_values().collect();
        members.sort_by(|a, b| a.branch.cmp(&b.branch));
        match config.policy {
            CoalescePolicy::RequireAll => {
                ResolveOutcome::Failed { error: CoalesceError::IncompleteBranches { node_id, row_id, missing }, members }
            }
            CoalescePolicy::Quorum(n) => ResolveOutcome::Failed {
                error: CoalesceError::QuorumNotMet { node_id, row_id, needed: n, arrived },
                members,
            },
            CoalescePolicy::BestEffort | CoalescePolicy::First => {
                unreachable!("best_effort and first are always satisfied")
            }
        }
    }

    /// Orders a resolved join's arrivals by declared branch order, with
    /// any undeclared branch appended afterward (defensive: a validated
    /// graph never routes an undeclared branch into a coalesce).
    fn order_members(
        config: &CoalesceNodeConfig,
        node_id: NodeId,
        row_id: RowId,
        mut join: PendingJoin,
    ) -> ReadyJoin {
        let mut members = Vec::with_capacity(join.arrivals.len());
        for branch in &config.branches {
            if let Some(arrival) = join.arrivals.remove(branch) {
                members.push(arrival);
            }
        }
        let mut leftovers: Vec<BranchArrival> = join.arrivals.into_values().collect();
        leftovers.sort_by(|a, b| a.branch.cmp(&b.branch));
        members.extend(leftovers);
        ReadyJoin { node_id, row_id, members }
    }

    /// Applies `config.merge` to a [`ReadyJoin`]'s members, producing
    /// the merged row.
    ///
    /// # Errors
    ///
    /// Returns [`CoalesceError::UnknownSelectBranch`] if `select_branch`
    /// names a branch not present in `join.members`, or
    /// [`CoalesceError::UnknownMerger`]/[`CoalesceError::MergerFailed`]
    /// for an unregistered or failing custom merge.
    pub fn merge(&self, config: &CoalesceNodeConfig, join: &ReadyJoin) -> Result<Value, CoalesceError> {
        match &config.merge {
            MergeStrategy::Union => Ok(Self::union_merge(&join.members)),
            MergeStrategy::SelectBranch { branch } => join
                .members
                .iter()
                .find(|arrival| &arrival.branch == branch)
                .map(|arrival| arrival.data.clone())
                .ok_or_else(|| CoalesceError::UnknownSelectBranch(branch.clone())),
            MergeStrategy::Custom { name } => {
                let merger = self
                    .mergers
                    .get(name)
                    .ok_or_else(|| CoalesceError::UnknownMerger(name.clone()))?;
                merger.merge(&join.members).map_err(CoalesceError::MergerFailed)
            }
        }
    }

    /// Shallow merge of every member's row object, in declared branch
    /// order so later branches win on key conflicts (§4.8: "union
    /// (shallow merge of row dicts)"). Non-object member rows are
    /// skipped: a coalesce only unions row-shaped payloads.
    fn union_merge(members: &[BranchArrival]) -> Value {
        let mut merged = Map::new();
        for arrival in members {
            if let Value::Object(fields) = &arrival.data {
                for (key, value) in fields {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(merged)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use serde_json::json;

    use elspeth_core::identifiers::TokenId;

    fn token(id: &str) -> Token {
        Token {
            token_id: TokenId::new(id),
            row_id: RowId::new("row-1"),
            fork_group_id: Some("fork-1".to_string()),
            join_group_id: None,
            expand_group_id: None,
            branch_name: None,
            step_in_pipeline: Some(3),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn arrival(branch: &str, data: Value) -> BranchArrival {
        BranchArrival { branch: branch.to_string(), token: token(branch), data }
    }

    fn config(policy: CoalescePolicy, merge: MergeStrategy, timeout: Option<u64>) -> CoalesceNodeConfig {
        CoalesceNodeConfig {
            branches: vec!["a".to_string(), "b".to_string()],
            policy,
            merge,
            timeout_seconds: timeout,
        }
    }

    #[test]
    fn require_all_waits_for_every_branch() {
        let mut executor = CoalesceExecutor::new();
        let config = config(CoalescePolicy::RequireAll, MergeStrategy::Union, None);
        let node_id = NodeId::new("join");
        let row_id = RowId::new("row-1");

        let outcome = executor
            .accept(&config, node_id.clone(), row_id.clone(), arrival("a", json!({"x": 1})), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Pending));

        let outcome = executor
            .accept(&config, node_id, row_id, arrival("b", json!({"y": 2})), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let AcceptOutcome::Ready(join) = outcome else { panic!("expected a ready join") };
        assert_eq!(join.members.len(), 2);
        let merged = executor.merge(&config, &join).unwrap();
        assert_eq!(merged, json!({"x": 1, "y": 2}));
    }

    #[test]
    fn duplicate_branch_arrival_is_rejected() {
        let mut executor = CoalesceExecutor::new();
        let config = config(CoalescePolicy::RequireAll, MergeStrategy::Union, None);
        let node_id = NodeId::new("join");
        let row_id = RowId::new("row-1");
        executor
            .accept(&config, node_id.clone(), row_id.clone(), arrival("a", json!({})), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let error = executor
            .accept(&config, node_id, row_id, arrival("a", json!({})), OffsetDateTime::UNIX_EPOCH)
            .unwrap_err();
        assert!(matches!(error, CoalesceError::DuplicateBranchArrival { .. }));
    }

    #[test]
    fn first_fires_immediately_on_first_arrival() {
        let mut executor = CoalesceExecutor::new();
        let config = config(CoalescePolicy::First, MergeStrategy::Union, None);
        let outcome = executor
            .accept(
                &config,
                NodeId::new("join"),
                RowId::new("row-1"),
                arrival("a", json!({"x": 1})),
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Ready(_)));
        assert_eq!(executor.pending_count(), 0);
    }

    #[test]
    fn best_effort_fires_on_timeout_with_partial_branches() {
        let mut executor = CoalesceExecutor::new();
        let node_id = NodeId::new("join");
        let config = config(CoalescePolicy::BestEffort, MergeStrategy::Union, Some(10));
        let mut configs = HashMap::new();
        configs.insert(node_id.clone(), config);

        let start = OffsetDateTime::UNIX_EPOCH;
        executor
            .accept(&configs[&node_id], node_id.clone(), RowId::new("row-1"), arrival("a", json!({"x": 1})), start)
            .unwrap();

        let ticked = executor.tick(&configs, start + Duration::seconds(5));
        assert!(ticked.is_empty(), "timeout not yet elapsed");

        let ticked = executor.tick(&configs, start + Duration::seconds(11));
        assert_eq!(ticked.len(), 1);
        let (_, outcome) = &ticked[0];
        let ResolveOutcome::Fired(join) = outcome else { panic!("expected a fired join") };
        assert_eq!(join.members.len(), 1);
    }

    #[test]
    fn require_all_fails_on_timeout_with_missing_branches() {
        let mut executor = CoalesceExecutor::new();
        let node_id = NodeId::new("join");
        let config = config(CoalescePolicy::RequireAll, MergeStrategy::Union, Some(10));
        let mut configs = HashMap::new();
        configs.insert(node_id.clone(), config);

        let start = OffsetDateTime::UNIX_EPOCH;
        executor
            .accept(&configs[&node_id], node_id.clone(), RowId::new("row-1"), arrival("a", json!({})), start)
            .unwrap();

        let ticked = executor.tick(&configs, start + Duration::seconds(11));
        assert_eq!(ticked.len(), 1);
        let (_, outcome) = &ticked[0];
        let ResolveOutcome::Failed { error, members } = outcome else { panic!("expected a failed join") };
        assert_eq!(
            *error,
            CoalesceError::IncompleteBranches {
                node_id: node_id.clone(),
                row_id: RowId::new("row-1"),
                missing: vec!["b".to_string()],
            }
        );
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].branch, "a");
    }

    #[test]
    fn flush_pending_resolves_require_all_joins_under_their_terminal_rule() {
        let mut executor = CoalesceExecutor::new();
        let node_id = NodeId::new("join");
        let config = config(CoalescePolicy::RequireAll, MergeStrategy::Union, None);
        let mut configs = HashMap::new();
        configs.insert(node_id.clone(), config);

        executor
            .accept(
                &configs[&node_id],
                node_id.clone(),
                RowId::new("row-1"),
                arrival("a", json!({})),
                OffsetDateTime::UNIX_EPOCH,
            )
            .unwrap();

        let flushed = executor.flush_pending(&configs);
        assert_eq!(flushed.len(), 1);
        assert!(matches!(
            flushed[0].1,
            ResolveOutcome::Failed { error: CoalesceError::IncompleteBranches { .. }, .. }
        ));
        assert_eq!(executor.pending_count(), 0);
    }

    #[test]
    fn select_branch_merge_keeps_only_the_named_branch() {
        let mut executor = CoalesceExecutor::new();
        let config =
            config(CoalescePolicy::RequireAll, MergeStrategy::SelectBranch { branch: "a".to_string() }, None);
        let node_id = NodeId::new("join");
        let row_id = RowId::new("row-1");
        executor
            .accept(&config, node_id.clone(), row_id.clone(), arrival("a", json!({"keep": true})), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let AcceptOutcome::Ready(join) = executor
            .accept(&config, node_id, row_id, arrival("b", json!({"drop": true})), OffsetDateTime::UNIX_EPOCH)
            .unwrap()
        else {
            panic!("expected ready")
        };
        assert_eq!(executor.merge(&config, &join).unwrap(), json!({"keep": true}));
    }

    #[test]
    fn custom_merge_without_registration_errors() {
        let executor = CoalesceExecutor::new();
        let config =
            config(CoalescePolicy::RequireAll, MergeStrategy::Custom { name: "weighted".to_string() }, None);
        let join = ReadyJoin { node_id: NodeId::new("join"), row_id: RowId::new("row-1"), members: vec![] };
        let error = executor.merge(&config, &join).unwrap_err();
        assert_eq!(error, CoalesceError::UnknownMerger("weighted".to_string()));
    }

    #[test]
    fn quorum_fires_once_n_branches_present_even_if_more_are_declared() {
        let mut executor = CoalesceExecutor::new();
        let config = CoalesceNodeConfig {
            branches: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            policy: CoalescePolicy::Quorum(2),
            merge: MergeStrategy::Union,
            timeout_seconds: None,
        };
        let node_id = NodeId::new("join");
        let row_id = RowId::new("row-1");
        executor
            .accept(&config, node_id.clone(), row_id.clone(), arrival("a", json!({"a": 1})), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        let outcome = executor
            .accept(&config, node_id, row_id, arrival("c", json!({"c": 3})), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Ready(_)));
    }
}
