// crates/elspeth-coalesce/src/error.rs
// ============================================================================
// Module: ELSPETH Coalesce Errors
// Description: Failure modes for pending-join resolution and merging.
// ============================================================================

use thiserror::Error;

use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::RowId;

/// Errors raised while resolving or merging a coalesce join (§4.8).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoalesceError {
    /// A `quorum(n)` policy's `n` was requested above the number of
    /// declared branches, or was zero.
    #[error("quorum {requested} is invalid for {declared} declared branch(es)")]
    InvalidQuorum {
        /// Requested quorum size.
        requested: usize,
        /// Number of declared branches.
        declared: usize,
    },
    /// A join failed to reach `quorum(n)` by the time it was resolved
    /// (timeout or end-of-source), under a policy other than
    /// `best_effort`.
    #[error(
        "coalesce node {node_id} row {row_id} did not reach quorum: needed {needed}, got \
         {arrived}"
    )]
    QuorumNotMet {
        /// The coalesce node.
        node_id: NodeId,
        /// The row being joined.
        row_id: RowId,
        /// The quorum size required.
        needed: usize,
        /// The number of branches that actually arrived.
        arrived: usize,
    },
    /// A `require_all` join was resolved (timeout or end-of-source)
    /// without every declared branch present.
    #[error(
        "coalesce node {node_id} row {row_id} is missing branches at resolution: {missing:?}"
    )]
    IncompleteBranches {
        /// The coalesce node.
        node_id: NodeId,
        /// The row being joined.
        row_id: RowId,
        /// Declared branches that never arrived.
        missing: Vec<String>,
    },
    /// A `select_branch` merge named a branch that never arrived (or was
    /// never declared).
    #[error("select_branch merge named unknown branch '{0}'")]
    UnknownSelectBranch(String),
    /// A `custom` merge strategy named a merger that was never registered
    /// with the executor (§6.1: custom merge is plugin-defined, out of
    /// scope for the core, so the core can only dispatch to a merger the
    /// caller supplied).
    #[error("custom merge strategy '{0}' has no registered merger")]
    UnknownMerger(String),
    /// A registered [`crate::CoalesceMerger`] failed.
    #[error("custom merge failed: {0}")]
    MergerFailed(String),
    /// `tick`/`flush_pending` was asked to resolve a join with no
    /// branches recorded at all (a framework bug: a pending join is
    /// never created without its first branch).
    #[error("coalesce node {node_id} row {row_id} has no pending branches to resolve")]
    EmptyPending {
        /// The coalesce node.
        node_id: NodeId,
        /// The row being joined.
        row_id: RowId,
    },
    /// The same branch arrived twice for the same `(node_id, row_id)`
    /// pending join without the first being resolved.
    #[error("branch '{branch}' already pending for coalesce node {node_id} row {row_id}")]
    DuplicateBranchArrival {
        /// The coalesce node.
        node_id: NodeId,
        /// The row being joined.
        row_id: RowId,
        /// The branch that arrived twice.
        branch: String,
    },
}
