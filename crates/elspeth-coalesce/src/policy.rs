// crates/elspeth-coalesce/src/policy.rs
// ============================================================================
// Module: ELSPETH Coalesce Policy
// Description: Merge policies, merge strategies, and per-node coalesce
//              configuration (§4.8).
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

/// When a pending join is allowed to fire (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Merge only once every declared branch has arrived.
    RequireAll,
    /// Merge once `n` branches have arrived (`n <= declared branches`).
    Quorum(usize),
    /// Merge whatever is present on timeout or end-of-source; never
    /// fails.
    BestEffort,
    /// Merge on the first branch to arrive, using only that branch.
    First,
}

/// How a pending join's arrived branch payloads are combined into one
/// merged row (§4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Shallow merge of row maps; later branches (in declared branch
    /// order) win on key conflicts.
    Union,
    /// Keep exactly one branch's row, discarding the rest.
    SelectBranch {
        /// The branch whose row becomes the merged row.
        branch: String,
    },
    /// Delegate to a plugin-defined merger registered under `name`
    /// (§6.1: out of scope for the core to implement the merge logic
    /// itself).
    Custom {
        /// Name the merger was registered under.
        name: String,
    },
}

/// Declared configuration for one coalesce node (§3.2, §4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalesceNodeConfig {
    /// Declared branch names this coalesce expects to join, in
    /// declaration order (also the `union` merge precedence order).
    pub branches: Vec<String>,
    /// Resolution policy.
    pub policy: CoalescePolicy,
    /// Merge strategy applied once a join is ready to fire.
    pub merge: MergeStrategy,
    /// Optional timeout, in seconds, after which a pending join is
    /// forcibly resolved (fired under `best_effort`, failed otherwise).
    pub timeout_seconds: Option<u64>,
}

impl CoalesceNodeConfig {
    /// Validates that a `Quorum(n)` policy names a reachable quorum size.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoalesceError::InvalidQuorum`] if `n` is zero or
    /// exceeds the number of declared branches.
    pub fn validate(&self) -> Result<(), crate::CoalesceError> {
        if let CoalescePolicy::Quorum(n) = self.policy
            && (n == 0 || n > self.branches.len())
        {
            return Err(crate::CoalesceError::InvalidQuorum {
                requested: n,
                declared: self.branches.len(),
            });
        }
        Ok(())
    }
}
