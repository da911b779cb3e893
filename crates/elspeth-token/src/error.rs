// crates/elspeth-token/src/error.rs
// ============================================================================
// Module: ELSPETH Token Errors
// Description: Failure modes for fork/expand/coalesce lifecycle operations.
// ============================================================================

use thiserror::Error;

/// Errors raised by [`crate::TokenManager`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// A fork or expand was requested with zero branches/items.
    #[error("{operation} requires at least one {unit}, found zero")]
    EmptyFanout {
        /// `"fork"` or `"expand"`.
        operation: &'static str,
        /// `"branch"` or `"item"`.
        unit: &'static str,
    },
    /// Fork branch names were not unique.
    #[error("fork branches must be unique, duplicate branch: {0}")]
    DuplicateBranch(String),
    /// A coalesce was requested with zero input tokens.
    #[error("coalesce requires at least one input token")]
    EmptyCoalesce,
}
