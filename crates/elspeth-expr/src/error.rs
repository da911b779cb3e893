// crates/elspeth-expr/src/error.rs
// ============================================================================
// Module: ELSPETH Expression Errors
// Description: Error taxonomy for gate condition parsing and evaluation.
// ============================================================================

//! ## Overview
//! §4.6 classifies every failure as SECURITY (a disallowed construct was
//! rejected before it could run), SYNTAX (the source was malformed), or
//! EVAL (a runtime failure such as a missing key, a type error, or
//! division by zero). Security and syntax errors only ever occur at
//! [`crate::GateCondition::parse`] time; eval errors only occur at
//! [`crate::GateCondition::evaluate`] time. An expression that has already
//! parsed can never produce a security or syntax error later.

use thiserror::Error;

/// Errors raised while parsing or evaluating a gate condition expression.
///
/// # Invariants
/// - `Security` and `Syntax` are raised only at parse time.
/// - `Eval` is raised only at evaluate time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// The source contained a construct outside the AST whitelist (§4.6):
    /// a disallowed name, an arbitrary function call, a lambda,
    /// comprehension, walrus, f-string, slice, or attribute access other
    /// than `row.get`.
    #[error("expression security error at byte {position}: {message}")]
    Security {
        /// Byte offset into the source where the violation was detected.
        position: usize,
        /// Human-readable description.
        message: String,
    },
    /// The source could not be tokenized or parsed as a well-formed
    /// expression.
    #[error("expression syntax error at byte {position}: {message}")]
    Syntax {
        /// Byte offset into the source where the error was detected.
        position: usize,
        /// Human-readable description.
        message: String,
    },
    /// Evaluating an already-validated expression failed at runtime:
    /// a missing field, an out-of-range index, a type mismatch, or
    /// division by zero.
    #[error("expression evaluation error: {0}")]
    Eval(String),
}

impl ExpressionError {
    /// Returns whether this error was raised at parse time (security or
    /// syntax), as opposed to evaluate time.
    #[must_use]
    pub const fn is_parse_time(&self) -> bool {
        matches!(self, Self::Security { .. } | Self::Syntax { .. })
    }
}
