// crates/elspeth-core/src/core/identifiers.rs
// ============================================================================
// Module: ELSPETH Identifiers
// Description: Opaque identity types shared across the audit trail and runtime.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every entity in the audit trail (§3.1) is named by an opaque string
//! identifier. None of these types carry semantic structure of their own;
//! callers that need a deterministic identifier (for example `NodeId`,
//! which is derived from `(plugin_name, position, config_hash)`) compute the
//! string before constructing the wrapper.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier from any string-like value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// Identifies one execution of the pipeline.
    ///
    /// # Invariants
    /// - Unique within the audit store; immutable once the run transitions
    ///   to a terminal status.
    RunId
);

opaque_id!(
    /// Identifies a registered plugin instance within a run.
    ///
    /// # Invariants
    /// - Deterministic from `(plugin_name, position, config_hash)`; two
    ///   registrations with identical inputs yield the same `NodeId`.
    NodeId
);

opaque_id!(
    /// Identifies a directed, labelled edge between two nodes.
    EdgeId
);

opaque_id!(
    /// Identifies a source row.
    ///
    /// # Invariants
    /// - Unique per run; stable even after the row payload is purged.
    RowId
);

opaque_id!(
    /// Identifies one execution instance of a row on a path through the
    /// graph.
    TokenId
);

opaque_id!(
    /// Identifies the execution of one node on one token.
    ///
    /// # Invariants
    /// - `(token_id, node_id, attempt)` is unique per state.
    StateId
);

opaque_id!(
    /// Identifies an external invocation inside a state or operation.
    CallId
);

opaque_id!(
    /// Identifies a parent context for source-load or sink-write I/O calls.
    OperationId
);

opaque_id!(
    /// Identifies a buffered set of tokens consumed by a batch-aware
    /// transform.
    BatchId
);

opaque_id!(
    /// Identifies an artifact produced by a sink write.
    ArtifactId
);

opaque_id!(
    /// Identifies a durable checkpoint.
    CheckpointId
);

opaque_id!(
    /// Identifies a token outcome record.
    OutcomeId
);

#[cfg(test)]
#[allow(clippy::expect_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::RunId;

    #[test]
    fn round_trips_through_display_and_as_str() {
        let id = RunId::new("run-1");
        assert_eq!(id.as_str(), "run-1");
        assert_eq!(id.to_string(), "run-1");
    }

    #[test]
    fn serializes_as_a_bare_string() {
        let id = RunId::new("run-1");
        let json = serde_json::to_string(&id).expect("serialization succeeds");
        assert_eq!(json, "\"run-1\"");
    }
}
