// crates/elspeth-orchestrator/src/ids.rs
// ============================================================================
// Module: ELSPETH Id Minting
// Description: Process-local id generation for entities the orchestrator
//              creates itself (edges, rows, tokens, states, calls,
//              operations, batches, artifacts, outcomes, checkpoints).
// ============================================================================

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Mints monotonically increasing, process-local identifiers, one
/// generator per entity kind. Not a UUID generator: uniqueness only
/// needs to hold within a single run, and the counter idiom avoids
/// pulling a randomness dependency into the workspace for it, the same
/// tradeoff `elspeth-store-sqlite` makes for its own internally-minted
/// outcome ids.
#[derive(Debug)]
pub struct IdMinter {
    prefix: &'static str,
    counter: AtomicU64,
}

impl IdMinter {
    /// Builds a minter whose ids are tagged with `prefix`.
    #[must_use]
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix, counter: AtomicU64::new(0) }
    }

    /// Mints the next id in this generator's sequence.
    pub fn mint(&self) -> String {
        let next = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{next:016x}", self.prefix)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::IdMinter;

    #[test]
    fn minted_ids_are_unique_and_ordered() {
        let minter = IdMinter::new("row");
        let first = minter.mint();
        let second = minter.mint();
        assert_ne!(first, second);
        assert!(first < second);
    }
}
