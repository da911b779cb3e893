// crates/elspeth-store-sqlite/src/checkpoint.rs
// ============================================================================
// Module: Stored Checkpoint
// Description: Row-hydrated view of a persisted aggregation checkpoint (§4.9).
// ============================================================================

use rusqlite::Row;

use elspeth_core::identifiers::CheckpointId;
use elspeth_core::identifiers::NodeId;
use elspeth_core::identifiers::TokenId;

/// A checkpoint as read back from the `checkpoints` table.
///
/// # Invariants
/// - `aggregation_state` is `None` only for checkpoint-capable nodes that
///   hold no aggregation state (e.g. a pass-through checkpoint marking
///   progress without buffered state).
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    /// Identity of this checkpoint.
    pub checkpoint_id: CheckpointId,
    /// The token whose node state produced this checkpoint.
    pub token_id: TokenId,
    /// The checkpoint-capable node this checkpoint belongs to.
    pub node_id: NodeId,
    /// Monotone per-run sequence number; the highest wins on recovery.
    pub sequence_number: u64,
    /// Serialized aggregation state, if any.
    pub aggregation_state: Option<serde_json::Value>,
    /// Hash of the upstream topology at checkpoint time, used to detect
    /// graph drift between the checkpointed run and a resumed one.
    pub upstream_topology_hash: String,
    /// Hash of the checkpoint node's own configuration at checkpoint time.
    pub checkpoint_node_config_hash: String,
    /// Format version of `aggregation_state`, chosen by the checkpointing
    /// plugin so it can evolve its own serialization over time.
    pub format_version: u32,
}

impl StoredCheckpoint {
    /// Hydrates a [`StoredCheckpoint`] from a `checkpoints` row selected as
    /// `checkpoint_id, token_id, node_id, sequence_number,
    /// aggregation_state_json, upstream_topology_hash,
    /// checkpoint_node_config_hash, format_version`.
    ///
    /// # Panics
    ///
    /// Panics if `aggregation_state_json` is present but is not valid JSON:
    /// this column is only ever written by [`crate::LandscapeStore`] via
    /// `serde_json::to_string`, so a parse failure means on-disk corruption
    /// or a schema-incompatible write from outside this crate, not a
    /// recoverable condition (§7 "bad data crashes").
    #[allow(
        clippy::panic_in_result_fn,
        reason = "aggregation_state_json corruption is a framework bug, not a query failure"
    )]
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let aggregation_state_json: Option<String> = row.get(4)?;
        let aggregation_state = aggregation_state_json.map(|text| {
            serde_json::from_str(&text).unwrap_or_else(|error| {
                panic!("checkpoints.aggregation_state_json is not valid JSON: {error}")
            })
        });
        let sequence_number: i64 = row.get(3)?;
        let format_version: i64 = row.get(7)?;
        Ok(Self {
            checkpoint_id: CheckpointId::new(row.get::<_, String>(0)?),
            token_id: TokenId::new(row.get::<_, String>(1)?),
            node_id: NodeId::new(row.get::<_, String>(2)?),
            sequence_number: u64::try_from(sequence_number).unwrap_or(0),
            aggregation_state,
            upstream_topology_hash: row.get(5)?,
            checkpoint_node_config_hash: row.get(6)?,
            format_version: u32::try_from(format_version).unwrap_or(0),
        })
    }
}
