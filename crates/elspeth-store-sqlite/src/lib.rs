// crates/elspeth-store-sqlite/src/lib.rs
// ============================================================================
// Crate: elspeth-store-sqlite
// Description: SQLite-backed landscape recorder (audit trail) and checkpoint
//              store for ELSPETH runs.
// ============================================================================

//! Durable audit trail for a run: every row, token, node state, call,
//! routing decision, batch, and terminal outcome is written here as it
//! happens, in the schema described by §6.3. [`LandscapeStore`] is the
//! single entry point; [`SqliteStoreConfig`] selects the file (or
//! in-memory) target and the journal/sync pragmas applied at open.
//!
//! Reads that hit structurally impossible data — an unrecognized enum
//! string, a NULL where a terminal row guarantees a value — panic rather
//! than silently defaulting (§7, §8.1): such data can only exist if this
//! crate or a prior version of it wrote something it should not have.

mod checkpoint;
mod config;
mod error;
mod schema;
mod store;

pub use checkpoint::StoredCheckpoint;
pub use config::SqliteStoreConfig;
pub use config::SqliteStoreMode;
pub use config::SqliteSyncMode;
pub use error::StoreError;
pub use schema::SCHEMA_VERSION;
pub use store::LandscapeStore;
pub use store::ValidationFieldDetail;
