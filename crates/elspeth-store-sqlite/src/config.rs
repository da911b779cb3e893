// crates/elspeth-store-sqlite/src/config.rs
// ============================================================================
// Module: ELSPETH Audit Store Configuration
// Description: Connection and durability settings for the SQLite recorder.
// ============================================================================

use std::path::PathBuf;

use serde::Deserialize;

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (required by §6.3: "SQLite WAL mode").
    #[default]
    Wal,
    /// Delete journal mode, kept for single-writer local testing only.
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` synchronous mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode, required by §6.3 ("synchronous=FULL").
    #[default]
    Full,
    /// Normal synchronous mode; faster, but not the audited default.
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Returns the default busy timeout, in milliseconds.
const fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Configuration for the `SQLite`-backed landscape recorder.
///
/// # Invariants
/// - `path` must resolve to a file path (an in-memory store uses
///   [`SqliteStoreConfig::in_memory`] instead).
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file, or `:memory:` for an in-memory
    /// store used by tests.
    pub path: PathBuf,
    /// Busy timeout in milliseconds, applied via `PRAGMA busy_timeout`.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// Synchronous mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Builds a configuration pointing at a durable file path, using the
    /// audited defaults (§6.3: WAL + `synchronous=FULL`).
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::Wal,
            sync_mode: SqliteSyncMode::Full,
        }
    }

    /// Builds a configuration for an ephemeral in-memory store, used by
    /// unit tests and the smoke demo.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::Delete,
            sync_mode: SqliteSyncMode::Full,
        }
    }

    /// Returns whether this configuration targets an in-memory database.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }
}
