//! Store error types

/// Printed alongside [`StoreError::Corruption`]. The store never attempts
/// automatic repair; recovery is an operator decision.
pub const RECOVERY_RUNBOOK: &str = "\
hivestore integrity check failed. Recovery steps:
  1. Stop the daemon (`hd stop`); do not start new waves.
  2. Copy the store directory aside: cp -r <store-dir> <store-dir>.corrupt
  3. Attempt a dump/reload: sqlite3 hive.db '.recover' | sqlite3 hive.recovered.db
  4. If the dump is clean, replace hive.db with hive.recovered.db and re-open.
  5. Otherwise restore the most recent backup and replay from the event log.
Never delete the corrupt copy until a recovered store has passed integrity_check.";

/// Errors surfaced by the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is locked by another process: {0}")]
    Locked(String),

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("migration sequence broken: {0}")]
    MigrationOrder(String),

    #[error("store corruption detected: {detail}\n{RECOVERY_RUNBOOK}")]
    Corruption { detail: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
