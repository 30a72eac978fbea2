//! HiveStore - transactional persistence for hivedaemon
//!
//! A generic record store over SQLite. Records are serde documents with a
//! small set of indexed fields; every multi-record mutation that represents
//! one logical step runs inside a single SQLite transaction.
//!
//! # Guarantees
//!
//! - **Durable**: WAL journal, synchronous writes.
//! - **Single owner**: an advisory file lock prevents two processes from
//!   opening the same store directory for writing.
//! - **Forward-only migrations**: numbered, recorded, never skipped.
//! - **Integrity checked**: `PRAGMA integrity_check` runs on every open; a
//!   failing check refuses to open and surfaces a recovery runbook.

pub mod error;
pub mod migrate;
pub mod record;
pub mod store;

pub use error::{RECOVERY_RUNBOOK, StoreError};
pub use migrate::{Migration, allocate_slot};
pub use record::{Filter, FilterOp, IndexValue, Record, now_ms};
pub use store::{Store, StoreTxn};
