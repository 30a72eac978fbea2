//! Numbered forward-only migrations and the slot allocator
//!
//! Schema changes are a linear, append-only sequence. On open the store
//! applies every unapplied migration in order and refuses to open if the
//! recorded history disagrees with the compiled sequence (a store written by
//! a newer binary, or a renumbered migration).

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::now_ms;

/// A single schema migration
pub struct Migration {
    /// Monotone 1-based number
    pub number: u32,
    /// Short stable name, recorded alongside the number
    pub name: &'static str,
    /// SQL applied inside the migration transaction
    pub sql: &'static str,
}

/// The compiled migration sequence. Append only; never renumber.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        number: 1,
        name: "records",
        sql: "CREATE TABLE records (
                  collection TEXT NOT NULL,
                  id TEXT NOT NULL,
                  body TEXT NOT NULL,
                  updated_at INTEGER NOT NULL,
                  PRIMARY KEY (collection, id)
              );",
    },
    Migration {
        number: 2,
        name: "record_index",
        sql: "CREATE TABLE record_index (
                  collection TEXT NOT NULL,
                  id TEXT NOT NULL,
                  field TEXT NOT NULL,
                  value TEXT NOT NULL,
                  PRIMARY KEY (collection, id, field)
              );
              CREATE INDEX idx_record_index_lookup
                  ON record_index (collection, field, value);",
    },
    Migration {
        number: 3,
        name: "allocator_slots",
        sql: "CREATE TABLE allocator_slots (
                  scope TEXT NOT NULL,
                  number INTEGER NOT NULL,
                  label TEXT NOT NULL,
                  allocated_at INTEGER NOT NULL,
                  PRIMARY KEY (scope, number)
              );",
    },
];

/// Apply all unapplied migrations. Idempotent.
pub fn apply_all(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             number INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             applied_at INTEGER NOT NULL
         );",
    )?;

    let applied: Vec<(u32, String)> = {
        let mut stmt = conn.prepare("SELECT number, name FROM schema_migrations ORDER BY number")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    // History must be a prefix of the compiled sequence.
    for (i, (number, name)) in applied.iter().enumerate() {
        match MIGRATIONS.get(i) {
            Some(m) if m.number == *number && m.name == name => {}
            Some(m) => {
                return Err(StoreError::MigrationOrder(format!(
                    "recorded migration {number} ({name}) does not match compiled {} ({})",
                    m.number, m.name
                )));
            }
            None => {
                return Err(StoreError::MigrationOrder(format!(
                    "store has migration {number} ({name}) unknown to this binary; refusing to open"
                )));
            }
        }
    }

    for migration in &MIGRATIONS[applied.len()..] {
        debug!(number = migration.number, name = migration.name, "Applying migration");
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (number, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.number, migration.name, now_ms()],
        )?;
        tx.commit()?;
        info!(number = migration.number, name = migration.name, "Applied migration");
    }

    Ok(())
}

/// Allocate the next monotone number within a scope.
///
/// Runs in an immediate transaction so concurrent writers each observe the
/// committed maximum; two allocations can never return the same number.
pub fn allocate_slot(conn: &mut Connection, scope: &str, label: &str) -> Result<u32> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let next: u32 = tx.query_row(
        "SELECT COALESCE(MAX(number), 0) + 1 FROM allocator_slots WHERE scope = ?1",
        [scope],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO allocator_slots (scope, number, label, allocated_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![scope, next, label, now_ms()],
    )?;
    tx.commit()?;
    debug!(scope, label, number = next, "Allocated slot");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_apply_all_idempotent() {
        let mut conn = mem_conn();
        apply_all(&mut conn).unwrap();
        apply_all(&mut conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[test]
    fn test_unknown_migration_refused() {
        let mut conn = mem_conn();
        apply_all(&mut conn).unwrap();

        // Simulate a store written by a newer binary
        conn.execute(
            "INSERT INTO schema_migrations (number, name, applied_at) VALUES (99, 'future', 0)",
            [],
        )
        .unwrap();

        let err = apply_all(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::MigrationOrder(_)));
    }

    #[test]
    fn test_allocator_monotone() {
        let mut conn = mem_conn();
        apply_all(&mut conn).unwrap();

        let a = allocate_slot(&mut conn, "migrations", "add users table").unwrap();
        let b = allocate_slot(&mut conn, "migrations", "add posts table").unwrap();
        let c = allocate_slot(&mut conn, "other-scope", "unrelated").unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(c, 1); // scopes are independent
    }

    #[test]
    fn test_migration_numbers_are_sequential() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.number as usize, i + 1, "migration {} out of order", m.name);
        }
    }
}
