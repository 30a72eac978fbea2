//! Core Store implementation

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::migrate;
use crate::record::{Filter, Record};

/// The store: one SQLite database plus an advisory lock file.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    /// Held for the lifetime of the store; releases on drop
    _lock_file: fs::File,
    base_path: PathBuf,
}

impl Store {
    /// Open or create a store at the given directory.
    ///
    /// Acquires the directory lock, creates the schema, applies pending
    /// migrations, and runs an integrity check. A failing integrity check
    /// refuses to open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let lock_path = base_path.join(".lock");
        let lock_file = fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked(lock_path.display().to_string()))?;

        let db_path = base_path.join("hive.db");
        let mut conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrate::apply_all(&mut conn)?;

        let check: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if check != "ok" {
            warn!(%check, "Integrity check failed");
            return Err(StoreError::Corruption { detail: check });
        }

        info!(path = %base_path.display(), "Opened store");
        Ok(Self {
            conn,
            _lock_file: lock_file,
            base_path,
        })
    }

    /// Directory this store lives in
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Insert a new record. Fails if the id already exists in the collection.
    pub fn create<R: Record>(&mut self, record: &R) -> Result<String> {
        let txn = self.conn.transaction()?;
        ops::create(&txn, record)?;
        txn.commit()?;
        Ok(record.id().to_string())
    }

    /// Fetch a record by id
    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        ops::get(&self.conn, id)
    }

    /// Replace an existing record and refresh its index rows
    pub fn update<R: Record>(&mut self, record: &R) -> Result<()> {
        let txn = self.conn.transaction()?;
        ops::update(&txn, record)?;
        txn.commit()?;
        Ok(())
    }

    /// Delete a record and its index rows. Missing records are not an error.
    pub fn delete<R: Record>(&mut self, id: &str) -> Result<()> {
        let txn = self.conn.transaction()?;
        ops::delete::<R>(&txn, id)?;
        txn.commit()?;
        Ok(())
    }

    /// List records matching all filters, ordered by `updated_at` ascending
    pub fn list<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>> {
        ops::list(&self.conn, filters)
    }

    /// Count records in a collection
    pub fn count<R: Record>(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            [R::collection_name()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Re-derive index rows for every record in a collection.
    /// Needed after `indexed_fields` definitions change between versions.
    pub fn rebuild_indexes<R: Record>(&mut self) -> Result<usize> {
        let records: Vec<R> = self.list(&[])?;
        let txn = self.conn.transaction()?;
        txn.execute(
            "DELETE FROM record_index WHERE collection = ?1",
            [R::collection_name()],
        )?;
        for record in &records {
            ops::write_index(&txn, record)?;
        }
        txn.commit()?;
        debug!(
            collection = R::collection_name(),
            count = records.len(),
            "Rebuilt indexes"
        );
        Ok(records.len())
    }

    /// Run a closure inside one SQLite transaction.
    ///
    /// Every mutation the closure performs commits atomically, or none do.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut StoreTxn<'_>) -> Result<T>) -> Result<T> {
        let txn = self.conn.transaction()?;
        let mut wrapper = StoreTxn { txn: &txn };
        let result = f(&mut wrapper)?;
        txn.commit()?;
        Ok(result)
    }

    /// Allocate the next monotone number in a named scope
    pub fn allocate_slot(&mut self, scope: &str, label: &str) -> Result<u32> {
        migrate::allocate_slot(&mut self.conn, scope, label)
    }
}

/// Transactional view handed to [`Store::transaction`] closures
pub struct StoreTxn<'a> {
    txn: &'a rusqlite::Transaction<'a>,
}

impl StoreTxn<'_> {
    pub fn create<R: Record>(&mut self, record: &R) -> Result<String> {
        ops::create(self.txn, record)?;
        Ok(record.id().to_string())
    }

    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>> {
        ops::get(self.txn, id)
    }

    pub fn get_required<R: Record>(&self, id: &str) -> Result<R> {
        ops::get(self.txn, id)?.ok_or_else(|| StoreError::NotFound {
            collection: R::collection_name().to_string(),
            id: id.to_string(),
        })
    }

    pub fn update<R: Record>(&mut self, record: &R) -> Result<()> {
        ops::update(self.txn, record)
    }

    pub fn delete<R: Record>(&mut self, id: &str) -> Result<()> {
        ops::delete::<R>(self.txn, id)
    }

    pub fn list<R: Record>(&self, filters: &[Filter]) -> Result<Vec<R>> {
        ops::list(self.txn, filters)
    }
}

/// Shared CRUD over a connection or transaction
mod ops {
    use super::*;

    pub fn create<R: Record>(conn: &Connection, record: &R) -> Result<()> {
        let body = serde_json::to_string(record)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![R::collection_name(), record.id(), body, record.updated_at()],
        )?;
        if inserted == 0 {
            return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY),
                Some(format!("duplicate id {} in {}", record.id(), R::collection_name())),
            )));
        }
        write_index(conn, record)
    }

    pub fn get<R: Record>(conn: &Connection, id: &str) -> Result<Option<R>> {
        let mut stmt = conn.prepare_cached("SELECT body FROM records WHERE collection = ?1 AND id = ?2")?;
        let mut rows = stmt.query(rusqlite::params![R::collection_name(), id])?;
        match rows.next()? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    pub fn update<R: Record>(conn: &Connection, record: &R) -> Result<()> {
        let body = serde_json::to_string(record)?;
        let updated = conn.execute(
            "UPDATE records SET body = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            rusqlite::params![R::collection_name(), record.id(), body, record.updated_at()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                collection: R::collection_name().to_string(),
                id: record.id().to_string(),
            });
        }
        write_index(conn, record)
    }

    pub fn delete<R: Record>(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![R::collection_name(), id],
        )?;
        conn.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            rusqlite::params![R::collection_name(), id],
        )?;
        Ok(())
    }

    pub fn list<R: Record>(conn: &Connection, filters: &[Filter]) -> Result<Vec<R>> {
        // Narrow by the first equality filter through the index; apply the
        // rest in memory against each record's indexed fields.
        let first_eq = filters.iter().find(|f| f.op == crate::record::FilterOp::Eq);

        let mut records: Vec<R> = Vec::new();
        let mut push = |body: String| -> Result<()> {
            records.push(serde_json::from_str(&body)?);
            Ok(())
        };

        if let Some(f) = first_eq {
            let mut stmt = conn.prepare_cached(
                "SELECT r.body FROM records r
                 JOIN record_index i ON i.collection = r.collection AND i.id = r.id
                 WHERE r.collection = ?1 AND i.field = ?2 AND i.value = ?3
                 ORDER BY r.updated_at ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                R::collection_name(),
                f.field,
                f.value.as_text()
            ])?;
            while let Some(row) = rows.next()? {
                push(row.get(0)?)?;
            }
        } else {
            let mut stmt = conn
                .prepare_cached("SELECT body FROM records WHERE collection = ?1 ORDER BY updated_at ASC")?;
            let mut rows = stmt.query([R::collection_name()])?;
            while let Some(row) = rows.next()? {
                push(row.get(0)?)?;
            }
        }

        let records = records
            .into_iter()
            .filter(|r| {
                let fields = r.indexed_fields();
                filters.iter().all(|f| f.matches(&fields))
            })
            .collect();

        Ok(records)
    }

    pub fn write_index<R: Record>(conn: &Connection, record: &R) -> Result<()> {
        conn.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            rusqlite::params![R::collection_name(), record.id()],
        )?;
        for (field, value) in record.indexed_fields() {
            conn.execute(
                "INSERT INTO record_index (collection, id, field, value) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![R::collection_name(), record.id(), field, value.as_text()],
            )?;
        }
        Ok(())
    }
}
