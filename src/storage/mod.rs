//! SQLite-backed durable state.
//!
//! A single `Connection` sits behind a mutex. Holding the guard returned by
//! [`RaftStorage::write`] is the write-transaction lock: every durable
//! mutation and every node state transition happens while it is held.
//! The operations in the submodules take a `&Connection` so they compose
//! inside one `Transaction`.

pub mod log;
pub mod term;
pub mod topology;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::Result;

/// Durable term/vote/topology/log state of one node.
pub struct RaftStorage {
    conn: Mutex<Connection>,
}

impl RaftStorage {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the write-transaction lock.
    pub fn write(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("storage mutex poisoned")
    }

    /// Run `f` inside a write transaction, committing when it succeeds.
    pub fn with_write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.write();
        commit_with(&mut conn, f)
    }

    /// Run `f` against a consistent view of the database.
    pub fn with_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.write();
        f(&conn)
    }
}

/// Run `f` in a transaction on a connection whose lock the caller already
/// holds, so in-memory state can be published before the lock is released.
pub fn commit_with<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Create the required tables if they do not already exist.
fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS raft_state (
            key   TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );

        -- key is the big-endian index so blob ordering equals index ordering
        CREATE TABLE IF NOT EXISTS raft_log (
            key   BLOB PRIMARY KEY,
            idx   INTEGER NOT NULL,
            term  INTEGER NOT NULL,
            entry BLOB NOT NULL,
            flags INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let storage = RaftStorage::open_in_memory().unwrap();
        storage.with_write(|conn| init_db(conn)).unwrap();
        let tables: i64 = storage
            .with_read(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'raft_%'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn failed_write_rolls_back() {
        let storage = RaftStorage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_write(|conn| {
            term::set_current_term(conn, 7)?;
            Err(crate::error::RaftError::InvalidOperation("abort".into()))
        });
        assert!(result.is_err());
        let term = storage.with_read(|conn| term::current_term(conn)).unwrap();
        assert_eq!(term, 0);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.db");
        {
            let storage = RaftStorage::open(&path).unwrap();
            storage
                .with_write(|conn| term::cast_vote(conn, 4, "B"))
                .unwrap();
        }
        let storage = RaftStorage::open(&path).unwrap();
        let (term, voted_for) = storage
            .with_read(|conn| Ok((term::current_term(conn)?, term::voted_for(conn)?)))
            .unwrap();
        assert_eq!(term, 4);
        assert_eq!(voted_for.as_deref(), Some("B"));
    }
}
