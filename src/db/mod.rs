//! SQLite-backed reference message store.
//!
//! The database lives at `~/.threadlink/threadlink.db` by default. It holds the
//! ingested corpus (messages, participants, attachments), the linkable
//! entities, every link state with its version, override history, and the
//! serialized thread arena. Ingestion writes messages; the engine only writes
//! link state, thread ids, conflicts and rollups.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};

pub mod types;
pub use types::*;

pub mod entities;
pub mod links;
pub mod messages;
pub mod threads;

pub struct CorpusDb {
    conn: Mutex<Connection>,
}

impl CorpusDb {
    /// Lock the underlying connection for ad-hoc queries.
    ///
    /// The guard must not be held across calls to other `CorpusDb` methods;
    /// the mutex is not reentrant.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(val),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default path and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for concurrent readers while a batch commits
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a database in read-only mode, e.g. for a discovery-only reader.
    pub fn open_readonly_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Resolve the default database path: `~/.threadlink/threadlink.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".threadlink").join("threadlink.db"))
    }

    /// Liveness check run before a batch starts.
    pub fn ping(&self) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// Escape a fragment for use inside `LIKE '%...%' ESCAPE '\'`.
pub(crate) fn like_pattern(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 2);
    out.push('%');
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

// =============================================================================
// Shared test utilities
// =============================================================================
