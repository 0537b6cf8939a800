//! Durable SQLite store for the daemon.
//!
//! One database at `<root>/meta/ledger.sqlite` holds the relay file ledger,
//! the message store, the agent registry, and channel membership.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  PRAGMA integrity_check runs at open; returns an error
//! if it fails.
//!
//! Async callers hold the store behind `Arc<Mutex<Storage>>`; every write
//! goes through one of the transactional operations here.

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

pub mod ledger;
pub mod messages;

pub use ledger::{ClaimOutcome, LedgerStats, NewRelayFile, RelayFileRecord, RelayFileStatus};
pub use messages::{ChannelMembership, StoredMessage};

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// The daemon's single SQLite database.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open (or create) the database at `path`.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let storage = Storage { conn };
        storage.apply_pragmas()?;
        storage.run_integrity_check()?;
        storage.apply_schema()?;
        Ok(storage)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Storage { conn };
        storage.apply_pragmas()?;
        storage.apply_schema()?;
        Ok(storage)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn apply_pragmas(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn run_integrity_check(&self) -> StorageResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StorageError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

/// RFC 3339 UTC timestamp for `*_at` columns.
pub(crate) fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
