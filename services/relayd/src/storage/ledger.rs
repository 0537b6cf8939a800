//! Relay file ledger.
//!
//! Transactional record of every outbox file the watchdog discovers.  A file
//! moves through states in one direction only:
//!
//! ```text
//! pending -> processing -> {delivered | failed} -> archived
//! ```
//!
//! Crash recovery may reset processing -> pending once at startup.  The
//! `claim_file` guarded UPDATE is the single point of mutual exclusion
//! between would-be processors of the same file.

use super::{now_utc, Storage, StorageError, StorageResult};
use rusqlite::{params, OptionalExtension};
use std::path::Path;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Ledger row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFileStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Archived,
}

impl RelayFileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayFileStatus::Pending => "pending",
            RelayFileStatus::Processing => "processing",
            RelayFileStatus::Delivered => "delivered",
            RelayFileStatus::Failed => "failed",
            RelayFileStatus::Archived => "archived",
        }
    }

    fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "pending" => Ok(RelayFileStatus::Pending),
            "processing" => Ok(RelayFileStatus::Processing),
            "delivered" => Ok(RelayFileStatus::Delivered),
            "failed" => Ok(RelayFileStatus::Failed),
            "archived" => Ok(RelayFileStatus::Archived),
            other => Err(StorageError::InvalidData(format!(
                "unknown relay file status '{other}'"
            ))),
        }
    }
}

/// A full ledger row.
#[derive(Debug, Clone)]
pub struct RelayFileRecord {
    pub file_id: String,
    pub source_path: String,
    pub symlink_path: Option<String>,
    pub agent_name: String,
    pub message_type: String,
    pub size: u64,
    pub content_hash: Option<String>,
    pub mtime_ns: Option<i64>,
    pub inode: Option<i64>,
    pub status: RelayFileStatus,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub archive_path: Option<String>,
}

/// Fields for a new registration; `file_id` and `created_at` are assigned
/// by the ledger.
#[derive(Debug, Clone)]
pub struct NewRelayFile<'a> {
    pub source_path: &'a str,
    pub symlink_path: Option<&'a str>,
    pub agent_name: &'a str,
    pub message_type: &'a str,
    pub size: u64,
    pub content_hash: Option<&'a str>,
    pub mtime_ns: Option<i64>,
    pub inode: Option<i64>,
}

/// Outcome of a `claim_file` call.  Exactly one of any set of concurrent
/// callers for the same id gets `Claimed`.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(RelayFileRecord),
    Rejected { reason: String },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub pending: u64,
    pub processing: u64,
    pub delivered: u64,
    pub failed: u64,
    pub archived: u64,
}

// ---------------------------------------------------------------------------
// Ledger operations
// ---------------------------------------------------------------------------

impl Storage {
    /// Register a discovered file; idempotent on `source_path`.
    ///
    /// Returns the existing id when the path is already registered, else
    /// inserts a new `pending` row and returns its fresh ULID.  The unique
    /// index on `source_path` serializes duplicate registrations.
    pub fn register_file(&mut self, file: &NewRelayFile<'_>) -> StorageResult<String> {
        let tx = self.conn_mut().transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT file_id FROM relay_files WHERE source_path = ?1",
                params![file.source_path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.commit()?;
            return Ok(id);
        }

        let file_id = ulid::Ulid::new().to_string();
        tx.execute(
            "INSERT INTO relay_files
                 (file_id, source_path, symlink_path, agent_name, message_type,
                  size, content_hash, mtime_ns, inode, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
            params![
                file_id,
                file.source_path,
                file.symlink_path,
                file.agent_name,
                file.message_type,
                file.size as i64,
                file.content_hash,
                file.mtime_ns,
                file.inode,
                now_utc(),
            ],
        )?;
        tx.commit()?;
        Ok(file_id)
    }

    /// Attempt to claim a `pending` file for processing.
    ///
    /// Transactional `UPDATE … WHERE status='pending'`; success only when
    /// exactly one row changed, so concurrent callers cannot both win.
    pub fn claim_file(&mut self, file_id: &str) -> StorageResult<ClaimOutcome> {
        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute(
            "UPDATE relay_files SET status = 'processing'
             WHERE file_id = ?1 AND status = 'pending'",
            params![file_id],
        )?;
        if changed != 1 {
            tx.commit()?;
            return Ok(ClaimOutcome::Rejected {
                reason: "not_pending".to_owned(),
            });
        }
        let record = query_by_id(&tx, file_id)?.ok_or_else(|| {
            StorageError::InvalidData(format!("claimed file {file_id} vanished"))
        })?;
        tx.commit()?;
        Ok(ClaimOutcome::Claimed(record))
    }

    /// processing -> delivered.
    pub fn mark_delivered(&mut self, file_id: &str) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE relay_files SET status = 'delivered', processed_at = ?2
             WHERE file_id = ?1 AND status = 'processing'",
            params![file_id, now_utc()],
        )?;
        Ok(())
    }

    /// {pending, processing, delivered} -> failed.
    pub fn mark_failed(&mut self, file_id: &str, reason: &str) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE relay_files
             SET status = 'failed', failure_reason = ?2, processed_at = ?3
             WHERE file_id = ?1 AND status IN ('pending','processing','delivered')",
            params![file_id, reason, now_utc()],
        )?;
        Ok(())
    }

    /// {delivered, failed} -> archived.
    pub fn mark_archived(&mut self, file_id: &str, archive_path: &str) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE relay_files SET status = 'archived', archive_path = ?2
             WHERE file_id = ?1 AND status IN ('delivered','failed')",
            params![file_id, archive_path],
        )?;
        Ok(())
    }

    /// Startup recovery: every `processing` row goes back to `pending`.
    ///
    /// The only legal backwards transition.  Idempotent on a quiescent
    /// ledger (a second call finds no processing rows).
    pub fn reset_processing_files(&mut self) -> StorageResult<u64> {
        let changed = self.conn().execute(
            "UPDATE relay_files SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        Ok(changed as u64)
    }

    /// Mark every not-yet-archived row whose source file is gone as failed.
    ///
    /// Returns the number of rows failed.
    pub fn reconcile_with_filesystem(&mut self) -> StorageResult<u64> {
        let paths: Vec<(String, String)> = {
            let mut stmt = self.conn().prepare(
                "SELECT file_id, source_path FROM relay_files
                 WHERE status IN ('pending','processing','delivered')",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut failed = 0u64;
        for (file_id, source_path) in paths {
            if !Path::new(&source_path).exists() {
                self.mark_failed(&file_id, "missing")?;
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Pending rows, oldest first (ULIDs sort by creation time).
    pub fn get_pending_files(&self, limit: Option<u32>) -> StorageResult<Vec<RelayFileRecord>> {
        let limit = i64::from(limit.unwrap_or(u32::MAX));
        let mut stmt = self.conn().prepare(
            "SELECT file_id, source_path, symlink_path, agent_name, message_type,
                    size, content_hash, mtime_ns, inode, status, failure_reason,
                    created_at, processed_at, archive_path
             FROM relay_files WHERE status = 'pending'
             ORDER BY file_id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], map_record)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(from_row(r?)?);
        }
        Ok(out)
    }

    pub fn get_by_id(&self, file_id: &str) -> StorageResult<Option<RelayFileRecord>> {
        query_by_id(self.conn(), file_id)
    }

    pub fn is_file_registered(&self, source_path: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM relay_files WHERE source_path = ?1",
                params![source_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_stats(&self) -> StorageResult<LedgerStats> {
        let mut stats = LedgerStats::default();
        let mut stmt = self
            .conn()
            .prepare("SELECT status, COUNT(*) FROM relay_files GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for r in rows {
            let (status, count) = r?;
            let count = count as u64;
            match RelayFileStatus::parse(&status)? {
                RelayFileStatus::Pending => stats.pending = count,
                RelayFileStatus::Processing => stats.processing = count,
                RelayFileStatus::Delivered => stats.delivered = count,
                RelayFileStatus::Failed => stats.failed = count,
                RelayFileStatus::Archived => stats.archived = count,
            }
        }
        Ok(stats)
    }

    /// Purge archived rows older than `retention`.
    pub fn cleanup_archived_records(
        &mut self,
        retention: std::time::Duration,
    ) -> StorageResult<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let changed = self.conn().execute(
            "DELETE FROM relay_files WHERE status = 'archived' AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(changed as u64)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

type RawRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    Option<String>,
    Option<i64>,
    Option<i64>,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn map_record(row: &rusqlite::Row<'_>) -> Result<RawRow, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn from_row(raw: RawRow) -> StorageResult<RelayFileRecord> {
    Ok(RelayFileRecord {
        file_id: raw.0,
        source_path: raw.1,
        symlink_path: raw.2,
        agent_name: raw.3,
        message_type: raw.4,
        size: raw.5 as u64,
        content_hash: raw.6,
        mtime_ns: raw.7,
        inode: raw.8,
        status: RelayFileStatus::parse(&raw.9)?,
        failure_reason: raw.10,
        created_at: raw.11,
        processed_at: raw.12,
        archive_path: raw.13,
    })
}

fn query_by_id(
    conn: &rusqlite::Connection,
    file_id: &str,
) -> StorageResult<Option<RelayFileRecord>> {
    let raw = conn
        .query_row(
            "SELECT file_id, source_path, symlink_path, agent_name, message_type,
                    size, content_hash, mtime_ns, inode, status, failure_reason,
                    created_at, processed_at, archive_path
             FROM relay_files WHERE file_id = ?1",
            params![file_id],
            map_record,
        )
        .optional()?;
    raw.map(from_row).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_file<'a>(path: &'a str, agent: &'a str) -> NewRelayFile<'a> {
        NewRelayFile {
            source_path: path,
            symlink_path: None,
            agent_name: agent,
            message_type: "msg",
            size: 12,
            content_hash: Some("0011223344556677"),
            mtime_ns: Some(1_000),
            inode: Some(42),
        }
    }

    #[test]
    fn register_is_idempotent_on_source_path() {
        let mut s = Storage::open_in_memory().unwrap();
        let id1 = s.register_file(&new_file("/outbox/a/msg", "a")).unwrap();
        let id2 = s.register_file(&new_file("/outbox/a/msg", "a")).unwrap();
        assert_eq!(id1, id2);
        assert!(s.is_file_registered("/outbox/a/msg").unwrap());
        assert!(!s.is_file_registered("/outbox/a/other").unwrap());
    }

    #[test]
    fn claim_succeeds_once_then_rejects() {
        let mut s = Storage::open_in_memory().unwrap();
        let id = s.register_file(&new_file("/outbox/a/msg", "a")).unwrap();

        let first = s.claim_file(&id).unwrap();
        assert!(first.is_claimed());
        let second = s.claim_file(&id).unwrap();
        match second {
            ClaimOutcome::Rejected { reason } => assert_eq!(reason, "not_pending"),
            ClaimOutcome::Claimed(_) => panic!("second claim must not succeed"),
        }
    }

    #[test]
    fn state_machine_is_one_directional() {
        let mut s = Storage::open_in_memory().unwrap();
        let id = s.register_file(&new_file("/outbox/a/msg", "a")).unwrap();
        assert!(s.claim_file(&id).unwrap().is_claimed());
        s.mark_delivered(&id).unwrap();
        s.mark_archived(&id, "/archive/a/2026-08-01/x-msg").unwrap();

        let rec = s.get_by_id(&id).unwrap().unwrap();
        assert_eq!(rec.status, RelayFileStatus::Archived);
        assert!(rec.archive_path.is_some());

        // Archived rows never go back.
        s.mark_failed(&id, "late failure").unwrap();
        let rec = s.get_by_id(&id).unwrap().unwrap();
        assert_eq!(rec.status, RelayFileStatus::Archived);
    }

    #[test]
    fn reset_processing_returns_rows_to_pending_and_is_idempotent() {
        let mut s = Storage::open_in_memory().unwrap();
        let id = s.register_file(&new_file("/outbox/alice/msg", "alice")).unwrap();
        assert!(s.claim_file(&id).unwrap().is_claimed());

        assert_eq!(s.reset_processing_files().unwrap(), 1);
        assert_eq!(s.reset_processing_files().unwrap(), 0);

        // Reclaim succeeds after the reset.
        assert!(s.claim_file(&id).unwrap().is_claimed());
    }

    #[test]
    fn reconcile_marks_missing_files_failed() {
        let mut s = Storage::open_in_memory().unwrap();
        let id = s
            .register_file(&new_file("/nonexistent/outbox/a/msg", "a"))
            .unwrap();
        let failed = s.reconcile_with_filesystem().unwrap();
        assert_eq!(failed, 1);
        let rec = s.get_by_id(&id).unwrap().unwrap();
        assert_eq!(rec.status, RelayFileStatus::Failed);
        assert_eq!(rec.failure_reason.as_deref(), Some("missing"));
    }

    #[test]
    fn stats_count_by_status() {
        let mut s = Storage::open_in_memory().unwrap();
        s.register_file(&new_file("/p1", "a")).unwrap();
        let id = s.register_file(&new_file("/p2", "a")).unwrap();
        assert!(s.claim_file(&id).unwrap().is_claimed());

        let stats = s.get_stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.archived, 0);
    }

    #[test]
    fn pending_files_respect_limit_and_order() {
        let mut s = Storage::open_in_memory().unwrap();
        let first = s.register_file(&new_file("/p1", "a")).unwrap();
        let _second = s.register_file(&new_file("/p2", "a")).unwrap();

        let pending = s.get_pending_files(Some(1)).unwrap();
        assert_eq!(pending.len(), 1);
        // ULIDs sort by creation order.
        assert_eq!(pending[0].file_id, first);
    }
}
