//! Relay file watchdog.
//!
//! Turns files dropped into `<outbox>/<agent>/<messageType>` into in-band
//! deliveries, exactly once per file identity.  The ledger's `claim_file`
//! is the mutual-exclusion point; the watchdog itself is stateless across
//! restarts beyond the settle timers.
//!
//! # Pipeline
//! event -> settle (debounce) -> validate -> register -> claim -> parse ->
//! sink -> mark delivered -> archive.
//!
//! Dropped filesystem events are recovered by periodic reconciliation, which
//! rescans every agent subdirectory and drives ledger-`pending` rows through
//! processing.

use crate::config::WatchdogSettings;
use crate::events::WatchdogEvent;
use crate::storage::{ClaimOutcome, NewRelayFile, Storage};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A processed outbox file handed to the in-band bridge.
#[derive(Debug, Clone)]
pub struct DeliveredFile {
    pub file_id: String,
    pub agent_name: String,
    pub message_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("watcher: {0}")]
    Notify(#[from] notify::Error),
    #[error("storage: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

pub struct Watchdog {
    settings: WatchdogSettings,
    outbox_root: PathBuf,
    archive_root: PathBuf,
    storage: Arc<tokio::sync::Mutex<Storage>>,
    events: tokio::sync::broadcast::Sender<WatchdogEvent>,
    sink: mpsc::Sender<DeliveredFile>,
    settle_timers: Mutex<std::collections::HashMap<PathBuf, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Watchdog {
    pub fn new(
        settings: WatchdogSettings,
        outbox_root: PathBuf,
        archive_root: PathBuf,
        storage: Arc<tokio::sync::Mutex<Storage>>,
        events: tokio::sync::broadcast::Sender<WatchdogEvent>,
        sink: mpsc::Sender<DeliveredFile>,
    ) -> Arc<Self> {
        Arc::new(Watchdog {
            settings,
            outbox_root,
            archive_root,
            storage,
            events,
            sink,
            settle_timers: Mutex::new(std::collections::HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    /// Start the watchdog: recover the ledger, run the initial scan, install
    /// the filesystem watcher, and arm the periodic timers.
    pub async fn start(self: &Arc<Self>) -> Result<(), WatchdogError> {
        std::fs::create_dir_all(&self.outbox_root)?;
        std::fs::create_dir_all(&self.archive_root)?;

        // Crash recovery before anything can race: processing rows return to
        // pending, rows whose file vanished fail.
        {
            let mut store = self.storage.lock().await;
            let reset = store.reset_processing_files()?;
            if reset > 0 {
                info!(count = reset, "reset processing relay files to pending");
            }
            store.reconcile_with_filesystem()?;
        }

        self.reconcile().await;

        // Recursive root watcher: covers existing agent subdirectories and
        // discovers new ones.
        let (event_tx, event_rx) = mpsc::channel::<notify::Result<notify::Event>>(1024);
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.blocking_send(res);
        })?;
        watcher.watch(&self.outbox_root, RecursiveMode::Recursive)?;
        *lock(&self.watcher) = Some(watcher);

        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(Arc::clone(self).event_loop(event_rx)));
        tasks.push(tokio::spawn(Arc::clone(self).reconcile_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).cleanup_loop()));
        Ok(())
    }

    /// Cancel timers and drop the watcher.
    pub fn stop(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for (_, timer) in lock(&self.settle_timers).drain() {
            timer.abort();
        }
        lock(&self.watcher).take();
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<notify::Result<notify::Event>>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                    ) {
                        continue;
                    }
                    for path in event.paths {
                        self.schedule_settle(path);
                    }
                }
                Err(e) => {
                    // Dropped or broken watch stream: recover via full scan.
                    warn!(error = %e, "watcher error, forcing reconciliation");
                    let _ = self.events.send(WatchdogEvent::WatcherOverflow);
                    self.reconcile().await;
                }
            }
        }
    }

    /// Debounce: (re)start the settle timer for a path.  A re-event while
    /// the timer runs restarts it, so writes in progress are not picked up.
    fn schedule_settle(self: &Arc<Self>, path: PathBuf) {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        if is_ignored(file_name) {
            return;
        }
        let mut timers = lock(&self.settle_timers);
        if let Some(old) = timers.remove(&path) {
            old.abort();
        }
        let watchdog = Arc::clone(self);
        let timer_path = path.clone();
        timers.insert(
            path,
            tokio::spawn(async move {
                tokio::time::sleep(watchdog.settings.settle).await;
                lock(&watchdog.settle_timers).remove(&timer_path);
                watchdog.process_path(&timer_path).await;
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Per-file pipeline
    // -----------------------------------------------------------------------

    async fn process_path(self: &Arc<Self>, path: &Path) {
        match self.register_path(path).await {
            Ok(Some(file_id)) => self.process_claimed(&file_id).await,
            Ok(None) => {}
            Err(reason) => {
                debug!(path = %path.display(), reason = %reason, "file rejected");
            }
        }
    }

    /// Validate and register one file.  Returns the ledger id, or `None`
    /// when the file is already registered past `pending`, or an error
    /// string when validation rejects it (the file stays on disk for the
    /// next reconcile; symlinks are rejected permanently).
    async fn register_path(self: &Arc<Self>, path: &Path) -> Result<Option<String>, String> {
        // Inspect the arrival path without following symlinks.
        let lstat = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| format!("lstat: {e}"))?;
        if lstat.file_type().is_symlink() {
            let _ = self.events.send(WatchdogEvent::Error {
                context: "validate".to_owned(),
                error: format!("symlink payload rejected: {}", path.display()),
            });
            return Err("symlink".to_owned());
        }
        if !lstat.file_type().is_file() {
            return Err("not a regular file".to_owned());
        }
        let size = lstat.len();
        if size == 0 {
            return Err("empty file".to_owned());
        }
        if size > self.settings.max_message_size {
            return Err(format!(
                "{size} bytes exceeds {} byte limit",
                self.settings.max_message_size
            ));
        }

        // Stability probe: the size and mtime must survive a 50 ms re-stat.
        let mtime = lstat.modified().map_err(|e| e.to_string())?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let restat = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| format!("re-stat: {e}"))?;
        if restat.len() != size || restat.modified().map_err(|e| e.to_string())? != mtime {
            return Err("file still changing".to_owned());
        }

        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| format!("realpath: {e}"))?;
        let (agent_name, message_type) = split_outbox_path(&canonical)
            .ok_or_else(|| "path is not <outbox>/<agent>/<type>".to_owned())?;

        let content = tokio::fs::read(&canonical)
            .await
            .map_err(|e| format!("read: {e}"))?;
        let hash = content_hash(&content);
        let mtime_ns = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos() as i64);
        let inode = file_inode(&lstat);

        let canonical_str = canonical.to_string_lossy().into_owned();
        let arrival_str = path.to_string_lossy().into_owned();
        let symlink_path = (canonical_str != arrival_str).then_some(arrival_str);

        let registration = {
            let mut store = self.storage.lock().await;
            store.register_file(&NewRelayFile {
                source_path: &canonical_str,
                symlink_path: symlink_path.as_deref(),
                agent_name: &agent_name,
                message_type: &message_type,
                size,
                content_hash: Some(&hash),
                mtime_ns,
                inode,
            })
        };
        match registration {
            Ok(file_id) => {
                let _ = self.events.send(WatchdogEvent::FileDiscovered {
                    file_id: file_id.clone(),
                    agent_name,
                    message_type,
                });
                Ok(Some(file_id))
            }
            Err(e) => {
                let _ = self.events.send(WatchdogEvent::Error {
                    context: "register_file".to_owned(),
                    error: e.to_string(),
                });
                Err(e.to_string())
            }
        }
    }

    /// Claim -> read -> parse -> sink -> delivered -> archive.
    async fn process_claimed(self: &Arc<Self>, file_id: &str) {
        let record = {
            let mut store = self.storage.lock().await;
            match store.claim_file(file_id) {
                Ok(ClaimOutcome::Claimed(record)) => record,
                Ok(ClaimOutcome::Rejected { reason }) => {
                    debug!(file_id = %file_id, reason = %reason, "claim lost");
                    return;
                }
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "claim failed");
                    return;
                }
            }
        };

        match self.deliver_file(&record).await {
            Ok(()) => {
                {
                    let mut store = self.storage.lock().await;
                    if let Err(e) = store.mark_delivered(file_id) {
                        warn!(file_id = %file_id, error = %e, "mark delivered failed");
                    }
                }
                let _ = self.events.send(WatchdogEvent::FileDelivered {
                    file_id: file_id.to_owned(),
                    agent_name: record.agent_name.clone(),
                });
                self.archive_file(&record).await;
            }
            Err(reason) => {
                warn!(file_id = %file_id, reason = %reason, "file processing failed");
                let mut store = self.storage.lock().await;
                if let Err(e) = store.mark_failed(file_id, &reason) {
                    warn!(file_id = %file_id, error = %e, "mark failed failed");
                }
                drop(store);
                let _ = self.events.send(WatchdogEvent::FileFailed {
                    file_id: file_id.to_owned(),
                    reason,
                });
            }
        }
    }

    async fn deliver_file(
        &self,
        record: &crate::storage::RelayFileRecord,
    ) -> Result<(), String> {
        let bytes = tokio::fs::read(&record.source_path)
            .await
            .map_err(|e| format!("read: {e}"))?;
        let text = String::from_utf8(bytes).map_err(|e| format!("not UTF-8: {e}"))?;
        let parsed = relay_protocol::outbox::parse(&text);
        let delivered = DeliveredFile {
            file_id: record.file_id.clone(),
            agent_name: record.agent_name.clone(),
            message_type: record.message_type.clone(),
            headers: parsed.headers,
            body: parsed.body,
        };
        self.sink
            .send(delivered)
            .await
            .map_err(|_| "delivery sink closed".to_owned())
    }

    /// Move the source file to `<archive>/<agent>/YYYY-MM-DD/<id>-<type>`.
    /// A cross-filesystem rename falls back to copy-then-unlink.
    async fn archive_file(self: &Arc<Self>, record: &crate::storage::RelayFileRecord) {
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let dir = self.archive_root.join(&record.agent_name).join(date);
        let target = dir.join(format!("{}-{}", record.file_id, record.message_type));

        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            match tokio::fs::rename(&record.source_path, &target).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    tokio::fs::copy(&record.source_path, &target).await?;
                    tokio::fs::remove_file(&record.source_path).await
                }
            }
        }
        .await;

        match result {
            Ok(()) => {
                let mut store = self.storage.lock().await;
                if let Err(e) =
                    store.mark_archived(&record.file_id, &target.to_string_lossy())
                {
                    warn!(file_id = %record.file_id, error = %e, "mark archived failed");
                }
            }
            Err(e) => {
                warn!(file_id = %record.file_id, error = %e, "archive move failed");
                let _ = self.events.send(WatchdogEvent::Error {
                    context: "archive".to_owned(),
                    error: e.to_string(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation + cleanup
    // -----------------------------------------------------------------------

    async fn reconcile_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick consumed
        loop {
            interval.tick().await;
            self.reconcile().await;
        }
    }

    /// Full scan: register unknown files, fail rows whose file vanished,
    /// and drive every `pending` row through processing.
    pub async fn reconcile(self: &Arc<Self>) {
        let mut registered = 0u64;
        for path in scan_outbox(&self.outbox_root) {
            let already = {
                let canonical = match std::fs::canonicalize(&path) {
                    Ok(canonical) => canonical,
                    Err(_) => continue,
                };
                let store = self.storage.lock().await;
                store
                    .is_file_registered(&canonical.to_string_lossy())
                    .unwrap_or(false)
            };
            if already {
                continue;
            }
            if let Ok(Some(_)) = self.register_path(&path).await {
                registered += 1;
            }
        }

        let failed = {
            let mut store = self.storage.lock().await;
            store.reconcile_with_filesystem().unwrap_or_else(|e| {
                let _ = self.events.send(WatchdogEvent::Error {
                    context: "reconcile".to_owned(),
                    error: e.to_string(),
                });
                0
            })
        };

        let pending = {
            let store = self.storage.lock().await;
            store.get_pending_files(None).unwrap_or_default()
        };
        for record in pending {
            self.process_claimed(&record.file_id).await;
        }

        let _ = self
            .events
            .send(WatchdogEvent::ReconcileComplete { registered, failed });
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.cleanup().await;
        }
    }

    /// Delete orphaned `.pending` sidecars and purge old archived rows.
    pub async fn cleanup(self: &Arc<Self>) {
        let cutoff = self.settings.orphaned_pending_age;
        for path in scan_outbox_matching(&self.outbox_root, |name| name.ends_with(".pending")) {
            let stale = std::fs::symlink_metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|age| age > cutoff);
            if stale {
                debug!(path = %path.display(), "removing orphaned .pending file");
                let _ = std::fs::remove_file(&path);
            }
        }

        let mut store = self.storage.lock().await;
        match store.cleanup_archived_records(self.settings.archive_retention) {
            Ok(purged) if purged > 0 => {
                info!(purged, "purged archived ledger rows past retention");
            }
            Ok(_) => {}
            Err(e) => {
                let _ = self.events.send(WatchdogEvent::Error {
                    context: "cleanup".to_owned(),
                    error: e.to_string(),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Hidden files, sidecars, temp files, and editor backups are never payload.
fn is_ignored(file_name: &str) -> bool {
    file_name.starts_with('.')
        || file_name.ends_with(".pending")
        || file_name.ends_with(".tmp")
        || file_name.ends_with('~')
        || file_name.ends_with(".swp")
        || (file_name.starts_with('#') && file_name.ends_with('#'))
}

/// First 16 hex chars of the SHA-256 of the content.
fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// `<outbox>/<agent>/<type>` -> (agent, type).
fn split_outbox_path(path: &Path) -> Option<(String, String)> {
    let message_type = path.file_name()?.to_str()?.to_owned();
    let agent_name = path.parent()?.file_name()?.to_str()?.to_owned();
    Some((agent_name, message_type))
}

#[cfg(unix)]
fn file_inode(meta: &std::fs::Metadata) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino() as i64)
}

#[cfg(not(unix))]
fn file_inode(_meta: &std::fs::Metadata) -> Option<i64> {
    None
}

/// Non-ignored payload files under every agent subdirectory.
fn scan_outbox(outbox_root: &Path) -> Vec<PathBuf> {
    scan_outbox_matching(outbox_root, |name| !is_ignored(name))
}

fn scan_outbox_matching(outbox_root: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(agents) = std::fs::read_dir(outbox_root) else {
        return files;
    };
    for agent in agents.flatten() {
        if !agent.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(agent.path()) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if keep(name) {
                files.push(entry.path());
            }
        }
    }
    files
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
