//! relayd: local multi-agent message broker daemon.
//!
//! Agents connect over a Unix domain socket and exchange framed envelopes;
//! the daemon routes direct messages, topic broadcasts, channel messages,
//! and spawn/release requests, tracks deliveries until acked, and bridges
//! outbox files through the relay watchdog.

pub mod config;
pub mod connection;
pub mod delivery;
pub mod events;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod spawn;
pub mod storage;
pub mod watchdog;

use crate::config::RelayConfig;
use crate::events::{RouterEvent, WatchdogEvent};
use crate::rate_limit::RateLimiter;
use crate::registry::AgentRegistry;
use crate::router::{Router, RouterConfig};
use crate::spawn::SpawnManager;
use crate::storage::Storage;
use crate::watchdog::{DeliveredFile, Watchdog};
use relay_protocol::{Body, Envelope, MessagePayload};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("storage: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("watchdog: {0}")]
    Watchdog(#[from] watchdog::WatchdogError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The assembled daemon: storage, router, watchdog, spawn manager, and the
/// socket accept loop.
pub struct RelayDaemon {
    config: Arc<RelayConfig>,
    storage: Arc<tokio::sync::Mutex<Storage>>,
    router: Arc<Router>,
    spawner: Arc<SpawnManager>,
    watchdog: Arc<Watchdog>,
    router_events: broadcast::Sender<RouterEvent>,
    watchdog_events: broadcast::Sender<WatchdogEvent>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RelayDaemon {
    /// Open storage, wire every subsystem, bind the socket, and start
    /// serving.  Only fatal init errors propagate; everything later is
    /// contained per subsystem.
    pub async fn start(config: RelayConfig) -> Result<Arc<Self>, DaemonError> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.root_dir)?;
        std::fs::create_dir_all(config.attachments_dir())?;

        let storage = Arc::new(tokio::sync::Mutex::new(Storage::open(
            &config.meta_db_path(),
        )?));
        let registry = Arc::new(AgentRegistry::load(Arc::clone(&storage)).await);
        let limiter = Arc::new(if config.rate_limit_enabled {
            RateLimiter::new(config.rate_limit)
        } else {
            RateLimiter::noop()
        });

        let router_events = events::router_channel();
        let router = Router::new(
            RouterConfig {
                processing_timeout: config.processing_timeout,
                spawning_timeout: config.spawning_timeout,
                dedup_window: config.dedup_window,
                retry: config.delivery,
            },
            Arc::clone(&storage),
            registry,
            limiter,
            router_events.clone(),
            None,
        );
        let spawner = SpawnManager::new(Arc::clone(&router));

        // Relay file bridge: watchdog deliveries become SENDs from the
        // file-writing agent.  The bridge must be draining before the
        // watchdog's initial scan, which may find a full outbox.
        let (file_tx, file_rx) = mpsc::channel::<DeliveredFile>(256);
        let bridge_task = tokio::spawn(bridge_files(Arc::clone(&router), file_rx));

        // Resolve symlinks on the configured directories before watching.
        let outbox_dir = config.outbox_dir();
        let archive_dir = config.archive_dir();
        std::fs::create_dir_all(&outbox_dir)?;
        std::fs::create_dir_all(&archive_dir)?;
        let outbox_dir = std::fs::canonicalize(&outbox_dir)?;
        let archive_dir = std::fs::canonicalize(&archive_dir)?;

        let watchdog_events = events::watchdog_channel();
        let watchdog = Watchdog::new(
            config.watchdog.clone(),
            outbox_dir,
            archive_dir,
            Arc::clone(&storage),
            watchdog_events.clone(),
            file_tx,
        );
        watchdog.start().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        // Stale socket from a dead daemon: unlink before bind.
        if config.socket_path.exists() {
            std::fs::remove_file(&config.socket_path)?;
        }
        if let Some(parent) = config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&config.socket_path)?;
        info!(socket = %config.socket_path.display(), root = %config.root_dir.display(), "relayd listening");

        let daemon = Arc::new(RelayDaemon {
            config: Arc::clone(&config),
            storage,
            router: Arc::clone(&router),
            spawner: Arc::clone(&spawner),
            watchdog,
            router_events,
            watchdog_events,
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = daemon.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(tokio::spawn(server::run_listener(
            listener,
            Arc::clone(&router),
            spawner,
            config,
            shutdown_rx,
        )));
        tasks.push(bridge_task);
        drop(tasks);

        Ok(daemon)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn storage(&self) -> &Arc<tokio::sync::Mutex<Storage>> {
        &self.storage
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn subscribe_router_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.router_events.subscribe()
    }

    pub fn subscribe_watchdog_events(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.watchdog_events.subscribe()
    }

    /// Graceful stop: stop accepting, kill spawned children, cancel timers
    /// and watchers, and release the socket path.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.spawner.shutdown().await;
        self.watchdog.stop();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        info!("relayd stopped");
    }
}

/// Turn processed outbox files into in-band SENDs.
///
/// Recognised headers: `TO` (required), `TOPIC`, `KIND` (defaults to the
/// file's message type), `THREAD`.  The full header map rides along in
/// payload data for the recipient.
async fn bridge_files(router: Arc<Router>, mut files: mpsc::Receiver<DeliveredFile>) {
    while let Some(file) = files.recv().await {
        let Some(to) = file.headers.get("TO").cloned() else {
            warn!(
                file_id = %file.file_id,
                agent = %file.agent_name,
                "outbox file has no TO header, dropped"
            );
            continue;
        };
        let kind = file
            .headers
            .get("KIND")
            .cloned()
            .unwrap_or_else(|| file.message_type.clone());
        let data = serde_json::json!({
            "fileId": file.file_id,
            "messageType": file.message_type,
            "headers": file.headers,
        });
        let mut envelope = Envelope::new(Body::Send {
            payload: MessagePayload {
                kind,
                body: file.body,
                data: Some(data),
                thread: file.headers.get("THREAD").cloned(),
            },
        })
        .with_from(file.agent_name.clone())
        .with_to(to);
        if let Some(topic) = file.headers.get("TOPIC") {
            envelope = envelope.with_topic(topic.clone());
        }
        router.route_message(&file.agent_name, envelope).await;
    }
}
