//! Per-socket connection state.
//!
//! Each accepted socket gets a [`ConnectionHandle`] after its HELLO: the
//! outbound envelope queue, the session identity, and the per-(topic, peer)
//! sequence counters.  All sends to the peer go through the handle's bounded
//! queue; a single writer task per connection drains it onto the socket.

use relay_protocol::{framing, Envelope, EntityKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Monotonic connection id, unique for the daemon's lifetime.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outbound queue depth per connection.
pub const WRITE_QUEUE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("frame: {0}")]
    Frame(#[from] framing::FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("write queue blocked past deadline")]
    BackpressureTimeout,
    #[error("connection closed")]
    Closed,
    #[error("protocol: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// CLI/program/model/task/cwd metadata from HELLO.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub cli: Option<String>,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub cwd: Option<String>,
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// Shared per-connection state handed to the router after HELLO.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub name: String,
    pub entity: EntityKind,
    pub session_id: String,
    pub meta: ConnectionMeta,
    outbound: mpsc::Sender<Envelope>,
    /// Deadline for a blocked enqueue before the connection is failed.
    write_deadline: Duration,
    /// (topic, peer) -> last issued seq; strictly increasing per pair for
    /// the life of the connection.
    seq: Mutex<HashMap<(String, String), u64>>,
    close_tx: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new(
        name: String,
        entity: EntityKind,
        session_id: String,
        meta: ConnectionMeta,
        outbound: mpsc::Sender<Envelope>,
        write_deadline: Duration,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        ConnectionHandle {
            id: next_connection_id(),
            name,
            entity,
            session_id,
            meta,
            outbound,
            write_deadline,
            seq: Mutex::new(HashMap::new()),
            close_tx,
        }
    }

    /// Allocate the next delivery seq for a (topic, peer) pair.
    pub fn next_seq(&self, topic: &str, peer: &str) -> u64 {
        let mut seq = self
            .seq
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let counter = seq
            .entry((topic.to_owned(), peer.to_owned()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Enqueue an envelope for the writer task.
    ///
    /// Blocks while the queue is full; a block outlasting the write deadline
    /// returns `BackpressureTimeout` and the caller must close the
    /// connection.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ConnectionError> {
        match tokio::time::timeout(self.write_deadline, self.outbound.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::BackpressureTimeout),
        }
    }

    /// Signal the connection's tasks to stop.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain the outbound queue onto the socket, one frame per envelope.
///
/// Exits when the queue closes, the close signal fires, or a write fails.
pub async fn run_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Envelope>,
    mut closed: watch::Receiver<bool>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                let frame = match framing::encode(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, kind = envelope.kind_tag(), "dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(error = %e, "writer exiting");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
