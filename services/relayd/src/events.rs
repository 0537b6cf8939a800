//! Observer events.
//!
//! The event-emitter surface is an enumerated broadcast channel: subscribers
//! call `subscribe()` on the daemon and match on the variants.  Lagging
//! subscribers lose events (broadcast semantics); the daemon never blocks on
//! an observer.

use tokio::sync::broadcast;

/// Events emitted by the router and delivery tracker.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    AgentOnline {
        name: String,
    },
    AgentOffline {
        name: String,
    },
    /// Processing-state transition for an agent; `processing` is false when
    /// the state cleared (send, explicit clear, or the 30 s watchdog).
    ProcessingChanged {
        name: String,
        processing: bool,
        message_id: Option<String>,
    },
    /// A message was dropped (unknown recipient or missing sender name).
    MessageDropped {
        message_id: String,
        reason: String,
    },
    /// Retries exhausted; the stored record was marked failed.
    DeliveryFailed {
        message_id: String,
        recipient: String,
    },
    /// A persistence error that did not block in-memory routing.
    StorageError {
        context: String,
        error: String,
    },
}

/// Events emitted by the relay watchdog.
#[derive(Debug, Clone)]
pub enum WatchdogEvent {
    FileDiscovered {
        file_id: String,
        agent_name: String,
        message_type: String,
    },
    FileDelivered {
        file_id: String,
        agent_name: String,
    },
    FileFailed {
        file_id: String,
        reason: String,
    },
    /// OS watcher overflowed or errored; a full reconciliation was triggered.
    WatcherOverflow,
    ReconcileComplete {
        registered: u64,
        failed: u64,
    },
    Error {
        context: String,
        error: String,
    },
}

/// Capacity for daemon event channels.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

pub fn router_channel() -> broadcast::Sender<RouterEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

pub fn watchdog_channel() -> broadcast::Sender<WatchdogEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
