//! Delivery tracking: ACK accounting and exponential retry.
//!
//! Every DELIVER that was successfully handed to a connection's write queue
//! is tracked here until the recipient ACKs it.  Retries target the
//! recipient's *current* connection — a replacement connection arriving
//! mid-retry takes over the remaining attempts.
//!
//! The tracker never holds a router back-pointer; it resolves connections
//! through a lookup callback supplied at construction.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::events::RouterEvent;
use crate::storage::Storage;
use relay_protocol::Envelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Retry schedule knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Backoff multiplier per retry.
    pub multiplier: u32,
    /// Total attempts including the initial send.
    pub max_attempts: u32,
    /// Overall deadline from the first send.
    pub ttl: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base: Duration::from_secs(1),
            multiplier: 2,
            max_attempts: 5,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Resolves an agent name to its current connection.
pub type ConnectionLookup =
    Arc<dyn Fn(&str) -> Option<Arc<ConnectionHandle>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct Pending {
    connection_id: ConnectionId,
    recipient: String,
    envelope: Envelope,
    first_sent: Instant,
    attempts: u32,
    timer: tokio::task::JoinHandle<()>,
}

/// In-flight delivery accounting.
pub struct DeliveryTracker {
    config: RetryConfig,
    pending: Mutex<HashMap<String, Pending>>,
    lookup: ConnectionLookup,
    storage: Arc<tokio::sync::Mutex<Storage>>,
    events: broadcast::Sender<RouterEvent>,
}

impl DeliveryTracker {
    pub fn new(
        config: RetryConfig,
        lookup: ConnectionLookup,
        storage: Arc<tokio::sync::Mutex<Storage>>,
        events: broadcast::Sender<RouterEvent>,
    ) -> Arc<Self> {
        Arc::new(DeliveryTracker {
            config,
            pending: Mutex::new(HashMap::new()),
            lookup,
            storage,
            events,
        })
    }

    /// Track a DELIVER that was just queued on `conn`; attempts start at 1.
    pub fn track(self: &Arc<Self>, conn: &Arc<ConnectionHandle>, envelope: Envelope) {
        let message_id = envelope.id.clone();
        let recipient = conn.name.clone();
        let timer = tokio::spawn(Self::retry_loop(
            Arc::clone(self),
            message_id.clone(),
            recipient.clone(),
        ));
        let entry = Pending {
            connection_id: conn.id,
            recipient,
            envelope,
            first_sent: Instant::now(),
            attempts: 1,
            timer,
        };
        let mut pending = lock(&self.pending);
        if let Some(stale) = pending.insert(message_id, entry) {
            stale.timer.abort();
        }
    }

    /// Settle an ACK.  Duplicates and unknown ids are ignored.
    pub fn ack(&self, ack_id: &str) -> bool {
        let removed = lock(&self.pending).remove(ack_id);
        match removed {
            Some(entry) => {
                entry.timer.abort();
                debug!(message_id = %ack_id, attempts = entry.attempts, "delivery acked");
                true
            }
            None => false,
        }
    }

    /// Cancel all entries for a closing connection without marking failure;
    /// the session may resume.
    pub fn cancel_for_connection(&self, connection_id: ConnectionId) {
        let mut pending = lock(&self.pending);
        pending.retain(|_, entry| {
            if entry.connection_id == connection_id {
                entry.timer.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    // -----------------------------------------------------------------------
    // Retry loop
    // -----------------------------------------------------------------------

    async fn retry_loop(tracker: Arc<Self>, message_id: String, recipient: String) {
        let config = tracker.config;
        let mut delay = config.base;

        loop {
            tokio::time::sleep(delay).await;

            // Snapshot the entry state; cleared means acked or cancelled.
            let (attempts, first_sent) = {
                let pending = lock(&tracker.pending);
                match pending.get(&message_id) {
                    Some(entry) => (entry.attempts, entry.first_sent),
                    None => return,
                }
            };

            if first_sent.elapsed() >= config.ttl {
                tracker.fail(&message_id, &recipient).await;
                return;
            }
            if attempts >= config.max_attempts {
                // Out of attempts: give the last one the rest of the TTL.
                let remaining = config.ttl.saturating_sub(first_sent.elapsed());
                tokio::time::sleep(remaining).await;
                if lock(&tracker.pending).contains_key(&message_id) {
                    tracker.fail(&message_id, &recipient).await;
                }
                return;
            }

            // Re-send to the recipient's current connection, which may be a
            // replacement for the one originally tracked.
            let target = (tracker.lookup)(&recipient);
            let envelope = {
                let mut pending = lock(&tracker.pending);
                let Some(entry) = pending.get_mut(&message_id) else {
                    return;
                };
                entry.attempts += 1;
                if let Some(conn) = &target {
                    entry.connection_id = conn.id;
                }
                target.as_ref().map(|_| entry.envelope.clone())
            };

            if let (Some(conn), Some(envelope)) = (&target, envelope) {
                if let Err(e) = conn.send(envelope).await {
                    warn!(
                        message_id = %message_id,
                        recipient = %recipient,
                        error = %e,
                        "retry send failed"
                    );
                }
            } else {
                debug!(
                    message_id = %message_id,
                    recipient = %recipient,
                    "retry skipped, recipient offline"
                );
            }

            delay *= config.multiplier;
        }
    }

    async fn fail(&self, message_id: &str, recipient: &str) {
        let removed = lock(&self.pending).remove(message_id);
        let Some(entry) = removed else { return };
        warn!(
            message_id = %message_id,
            recipient = %recipient,
            attempts = entry.attempts,
            "delivery retries exhausted"
        );
        {
            let mut store = self.storage.lock().await;
            if let Err(e) = store.mark_message_failed(message_id) {
                let _ = self.events.send(RouterEvent::StorageError {
                    context: "mark_message_failed".to_owned(),
                    error: e.to_string(),
                });
            }
        }
        let _ = self.events.send(RouterEvent::DeliveryFailed {
            message_id: message_id.to_owned(),
            recipient: recipient.to_owned(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionMeta;
    use relay_protocol::{Body, DeliveryInfo, EntityKind, MessagePayload};
    use tokio::sync::mpsc;

    fn deliver_env(id: &str) -> Envelope {
        let mut env = Envelope::new(Body::Deliver {
            payload: MessagePayload {
                kind: "message".to_owned(),
                body: "hi".to_owned(),
                data: None,
                thread: None,
            },
            delivery: DeliveryInfo {
                seq: 1,
                session_id: "s-1".to_owned(),
                original_to: None,
            },
        });
        env.id = id.to_owned();
        env
    }

    fn test_conn(name: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(ConnectionHandle::new(
            name.to_owned(),
            EntityKind::Agent,
            "s-1".to_owned(),
            ConnectionMeta::default(),
            tx,
            Duration::from_millis(100),
        ));
        (conn, rx)
    }

    fn tracker_with(
        config: RetryConfig,
        target: Option<Arc<ConnectionHandle>>,
    ) -> Arc<DeliveryTracker> {
        let storage = Arc::new(tokio::sync::Mutex::new(Storage::open_in_memory().unwrap()));
        let events = crate::events::router_channel();
        let lookup: ConnectionLookup = Arc::new(move |_name| target.clone());
        DeliveryTracker::new(config, lookup, storage, events)
    }

    #[tokio::test]
    async fn ack_clears_pending_and_duplicates_are_ignored() {
        let (conn, _rx) = test_conn("B");
        let tracker = tracker_with(RetryConfig::default(), Some(Arc::clone(&conn)));

        tracker.track(&conn, deliver_env("m1"));
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.ack("m1"));
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.ack("m1"));
        assert!(!tracker.ack("never-sent"));
    }

    #[tokio::test]
    async fn retries_resend_until_acked_then_stop() {
        let (conn, mut rx) = test_conn("B");
        let config = RetryConfig {
            base: Duration::from_millis(10),
            multiplier: 2,
            max_attempts: 5,
            ttl: Duration::from_secs(5),
        };
        let tracker = tracker_with(config, Some(Arc::clone(&conn)));

        tracker.track(&conn, deliver_env("m1"));

        // First retry arrives on the queue.
        let retried = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("retry should arrive")
            .unwrap();
        assert_eq!(retried.id, "m1");

        tracker.ack("m1");
        // No further sends once acked.
        let quiet = tokio::time::timeout(Duration::from_millis(120), rx.recv()).await;
        assert!(quiet.is_err(), "no retry may follow an ack");
    }

    #[tokio::test]
    async fn exhausted_attempts_mark_the_message_failed() {
        let (conn, _rx) = test_conn("B");
        let config = RetryConfig {
            base: Duration::from_millis(5),
            multiplier: 1,
            max_attempts: 2,
            ttl: Duration::from_millis(200),
        };
        let storage = Arc::new(tokio::sync::Mutex::new(Storage::open_in_memory().unwrap()));
        {
            let mut store = storage.lock().await;
            let env = deliver_env("m1");
            let msg = crate::storage::StoredMessage::from_envelope(
                &env.clone().with_from("A").with_to("B"),
            )
            .unwrap();
            store.persist_message(&msg).unwrap();
        }
        let events = crate::events::router_channel();
        let mut event_rx = events.subscribe();
        let lookup: ConnectionLookup = {
            let conn = Arc::clone(&conn);
            Arc::new(move |_| Some(Arc::clone(&conn)))
        };
        let tracker = DeliveryTracker::new(config, lookup, Arc::clone(&storage), events);

        tracker.track(&conn, deliver_env("m1"));

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(RouterEvent::DeliveryFailed { message_id, .. }) = event_rx.recv().await {
                    break message_id;
                }
            }
        })
        .await
        .expect("failure event expected");
        assert_eq!(failed, "m1");
        assert_eq!(tracker.pending_count(), 0);

        let store = storage.lock().await;
        let row = store.get_message("m1").unwrap().unwrap();
        assert_eq!(row.status, "failed");
    }

    #[tokio::test]
    async fn unregister_cancels_without_failing() {
        let (conn, _rx) = test_conn("B");
        let tracker = tracker_with(RetryConfig::default(), Some(Arc::clone(&conn)));
        tracker.track(&conn, deliver_env("m1"));
        tracker.track(&conn, deliver_env("m2"));
        assert_eq!(tracker.pending_count(), 2);

        tracker.cancel_for_connection(conn.id);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn retry_targets_the_replacement_connection() {
        let (old_conn, _old_rx) = test_conn("B");
        let (new_conn, mut new_rx) = test_conn("B");
        let config = RetryConfig {
            base: Duration::from_millis(10),
            multiplier: 2,
            max_attempts: 5,
            ttl: Duration::from_secs(5),
        };
        // Lookup resolves to the replacement, not the tracked original.
        let tracker = tracker_with(config, Some(Arc::clone(&new_conn)));

        tracker.track(&old_conn, deliver_env("m1"));

        let retried = tokio::time::timeout(Duration::from_millis(500), new_rx.recv())
            .await
            .expect("retry should target the new connection")
            .unwrap();
        assert_eq!(retried.id, "m1");
        tracker.ack("m1");
    }
}
