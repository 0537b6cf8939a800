//! Central dispatcher.
//!
//! The router owns every in-memory registry — connections, agents, users,
//! topic subscriptions, channel membership, shadow bindings, processing
//! state, and the spawning set — and dispatches every non-transport
//! envelope.  Registry maps are guarded by fine-grained locks and never held
//! across an await; sends go through each recipient connection's write
//! queue.
//!
//! The delivery tracker resolves connections through a lookup callback
//! created at construction, so the tracker never holds a router pointer.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::delivery::{ConnectionLookup, DeliveryTracker, RetryConfig};
use crate::events::RouterEvent;
use crate::rate_limit::RateLimiter;
use crate::registry::AgentRegistry;
use crate::storage::{Storage, StoredMessage};
use relay_protocol::{
    markers, AckPayload, Body, ChannelMemberPayload, DedupWindow, DeliveryInfo, Envelope,
    EntityKind, MessagePayload, DEFAULT_TOPIC, SYSTEM_SENDER,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config + collaborator traits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Watchdog on the per-agent "is thinking" flag.
    pub processing_timeout: Duration,
    /// Entries in the spawning set older than this are purged.
    pub spawning_timeout: Duration,
    /// Per-connection dedup window size.
    pub dedup_window: usize,
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            processing_timeout: Duration::from_secs(30),
            spawning_timeout: Duration::from_secs(60),
            dedup_window: DedupWindow::DEFAULT_CAPACITY,
            retry: RetryConfig::default(),
        }
    }
}

/// External cross-machine routing collaborator (fire-and-forget).
pub trait CrossMachineHandler: Send + Sync {
    /// True when `envelope.to` resolves to a remote agent and the message
    /// was taken.
    fn try_route(&self, envelope: &Envelope) -> bool;
}

// ---------------------------------------------------------------------------
// Shadow model
// ---------------------------------------------------------------------------

/// Triggers a shadow can be subscribed to via `speakOn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowTrigger {
    ExplicitAsk,
    CodeWritten,
    ReviewRequest,
    SessionEnd,
    AllMessages,
}

impl ShadowTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ShadowTrigger::ExplicitAsk => "EXPLICIT_ASK",
            ShadowTrigger::CodeWritten => "CODE_WRITTEN",
            ShadowTrigger::ReviewRequest => "REVIEW_REQUEST",
            ShadowTrigger::SessionEnd => "SESSION_END",
            ShadowTrigger::AllMessages => "ALL_MESSAGES",
        }
    }
}

/// One shadow bound to a primary agent.
#[derive(Debug, Clone)]
pub struct ShadowBinding {
    pub shadow: String,
    pub speak_on: Vec<ShadowTrigger>,
    pub receive_incoming: bool,
    pub receive_outgoing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShadowDirection {
    Incoming,
    Outgoing,
}

impl ShadowDirection {
    fn as_str(self) -> &'static str {
        match self {
            ShadowDirection::Incoming => "incoming",
            ShadowDirection::Outgoing => "outgoing",
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ProcessingState {
    #[allow(dead_code)] // surfaced in stats / future introspection
    started_at: Instant,
    message_id: String,
    timer: tokio::task::JoinHandle<()>,
}

/// Channel state keyed by the lowercased name; stores the display casing and
/// members in join order (display casing preserved).
struct ChannelState {
    display: String,
    members: Vec<String>,
}

impl ChannelState {
    fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m.eq_ignore_ascii_case(member))
    }

    fn remove(&mut self, member: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| !m.eq_ignore_ascii_case(member));
        self.members.len() != before
    }
}

#[derive(Debug, Default)]
pub struct RouterStats {
    pub dropped: AtomicU64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    config: RouterConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    agents: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    users: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    channels: RwLock<HashMap<String, ChannelState>>,
    member_channels: RwLock<HashMap<String, HashSet<String>>>,
    shadows_by_primary: RwLock<HashMap<String, Vec<ShadowBinding>>>,
    primary_by_shadow: RwLock<HashMap<String, String>>,
    processing: Mutex<HashMap<String, ProcessingState>>,
    spawning: Mutex<HashMap<String, Instant>>,
    dedup: Mutex<HashMap<ConnectionId, DedupWindow>>,
    stats: RouterStats,
    storage: Arc<tokio::sync::Mutex<Storage>>,
    registry: Arc<AgentRegistry>,
    limiter: Arc<RateLimiter>,
    tracker: Arc<DeliveryTracker>,
    events: broadcast::Sender<RouterEvent>,
    cross_machine: Option<Arc<dyn CrossMachineHandler>>,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        storage: Arc<tokio::sync::Mutex<Storage>>,
        registry: Arc<AgentRegistry>,
        limiter: Arc<RateLimiter>,
        events: broadcast::Sender<RouterEvent>,
        cross_machine: Option<Arc<dyn CrossMachineHandler>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Router>| {
            let lookup: ConnectionLookup = {
                let weak = weak.clone();
                Arc::new(move |name: &str| {
                    weak.upgrade().and_then(|router| router.agent_connection(name))
                })
            };
            let tracker =
                DeliveryTracker::new(config.retry, lookup, Arc::clone(&storage), events.clone());
            Router {
                config,
                connections: RwLock::new(HashMap::new()),
                agents: RwLock::new(HashMap::new()),
                users: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                member_channels: RwLock::new(HashMap::new()),
                shadows_by_primary: RwLock::new(HashMap::new()),
                primary_by_shadow: RwLock::new(HashMap::new()),
                processing: Mutex::new(HashMap::new()),
                spawning: Mutex::new(HashMap::new()),
                dedup: Mutex::new(HashMap::new()),
                stats: RouterStats::default(),
                storage,
                registry,
                limiter,
                tracker,
                events,
                cross_machine,
            }
        })
    }

    pub fn events(&self) -> broadcast::Sender<RouterEvent> {
        self.events.clone()
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Current connection for an agent name (used by retry retargeting).
    pub fn agent_connection(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        read(&self.agents).get(name).cloned()
    }

    pub fn user_connection(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        read(&self.users).get(name).cloned()
    }

    pub fn agent_count(&self) -> usize {
        read(&self.agents).len()
    }

    fn any_connection(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        self.agent_connection(name).or_else(|| self.user_connection(name))
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Store a freshly-handshaken connection, replacing any older one with
    /// the same name.  Channel membership and subscriptions persist across
    /// the replacement; the old socket is closed.
    pub async fn register(self: &Arc<Self>, conn: Arc<ConnectionHandle>) {
        let name = conn.name.clone();
        let replaced = {
            let map = match conn.entity {
                EntityKind::Agent => &self.agents,
                EntityKind::User => &self.users,
            };
            write(map).insert(name.clone(), Arc::clone(&conn))
        };
        if let Some(old) = replaced {
            info!(name = %name, old_id = old.id, new_id = conn.id, "replacing connection");
            old.close();
            write(&self.connections).remove(&old.id);
            lock(&self.dedup).remove(&old.id);
            // Pending deliveries stay tracked; retries retarget the new
            // connection through the lookup callback.
        }
        write(&self.connections).insert(conn.id, Arc::clone(&conn));
        lock(&self.dedup).insert(conn.id, DedupWindow::new(self.config.dedup_window));

        if conn.entity == EntityKind::Agent {
            self.clear_spawning(&name);
            self.registry.record_connect(&name, &conn.meta).await;
            let _ = self.events.send(RouterEvent::AgentOnline { name: name.clone() });
        }

        self.rejoin_channels(&conn).await;
        self.replay_pending(&conn).await;
        self.deliver_pending_messages(&conn).await;
    }

    /// Remove a connection, but only if it is still the current one for its
    /// name (a newer connection may already have replaced it).
    pub async fn unregister(self: &Arc<Self>, conn: &Arc<ConnectionHandle>) {
        write(&self.connections).remove(&conn.id);
        lock(&self.dedup).remove(&conn.id);
        self.tracker.cancel_for_connection(conn.id);

        let name = conn.name.clone();
        let still_current = {
            let map = match conn.entity {
                EntityKind::Agent => &self.agents,
                EntityKind::User => &self.users,
            };
            let mut map = write(map);
            let is_current = map.get(&name).is_some_and(|current| current.id == conn.id);
            if is_current {
                map.remove(&name);
            }
            is_current
        };
        if !still_current {
            return;
        }

        for subscribers in write(&self.subscriptions).values_mut() {
            subscribers.remove(&name);
        }
        self.leave_all_channels(&name, false).await;
        self.clear_shadows_for(&name);
        self.clear_processing(&name);
        if conn.entity == EntityKind::Agent {
            let _ = self.events.send(RouterEvent::AgentOffline { name });
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, name: &str, topic: &str) {
        write(&self.subscriptions)
            .entry(topic.to_owned())
            .or_default()
            .insert(name.to_owned());
    }

    pub fn unsubscribe(&self, name: &str, topic: &str) {
        let mut subs = write(&self.subscriptions);
        if let Some(set) = subs.get_mut(topic) {
            set.remove(name);
            if set.is_empty() {
                subs.remove(topic);
            }
        }
    }

    // -----------------------------------------------------------------------
    // SEND routing
    // -----------------------------------------------------------------------

    /// Main SEND dispatcher for socket senders.
    pub async fn route(self: &Arc<Self>, sender: &Arc<ConnectionHandle>, envelope: Envelope) {
        if sender.name.is_empty() {
            warn!(id = %envelope.id, "send without a sender name dropped");
            self.drop_message(&envelope.id, "no sender name");
            return;
        }
        let name = sender.name.clone();
        self.route_message(&name, envelope).await;
    }

    /// SEND routing on behalf of a named sender.  Also used by the relay
    /// file bridge, whose senders have no socket connection.
    pub async fn route_message(self: &Arc<Self>, sender_name: &str, mut envelope: Envelope) {
        let Body::Send { payload } = envelope.body.clone() else {
            return;
        };
        envelope.from = Some(sender_name.to_owned());
        if !self.limiter.try_acquire(sender_name) {
            debug!(sender = %sender_name, id = %envelope.id, "rate limited");
            return;
        }
        self.clear_processing(sender_name);
        self.registry.bump_counters(sender_name, 1, 0).await;

        let to = envelope.to.clone();
        let topic = envelope.topic.clone();

        match to.as_deref() {
            Some("*") => {
                let recipients = self.broadcast_recipients(topic.as_deref(), sender_name);
                for recipient in &recipients {
                    let deliver = self.make_deliver(
                        recipient,
                        sender_name,
                        topic.as_deref(),
                        payload.clone(),
                        Some("*"),
                    );
                    self.deliver(recipient, deliver, recipient.entity == EntityKind::Agent, true)
                        .await;
                }
                let recipient_names: Vec<String> =
                    recipients.iter().map(|c| c.name.clone()).collect();
                self.fan_out_shadows(sender_name, &recipient_names, topic.as_deref(), &payload)
                    .await;
            }
            Some(name) => {
                if let Some(recipient) = self.any_connection(name) {
                    let deliver = self.make_deliver(
                        &recipient,
                        sender_name,
                        topic.as_deref(),
                        payload.clone(),
                        None,
                    );
                    self.deliver(&recipient, deliver, recipient.entity == EntityKind::Agent, true)
                        .await;
                    let recipients = [recipient.name.clone()];
                    self.fan_out_shadows(sender_name, &recipients, topic.as_deref(), &payload)
                        .await;
                } else if self
                    .cross_machine
                    .as_ref()
                    .is_some_and(|handler| handler.try_route(&envelope))
                {
                    // Fire-and-forget at this layer.
                    self.persist_marked(&envelope, &payload, name, markers::CROSS_MACHINE)
                        .await;
                    let recipients = [name.to_owned()];
                    self.fan_out_shadows(sender_name, &recipients, topic.as_deref(), &payload)
                        .await;
                } else if self.registry.is_known(name).await || self.is_spawning(name) {
                    debug!(recipient = %name, id = %envelope.id, "offline queued");
                    self.persist_marked(&envelope, &payload, name, markers::OFFLINE_QUEUED)
                        .await;
                    let recipients = [name.to_owned()];
                    self.fan_out_shadows(sender_name, &recipients, topic.as_deref(), &payload)
                        .await;
                } else {
                    warn!(recipient = %name, id = %envelope.id, "unknown recipient, message lost");
                    self.drop_message(&envelope.id, "unknown recipient");
                }
            }
            None => {
                warn!(id = %envelope.id, "send without recipient dropped");
                self.drop_message(&envelope.id, "no recipient");
            }
        }
    }

    fn broadcast_recipients(
        &self,
        topic: Option<&str>,
        sender_name: &str,
    ) -> Vec<Arc<ConnectionHandle>> {
        let names: Vec<String> = match topic {
            Some(topic) => read(&self.subscriptions)
                .get(topic)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            None => {
                let mut names: Vec<String> = read(&self.agents).keys().cloned().collect();
                names.extend(read(&self.users).keys().cloned());
                names
            }
        };
        names
            .into_iter()
            .filter(|name| name != sender_name)
            .filter_map(|name| self.any_connection(&name))
            .collect()
    }

    /// Construct a DELIVER for `recipient` per the delivery contract: fresh
    /// id, seq from the recipient's (topic, sender) counter, the recipient's
    /// session id, and `originalTo` only when it differs from `to`.
    fn make_deliver(
        &self,
        recipient: &ConnectionHandle,
        from: &str,
        topic: Option<&str>,
        payload: MessagePayload,
        original_to: Option<&str>,
    ) -> Envelope {
        let seq = recipient.next_seq(topic.unwrap_or(DEFAULT_TOPIC), from);
        let delivery = DeliveryInfo {
            seq,
            session_id: recipient.session_id.clone(),
            original_to: original_to
                .filter(|orig| !orig.eq_ignore_ascii_case(&recipient.name))
                .map(str::to_owned),
        };
        let mut envelope = Envelope::new(Body::Deliver { payload, delivery })
            .with_from(from)
            .with_to(recipient.name.clone());
        if let Some(topic) = topic {
            envelope = envelope.with_topic(topic);
        }
        envelope
    }

    /// Send a DELIVER; on success persist it, track it for ACK, and set
    /// processing state when asked.
    async fn deliver(
        self: &Arc<Self>,
        recipient: &Arc<ConnectionHandle>,
        envelope: Envelope,
        set_processing: bool,
        track: bool,
    ) -> bool {
        if let Err(e) = recipient.send(envelope.clone()).await {
            warn!(recipient = %recipient.name, id = %envelope.id, error = %e, "deliver failed");
            recipient.close();
            return false;
        }
        self.persist_envelope(&envelope, false).await;
        if track {
            self.tracker.track(recipient, envelope.clone());
        }
        if set_processing {
            self.set_processing(&recipient.name, &envelope.id);
        }
        self.registry.bump_counters(&recipient.name, 0, 1).await;
        true
    }

    /// Persist a SEND that could not be delivered directly, with the given
    /// marker set in its payload data (`_offlineQueued` / `_crossMachine`).
    async fn persist_marked(
        &self,
        envelope: &Envelope,
        payload: &MessagePayload,
        recipient: &str,
        marker: &str,
    ) {
        let mut payload = payload.clone();
        payload.data = Some(merge_data(
            payload.data.take(),
            &[(marker, Value::Bool(true))],
        ));
        let mut marked = envelope.clone();
        marked.to = Some(recipient.to_owned());
        marked.body = Body::Send { payload };
        self.persist_envelope(&marked, false).await;
    }

    async fn persist_envelope(&self, envelope: &Envelope, is_broadcast: bool) {
        let Some(mut message) = StoredMessage::from_envelope(envelope) else {
            return;
        };
        message.is_broadcast = is_broadcast;
        let mut store = self.storage.lock().await;
        if let Err(e) = store.persist_message(&message) {
            warn!(id = %envelope.id, error = %e, "message persist failed");
            let _ = self.events.send(RouterEvent::StorageError {
                context: "persist_message".to_owned(),
                error: e.to_string(),
            });
        }
    }

    fn drop_message(&self, message_id: &str, reason: &str) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(RouterEvent::MessageDropped {
            message_id: message_id.to_owned(),
            reason: reason.to_owned(),
        });
    }

    // -----------------------------------------------------------------------
    // ACK + dedup
    // -----------------------------------------------------------------------

    /// Settle an ACK from a recipient.  Duplicates and unknown ids are
    /// ignored.
    pub async fn handle_ack(&self, _conn: &Arc<ConnectionHandle>, ack: &AckPayload) {
        if self.tracker.ack(&ack.ack_id) {
            let mut store = self.storage.lock().await;
            if let Err(e) = store.mark_message_delivered(&ack.ack_id) {
                let _ = self.events.send(RouterEvent::StorageError {
                    context: "mark_message_delivered".to_owned(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Record an inbound envelope id; false means it is a duplicate within
    /// the dedup window and must produce no effect.
    pub fn observe_inbound(&self, conn_id: ConnectionId, envelope_id: &str) -> bool {
        lock(&self.dedup)
            .entry(conn_id)
            .or_insert_with(|| DedupWindow::new(self.config.dedup_window))
            .observe(envelope_id)
    }

    // -----------------------------------------------------------------------
    // Shadows
    // -----------------------------------------------------------------------

    /// Bind `shadow` to `primary`, replacing any existing binding for the
    /// same shadow name.
    pub fn bind_shadow(&self, primary: &str, binding: ShadowBinding) {
        let shadow = binding.shadow.clone();
        let mut by_primary = write(&self.shadows_by_primary);
        let list = by_primary.entry(primary.to_owned()).or_default();
        list.retain(|b| b.shadow != shadow);
        list.push(binding);
        write(&self.primary_by_shadow).insert(shadow, primary.to_owned());
    }

    pub fn unbind_shadow(&self, primary: &str, shadow: &str) {
        let mut by_primary = write(&self.shadows_by_primary);
        if let Some(list) = by_primary.get_mut(primary) {
            list.retain(|b| b.shadow != shadow);
            if list.is_empty() {
                by_primary.remove(primary);
            }
        }
        write(&self.primary_by_shadow).remove(shadow);
    }

    fn clear_shadows_for(&self, name: &str) {
        // As primary: drop the whole list and the reverse entries.
        if let Some(list) = write(&self.shadows_by_primary).remove(name) {
            let mut reverse = write(&self.primary_by_shadow);
            for binding in list {
                reverse.remove(&binding.shadow);
            }
        }
        // As shadow: remove from the bound primary's list.
        if let Some(primary) = write(&self.primary_by_shadow).remove(name) {
            let mut by_primary = write(&self.shadows_by_primary);
            if let Some(list) = by_primary.get_mut(&primary) {
                list.retain(|b| b.shadow != name);
                if list.is_empty() {
                    by_primary.remove(&primary);
                }
            }
        }
    }

    fn shadow_bindings(&self, primary: &str) -> Vec<ShadowBinding> {
        read(&self.shadows_by_primary)
            .get(primary)
            .cloned()
            .unwrap_or_default()
    }

    /// Shadow copies for one routed message: outgoing copies for the
    /// sender's shadows, incoming copies for each recipient's shadows.
    /// Copies are tracked for ACK but never set processing state.
    async fn fan_out_shadows(
        self: &Arc<Self>,
        sender: &str,
        recipients: &[String],
        topic: Option<&str>,
        payload: &MessagePayload,
    ) {
        for binding in self.shadow_bindings(sender) {
            if binding.receive_outgoing {
                self.send_shadow_copy(&binding.shadow, sender, sender, ShadowDirection::Outgoing, topic, payload)
                    .await;
            }
        }
        for recipient in recipients {
            for binding in self.shadow_bindings(recipient) {
                if binding.receive_incoming {
                    self.send_shadow_copy(&binding.shadow, recipient, sender, ShadowDirection::Incoming, topic, payload)
                        .await;
                }
            }
        }
    }

    async fn send_shadow_copy(
        self: &Arc<Self>,
        shadow: &str,
        primary: &str,
        from: &str,
        direction: ShadowDirection,
        topic: Option<&str>,
        payload: &MessagePayload,
    ) {
        // A shadow never receives a copy of its own traffic.
        if shadow.eq_ignore_ascii_case(from) {
            return;
        }
        let Some(conn) = self.any_connection(shadow) else {
            return;
        };
        let mut payload = payload.clone();
        payload.data = Some(merge_data(
            payload.data.take(),
            &[
                (markers::SHADOW_COPY, Value::Bool(true)),
                (markers::SHADOW_OF, Value::String(primary.to_owned())),
                (
                    markers::SHADOW_DIRECTION,
                    Value::String(direction.as_str().to_owned()),
                ),
            ],
        ));
        let deliver = self.make_deliver(&conn, from, topic, payload, Some(primary));
        self.deliver(&conn, deliver, false, true).await;
    }

    /// Fire a trigger to the shadows of `primary` whose `speakOn` includes
    /// it (or ALL_MESSAGES).  Triggered shadows are expected to respond, so
    /// these deliveries DO set processing state.
    pub async fn emit_shadow_trigger(
        self: &Arc<Self>,
        primary: &str,
        trigger: ShadowTrigger,
        ctx: Value,
    ) {
        for binding in self.shadow_bindings(primary) {
            let fires = binding
                .speak_on
                .iter()
                .any(|t| *t == trigger || *t == ShadowTrigger::AllMessages);
            if !fires {
                continue;
            }
            let Some(conn) = self.any_connection(&binding.shadow) else {
                continue;
            };
            let data = merge_data(
                Some(ctx.clone()),
                &[(
                    markers::SHADOW_TRIGGER,
                    Value::String(trigger.as_str().to_owned()),
                )],
            );
            let payload = MessagePayload {
                kind: "system".to_owned(),
                body: format!("SHADOW_TRIGGER:{}", trigger.as_str()),
                data: Some(data),
                thread: None,
            };
            let deliver = self.make_deliver(&conn, primary, None, payload, None);
            self.deliver(&conn, deliver, conn.entity == EntityKind::Agent, true)
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Join a channel (creating it if absent), persist membership through
    /// both paths, and notify current members unless the join was performed
    /// in admin mode.
    pub async fn handle_channel_join(
        self: &Arc<Self>,
        conn: &Arc<ConnectionHandle>,
        payload: &ChannelMemberPayload,
    ) {
        let member = payload.member.clone().unwrap_or_else(|| conn.name.clone());
        let admin_mode = !member.eq_ignore_ascii_case(&conn.name);
        let channel = payload.channel.clone();

        let (added, notify) = {
            let mut channels = write(&self.channels);
            let state = channels
                .entry(channel.to_ascii_lowercase())
                .or_insert_with(|| ChannelState {
                    display: channel.clone(),
                    members: Vec::new(),
                });
            if state.contains(&member) {
                (false, Vec::new())
            } else {
                let notify: Vec<String> = state.members.clone();
                state.members.push(member.clone());
                (true, notify)
            }
        };
        if !added {
            return;
        }
        write(&self.member_channels)
            .entry(member.to_ascii_lowercase())
            .or_default()
            .insert(channel.to_ascii_lowercase());

        {
            let mut store = self.storage.lock().await;
            if let Err(e) = store.channel_join(&channel, &member) {
                warn!(channel = %channel, member = %member, error = %e, "membership persist failed");
                let _ = self.events.send(RouterEvent::StorageError {
                    context: "channel_join".to_owned(),
                    error: e.to_string(),
                });
            }
        }

        if !admin_mode {
            self.notify_members(&channel, &notify, format!("{member} joined {channel}"))
                .await;
        }
    }

    /// Leave a channel; empty channels are deleted.  Notifies remaining
    /// members unless admin mode.
    pub async fn handle_channel_leave(
        self: &Arc<Self>,
        conn: &Arc<ConnectionHandle>,
        payload: &ChannelMemberPayload,
    ) {
        let member = payload.member.clone().unwrap_or_else(|| conn.name.clone());
        let admin_mode = !member.eq_ignore_ascii_case(&conn.name);
        self.remove_member(&payload.channel, &member, admin_mode, true).await;
    }

    /// Channel fan-out: sender must be a current member; every other member
    /// receives the message; no echo to the sender.
    pub async fn handle_channel_message(
        self: &Arc<Self>,
        conn: &Arc<ConnectionHandle>,
        envelope: &Envelope,
    ) {
        let Body::ChannelMessage { payload } = &envelope.body else {
            return;
        };
        let sender = conn.name.clone();
        let (display, members) = {
            let channels = read(&self.channels);
            match channels.get(&payload.channel.to_ascii_lowercase()) {
                Some(state) if state.contains(&sender) => {
                    (state.display.clone(), state.members.clone())
                }
                Some(_) => {
                    warn!(channel = %payload.channel, sender = %sender, "channel message from non-member dropped");
                    self.drop_message(&envelope.id, "not a channel member");
                    return;
                }
                None => {
                    warn!(channel = %payload.channel, "message to unknown channel dropped");
                    self.drop_message(&envelope.id, "unknown channel");
                    return;
                }
            }
        };

        self.clear_processing(&sender);
        let forwarded = Envelope {
            from: Some(sender.clone()),
            to: Some(display.clone()),
            ..envelope.clone()
        };
        for member in &members {
            if member.eq_ignore_ascii_case(&sender) {
                continue;
            }
            if let Some(member_conn) = self.any_connection(member) {
                if let Err(e) = member_conn.send(forwarded.clone()).await {
                    warn!(member = %member, error = %e, "channel fan-out send failed");
                }
            }
        }

        // One stored row for the whole fan-out, addressed to the channel.
        let message = StoredMessage {
            id: envelope.id.clone(),
            sender: Some(sender),
            recipient: Some(display),
            topic: None,
            kind: "channel".to_owned(),
            body: payload.body.clone(),
            data: Some(serde_json::json!({ markers::IS_CHANNEL_MESSAGE: true })),
            thread: payload.thread.clone(),
            ts: envelope.ts,
            status: "delivered".to_owned(),
            delivery_session_id: None,
            delivery_seq: None,
            offline_queued: false,
            cross_machine: false,
            is_channel_message: true,
            shadow_copy: false,
            is_broadcast: true,
        };
        let mut store = self.storage.lock().await;
        if let Err(e) = store.persist_message(&message) {
            let _ = self.events.send(RouterEvent::StorageError {
                context: "persist_channel_message".to_owned(),
                error: e.to_string(),
            });
        }
    }

    /// Members of a channel in join order, display casing.
    pub fn channel_members(&self, channel: &str) -> Vec<String> {
        read(&self.channels)
            .get(&channel.to_ascii_lowercase())
            .map(|state| state.members.clone())
            .unwrap_or_default()
    }

    async fn remove_member(
        self: &Arc<Self>,
        channel: &str,
        member: &str,
        admin_mode: bool,
        persist: bool,
    ) {
        let key = channel.to_ascii_lowercase();
        let (removed, display, remaining) = {
            let mut channels = write(&self.channels);
            match channels.get_mut(&key) {
                Some(state) => {
                    let removed = state.remove(member);
                    let display = state.display.clone();
                    let remaining = state.members.clone();
                    if state.members.is_empty() {
                        channels.remove(&key);
                    }
                    (removed, display, remaining)
                }
                None => return,
            }
        };
        if !removed {
            return;
        }
        {
            let mut member_channels = write(&self.member_channels);
            if let Some(set) = member_channels.get_mut(&member.to_ascii_lowercase()) {
                set.remove(&key);
                if set.is_empty() {
                    member_channels.remove(&member.to_ascii_lowercase());
                }
            }
        }
        if persist {
            let mut store = self.storage.lock().await;
            if let Err(e) = store.channel_leave(channel, member) {
                let _ = self.events.send(RouterEvent::StorageError {
                    context: "channel_leave".to_owned(),
                    error: e.to_string(),
                });
            }
        }
        if !admin_mode {
            self.notify_members(&display, &remaining, format!("{member} left {display}"))
                .await;
        }
    }

    /// Disconnect cleanup: drop `name` from every in-memory channel, with
    /// leave notifications.  Persisted membership is untouched so the agent
    /// silently rejoins on reconnect.
    async fn leave_all_channels(self: &Arc<Self>, name: &str, admin_mode: bool) {
        let channels: Vec<String> = read(&self.member_channels)
            .get(&name.to_ascii_lowercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for channel in channels {
            self.remove_member(&channel, name, admin_mode, false).await;
        }
    }

    /// Silently restore persisted channel membership on reconnect.
    async fn rejoin_channels(&self, conn: &Arc<ConnectionHandle>) {
        let channels = {
            let store = self.storage.lock().await;
            match store.channels_for_member(&conn.name) {
                Ok(channels) => channels,
                Err(e) => {
                    warn!(member = %conn.name, error = %e, "channel rejoin query failed");
                    return;
                }
            }
        };
        for channel in channels {
            let key = channel.to_ascii_lowercase();
            {
                let mut map = write(&self.channels);
                let state = map.entry(key.clone()).or_insert_with(|| ChannelState {
                    display: channel.clone(),
                    members: Vec::new(),
                });
                if !state.contains(&conn.name) {
                    state.members.push(conn.name.clone());
                }
            }
            write(&self.member_channels)
                .entry(conn.name.to_ascii_lowercase())
                .or_default()
                .insert(key);
        }
    }

    async fn notify_members(self: &Arc<Self>, channel: &str, members: &[String], body: String) {
        let payload = MessagePayload {
            kind: "system".to_owned(),
            body,
            data: None,
            thread: None,
        };
        for member in members {
            if let Some(conn) = self.any_connection(member) {
                let deliver =
                    self.make_deliver(&conn, SYSTEM_SENDER, None, payload.clone(), Some(channel));
                if let Err(e) = conn.send(deliver).await {
                    debug!(member = %member, error = %e, "channel notification failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // System broadcast
    // -----------------------------------------------------------------------

    /// Fan a system message out to every connection.  Never counts against
    /// rate limits and never sets processing state.
    pub async fn broadcast_system_message(self: &Arc<Self>, body: &str, data: Option<Value>) {
        let payload = MessagePayload {
            kind: "system".to_owned(),
            body: body.to_owned(),
            data,
            thread: None,
        };
        let recipients = self.broadcast_recipients(None, SYSTEM_SENDER);
        for recipient in recipients {
            let deliver =
                self.make_deliver(&recipient, SYSTEM_SENDER, None, payload.clone(), Some("*"));
            if let Err(e) = recipient.send(deliver).await {
                debug!(recipient = %recipient.name, error = %e, "system broadcast send failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Session resume: re-send persisted unacked deliveries whose stored
    /// session id matches the reconnecting session, in stored seq order,
    /// and re-track them.
    pub async fn replay_pending(self: &Arc<Self>, conn: &Arc<ConnectionHandle>) {
        let unacked = {
            let store = self.storage.lock().await;
            match store.unacked_for_session(&conn.name, &conn.session_id) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(name = %conn.name, error = %e, "session resume query failed");
                    return;
                }
            }
        };
        if unacked.is_empty() {
            return;
        }
        info!(name = %conn.name, count = unacked.len(), "resuming session, replaying unacked");
        for message in unacked {
            let envelope = rebuild_deliver(&message, &conn.session_id);
            if let Err(e) = conn.send(envelope.clone()).await {
                warn!(id = %envelope.id, error = %e, "session replay send failed");
                return;
            }
            self.tracker.track(conn, envelope);
        }
    }

    /// Deliver messages queued while the recipient was offline, oldest
    /// first, and mark them delivered.
    pub async fn deliver_pending_messages(self: &Arc<Self>, conn: &Arc<ConnectionHandle>) {
        let queued = {
            let store = self.storage.lock().await;
            match store.offline_queued_for(&conn.name) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(name = %conn.name, error = %e, "offline queue query failed");
                    return;
                }
            }
        };
        for message in queued {
            let from = message.sender.clone().unwrap_or_else(|| SYSTEM_SENDER.to_owned());
            let payload = MessagePayload {
                kind: message.kind.clone(),
                body: message.body.clone(),
                data: message.data.clone(),
                thread: message.thread.clone(),
            };
            let seq = conn.next_seq(message.topic.as_deref().unwrap_or(DEFAULT_TOPIC), &from);
            let mut envelope = Envelope::new(Body::Deliver {
                payload,
                delivery: DeliveryInfo {
                    seq,
                    session_id: conn.session_id.clone(),
                    original_to: None,
                },
            })
            .with_from(from)
            .with_to(conn.name.clone());
            envelope.id = message.id.clone();
            if let Some(topic) = &message.topic {
                envelope = envelope.with_topic(topic.clone());
            }

            if let Err(e) = conn.send(envelope).await {
                warn!(id = %message.id, error = %e, "offline delivery send failed");
                return;
            }
            if conn.entity == EntityKind::Agent {
                self.set_processing(&conn.name, &message.id);
            }
            let mut store = self.storage.lock().await;
            if let Err(e) = store.mark_message_delivered(&message.id) {
                let _ = self.events.send(RouterEvent::StorageError {
                    context: "offline_mark_delivered".to_owned(),
                    error: e.to_string(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Processing state
    // -----------------------------------------------------------------------

    /// Mark an agent as processing a delivered message, with the watchdog
    /// armed.  The state clears on the agent's next send, an explicit clear,
    /// or the timeout.
    pub fn set_processing(self: &Arc<Self>, name: &str, message_id: &str) {
        let timer = {
            let router = Arc::clone(self);
            let name = name.to_owned();
            let message_id = message_id.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(router.config.processing_timeout).await;
                router.clear_processing_if(&name, &message_id);
            })
        };
        let mut processing = lock(&self.processing);
        if let Some(old) = processing.insert(
            name.to_owned(),
            ProcessingState {
                started_at: Instant::now(),
                message_id: message_id.to_owned(),
                timer,
            },
        ) {
            old.timer.abort();
        }
        drop(processing);
        let _ = self.events.send(RouterEvent::ProcessingChanged {
            name: name.to_owned(),
            processing: true,
            message_id: Some(message_id.to_owned()),
        });
    }

    pub fn clear_processing(&self, name: &str) {
        let removed = lock(&self.processing).remove(name);
        if let Some(state) = removed {
            state.timer.abort();
            let _ = self.events.send(RouterEvent::ProcessingChanged {
                name: name.to_owned(),
                processing: false,
                message_id: Some(state.message_id),
            });
        }
    }

    /// Timeout path: clear only if the state still belongs to `message_id`.
    fn clear_processing_if(&self, name: &str, message_id: &str) {
        let mut processing = lock(&self.processing);
        let matches = processing
            .get(name)
            .is_some_and(|state| state.message_id == message_id);
        if matches {
            processing.remove(name);
            drop(processing);
            debug!(name = %name, "processing state timed out");
            let _ = self.events.send(RouterEvent::ProcessingChanged {
                name: name.to_owned(),
                processing: false,
                message_id: Some(message_id.to_owned()),
            });
        }
    }

    pub fn is_processing(&self, name: &str) -> bool {
        lock(&self.processing).contains_key(name)
    }

    // -----------------------------------------------------------------------
    // Spawning set
    // -----------------------------------------------------------------------

    /// Queue messages for `name` while its child process starts up.
    pub fn mark_spawning(&self, name: &str) {
        lock(&self.spawning).insert(name.to_owned(), Instant::now());
    }

    pub fn clear_spawning(&self, name: &str) {
        lock(&self.spawning).remove(name);
    }

    pub fn is_spawning(&self, name: &str) -> bool {
        let mut spawning = lock(&self.spawning);
        let timeout = self.config.spawning_timeout;
        spawning.retain(|_, started| started.elapsed() < timeout);
        spawning.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Merge marker entries into payload data, treating non-object data as a
/// wrapped `value`.
fn merge_data(data: Option<Value>, entries: &[(&str, Value)]) -> Value {
    let mut map = match data {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_owned(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    for (key, value) in entries {
        map.insert((*key).to_owned(), value.clone());
    }
    Value::Object(map)
}

/// Rebuild a DELIVER from its stored row for session-resume replay.
fn rebuild_deliver(message: &StoredMessage, session_id: &str) -> Envelope {
    let payload = MessagePayload {
        kind: message.kind.clone(),
        body: message.body.clone(),
        data: message.data.clone(),
        thread: message.thread.clone(),
    };
    let mut envelope = Envelope::new(Body::Deliver {
        payload,
        delivery: DeliveryInfo {
            seq: message.delivery_seq.unwrap_or(0),
            session_id: session_id.to_owned(),
            original_to: None,
        },
    });
    envelope.id = message.id.clone();
    envelope.ts = message.ts;
    envelope.from = message.sender.clone();
    envelope.to = message.recipient.clone();
    envelope.topic = message.topic.clone();
    envelope
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_data_adds_markers_to_objects() {
        let merged = merge_data(
            Some(serde_json::json!({"file": "a.rs"})),
            &[(markers::SHADOW_COPY, Value::Bool(true))],
        );
        assert_eq!(merged["file"], "a.rs");
        assert_eq!(merged[markers::SHADOW_COPY], true);
    }

    #[test]
    fn merge_data_wraps_non_object_payloads() {
        let merged = merge_data(
            Some(Value::String("raw".to_owned())),
            &[(markers::OFFLINE_QUEUED, Value::Bool(true))],
        );
        assert_eq!(merged["value"], "raw");
        assert_eq!(merged[markers::OFFLINE_QUEUED], true);
    }

    #[test]
    fn channel_state_matching_is_case_insensitive() {
        let mut state = ChannelState {
            display: "#General".to_owned(),
            members: vec!["Lead".to_owned()],
        };
        assert!(state.contains("lead"));
        assert!(state.contains("LEAD"));
        assert!(state.remove("lEaD"));
        assert!(state.members.is_empty());
    }

    #[test]
    fn shadow_trigger_names_match_wire_form() {
        assert_eq!(ShadowTrigger::CodeWritten.as_str(), "CODE_WRITTEN");
        assert_eq!(ShadowTrigger::AllMessages.as_str(), "ALL_MESSAGES");
    }
}
