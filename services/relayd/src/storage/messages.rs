//! Message store, agent registry rows, and channel membership.
//!
//! Every routed message is persisted here; the rows back the offline queue
//! (`offline_queued_for`), session resume (`unacked_for_session`), and
//! delivery-failure marking.  Channel membership uses an authoritative
//! table plus an advisory append-only log; readers only consult the
//! authoritative table.

use super::{now_utc, Storage, StorageResult};
use relay_protocol::{markers, Envelope};
use rusqlite::{params, OptionalExtension};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A persisted message row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub topic: Option<String>,
    pub kind: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
    pub thread: Option<String>,
    pub ts: u64,
    pub status: String,
    pub delivery_session_id: Option<String>,
    pub delivery_seq: Option<u64>,
    pub offline_queued: bool,
    pub cross_machine: bool,
    pub is_channel_message: bool,
    pub shadow_copy: bool,
    pub is_broadcast: bool,
}

impl StoredMessage {
    /// Extract the persistable fields from an envelope.
    ///
    /// Works for SEND, DELIVER, and CHANNEL_MESSAGE envelopes; other kinds
    /// are not persisted.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        use relay_protocol::Body;
        let (kind, body, data, thread, delivery) = match &envelope.body {
            Body::Send { payload } => (
                payload.kind.clone(),
                payload.body.clone(),
                payload.data.clone(),
                payload.thread.clone(),
                None,
            ),
            Body::Deliver { payload, delivery } => (
                payload.kind.clone(),
                payload.body.clone(),
                payload.data.clone(),
                payload.thread.clone(),
                Some(delivery.clone()),
            ),
            Body::ChannelMessage { payload } => (
                "channel".to_owned(),
                payload.body.clone(),
                None,
                payload.thread.clone(),
                None,
            ),
            _ => return None,
        };

        let marker = |key: &str| {
            data.as_ref()
                .and_then(|d| d.get(key))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        };

        Some(StoredMessage {
            id: envelope.id.clone(),
            sender: envelope.from.clone(),
            recipient: envelope.to.clone(),
            topic: envelope.topic.clone(),
            kind,
            body,
            thread,
            ts: envelope.ts,
            status: "sent".to_owned(),
            delivery_session_id: delivery.as_ref().map(|d| d.session_id.clone()),
            delivery_seq: delivery.as_ref().map(|d| d.seq),
            offline_queued: marker(markers::OFFLINE_QUEUED),
            cross_machine: marker(markers::CROSS_MACHINE),
            is_channel_message: marker(markers::IS_CHANNEL_MESSAGE),
            shadow_copy: marker(markers::SHADOW_COPY),
            is_broadcast: false,
            data,
        })
    }
}

/// One authoritative channel membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMembership {
    pub channel: String,
    pub member: String,
}

// ---------------------------------------------------------------------------
// Message store operations
// ---------------------------------------------------------------------------

impl Storage {
    /// Insert one message row; replaces an existing row with the same id
    /// (a retried persist after a partial failure).
    pub fn persist_message(&mut self, msg: &StoredMessage) -> StorageResult<()> {
        let data = msg
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| super::StorageError::InvalidData(e.to_string()))?;
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
                 (id, sender, recipient, topic, kind, body, data, thread, ts,
                  status, delivery_session_id, delivery_seq,
                  offline_queued, cross_machine, is_channel_message,
                  shadow_copy, is_broadcast)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                     ?13, ?14, ?15, ?16, ?17)",
            params![
                msg.id,
                msg.sender,
                msg.recipient,
                msg.topic,
                msg.kind,
                msg.body,
                data,
                msg.thread,
                msg.ts as i64,
                msg.status,
                msg.delivery_session_id,
                msg.delivery_seq.map(|s| s as i64),
                msg.offline_queued,
                msg.cross_machine,
                msg.is_channel_message,
                msg.shadow_copy,
                msg.is_broadcast,
            ],
        )?;
        Ok(())
    }

    pub fn mark_message_delivered(&mut self, id: &str) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE messages SET status = 'delivered', offline_queued = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn mark_message_failed(&mut self, id: &str) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE messages SET status = 'failed' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Offline-queued messages for `recipient`, oldest first.
    pub fn offline_queued_for(&self, recipient: &str) -> StorageResult<Vec<StoredMessage>> {
        self.query_messages(
            "SELECT * FROM messages
             WHERE recipient = ?1 AND offline_queued = 1 AND status = 'sent'
             ORDER BY ts ASC",
            params![recipient],
        )
    }

    /// Unacked deliveries for a resumed (recipient, session), in stored
    /// delivery seq order.
    pub fn unacked_for_session(
        &self,
        recipient: &str,
        session_id: &str,
    ) -> StorageResult<Vec<StoredMessage>> {
        self.query_messages(
            "SELECT * FROM messages
             WHERE recipient = ?1 AND delivery_session_id = ?2 AND status = 'sent'
             ORDER BY delivery_seq ASC",
            params![recipient, session_id],
        )
    }

    pub fn get_message(&self, id: &str) -> StorageResult<Option<StoredMessage>> {
        let mut found = self.query_messages("SELECT * FROM messages WHERE id = ?1", params![id])?;
        Ok(found.pop())
    }

    fn query_messages<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> StorageResult<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>("id")?,
                row.get::<_, Option<String>>("sender")?,
                row.get::<_, Option<String>>("recipient")?,
                row.get::<_, Option<String>>("topic")?,
                row.get::<_, String>("kind")?,
                row.get::<_, String>("body")?,
                row.get::<_, Option<String>>("data")?,
                row.get::<_, Option<String>>("thread")?,
                row.get::<_, i64>("ts")?,
                row.get::<_, String>("status")?,
                row.get::<_, Option<String>>("delivery_session_id")?,
                row.get::<_, Option<i64>>("delivery_seq")?,
                row.get::<_, bool>("offline_queued")?,
                row.get::<_, bool>("cross_machine")?,
                row.get::<_, bool>("is_channel_message")?,
                row.get::<_, bool>("shadow_copy")?,
                row.get::<_, bool>("is_broadcast")?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let raw = r?;
            let data = match raw.6 {
                Some(text) => Some(
                    serde_json::from_str(&text)
                        .map_err(|e| super::StorageError::InvalidData(e.to_string()))?,
                ),
                None => None,
            };
            out.push(StoredMessage {
                id: raw.0,
                sender: raw.1,
                recipient: raw.2,
                topic: raw.3,
                kind: raw.4,
                body: raw.5,
                data,
                thread: raw.7,
                ts: raw.8 as u64,
                status: raw.9,
                delivery_session_id: raw.10,
                delivery_seq: raw.11.map(|s| s as u64),
                offline_queued: raw.12,
                cross_machine: raw.13,
                is_channel_message: raw.14,
                shadow_copy: raw.15,
                is_broadcast: raw.16,
            });
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Agent registry rows
    // -----------------------------------------------------------------------

    /// Record an agent connecting; creates or refreshes the registry row.
    pub fn upsert_agent(
        &mut self,
        name: &str,
        cli: Option<&str>,
        program: Option<&str>,
        model: Option<&str>,
        task: Option<&str>,
        cwd: Option<&str>,
    ) -> StorageResult<()> {
        let now = now_utc();
        self.conn().execute(
            "INSERT INTO agents (name, cli, program, model, task, cwd, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(name) DO UPDATE SET
                 cli = excluded.cli, program = excluded.program,
                 model = excluded.model, task = excluded.task,
                 cwd = excluded.cwd, last_seen = excluded.last_seen",
            params![name, cli, program, model, task, cwd, now],
        )?;
        Ok(())
    }

    pub fn bump_agent_counters(
        &mut self,
        name: &str,
        sent: u64,
        received: u64,
    ) -> StorageResult<()> {
        self.conn().execute(
            "UPDATE agents
             SET messages_sent = messages_sent + ?2,
                 messages_received = messages_received + ?3,
                 last_seen = ?4
             WHERE name = ?1",
            params![name, sent as i64, received as i64, now_utc()],
        )?;
        Ok(())
    }

    pub fn known_agent(&self, name: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM agents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn load_agent_names(&self) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn().prepare("SELECT name FROM agents ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Channel membership
    // -----------------------------------------------------------------------

    /// Persist a join through both paths in one transaction: the
    /// authoritative table (canonical) and the append log (advisory).
    pub fn channel_join(&mut self, channel: &str, member: &str) -> StorageResult<()> {
        let now = now_utc();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO channel_members (channel, member, joined_at)
             VALUES (?1, ?2, ?3)",
            params![channel, member, now],
        )?;
        tx.execute(
            "INSERT INTO channel_log (channel, member, action, at)
             VALUES (?1, ?2, 'join', ?3)",
            params![channel, member, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// NOCASE collation makes the delete tolerate either stored casing.
    pub fn channel_leave(&mut self, channel: &str, member: &str) -> StorageResult<()> {
        let now = now_utc();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM channel_members WHERE channel = ?1 AND member = ?2",
            params![channel, member],
        )?;
        tx.execute(
            "INSERT INTO channel_log (channel, member, action, at)
             VALUES (?1, ?2, 'leave', ?3)",
            params![channel, member, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Channels a member belongs to, for auto-rejoin on reconnect.
    pub fn channels_for_member(&self, member: &str) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT channel FROM channel_members WHERE member = ?1 ORDER BY channel",
        )?;
        let rows = stmt.query_map(params![member], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn channel_memberships(&self) -> StorageResult<Vec<ChannelMembership>> {
        let mut stmt = self.conn().prepare(
            "SELECT channel, member FROM channel_members ORDER BY channel, joined_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChannelMembership {
                channel: row.get(0)?,
                member: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, to: &str, ts: u64) -> StoredMessage {
        StoredMessage {
            id: id.to_owned(),
            sender: Some("A".to_owned()),
            recipient: Some(to.to_owned()),
            topic: None,
            kind: "message".to_owned(),
            body: "hi".to_owned(),
            data: None,
            thread: None,
            ts,
            status: "sent".to_owned(),
            delivery_session_id: None,
            delivery_seq: None,
            offline_queued: false,
            cross_machine: false,
            is_channel_message: false,
            shadow_copy: false,
            is_broadcast: false,
        }
    }

    #[test]
    fn offline_queue_returns_ts_ascending() {
        let mut s = Storage::open_in_memory().unwrap();
        let mut late = message("m2", "C", 200);
        late.offline_queued = true;
        let mut early = message("m1", "C", 100);
        early.offline_queued = true;
        s.persist_message(&late).unwrap();
        s.persist_message(&early).unwrap();

        let queued = s.offline_queued_for("C").unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, "m1");
        assert_eq!(queued[1].id, "m2");

        s.mark_message_delivered("m1").unwrap();
        let queued = s.offline_queued_for("C").unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "m2");
    }

    #[test]
    fn unacked_for_session_orders_by_delivery_seq() {
        let mut s = Storage::open_in_memory().unwrap();
        for (id, seq) in [("d2", 2u64), ("d1", 1), ("d3", 3)] {
            let mut m = message(id, "B", 100);
            m.delivery_session_id = Some("s-42".to_owned());
            m.delivery_seq = Some(seq);
            s.persist_message(&m).unwrap();
        }
        // A different session's row is excluded.
        let mut other = message("dx", "B", 100);
        other.delivery_session_id = Some("s-other".to_owned());
        other.delivery_seq = Some(9);
        s.persist_message(&other).unwrap();

        let unacked = s.unacked_for_session("B", "s-42").unwrap();
        let ids: Vec<&str> = unacked.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["d1", "d2", "d3"]);
    }

    #[test]
    fn registry_knows_offline_agents() {
        let mut s = Storage::open_in_memory().unwrap();
        assert!(!s.known_agent("C").unwrap());
        s.upsert_agent("C", Some("claude"), None, None, None, None)
            .unwrap();
        assert!(s.known_agent("C").unwrap());
        s.bump_agent_counters("C", 1, 2).unwrap();
    }

    #[test]
    fn channel_membership_is_case_insensitive_but_preserves_casing() {
        let mut s = Storage::open_in_memory().unwrap();
        s.channel_join("#General", "Lead").unwrap();
        // Duplicate join under different casing is a no-op.
        s.channel_join("#general", "lead").unwrap();

        let members = s.channel_memberships().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].channel, "#General");
        assert_eq!(members[0].member, "Lead");

        // Leave tolerates either casing.
        s.channel_leave("#GENERAL", "LEAD").unwrap();
        assert!(s.channel_memberships().unwrap().is_empty());
    }

    #[test]
    fn channels_for_member_supports_auto_rejoin() {
        let mut s = Storage::open_in_memory().unwrap();
        s.channel_join("#general", "Worker1").unwrap();
        s.channel_join("#builds", "Worker1").unwrap();
        s.channel_join("#general", "Lead").unwrap();

        let channels = s.channels_for_member("worker1").unwrap();
        assert_eq!(channels, ["#builds", "#general"]);
    }
}
