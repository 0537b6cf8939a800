//! Unix socket server: accept loop, handshake, and per-connection tasks.
//!
//! Each accepted socket runs two tasks: a reader that parses frames and
//! dispatches envelopes, and a writer that drains the connection's outbound
//! queue.  The first envelope must be HELLO; anything else (or silence past
//! the malformed timeout) fails the connection with a protocol error.

use crate::config::RelayConfig;
use crate::connection::{run_writer, ConnectionHandle, ConnectionMeta, WRITE_QUEUE_CAPACITY};
use crate::router::Router;
use crate::spawn::SpawnManager;
use relay_protocol::{close_reasons, framing::FrameParser, Body, Envelope, EntityKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{unix::OwnedReadHalf, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Accept connections until shutdown fires.
pub async fn run_listener(
    listener: UnixListener,
    router: Arc<Router>,
    spawner: Arc<SpawnManager>,
    config: Arc<RelayConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            Arc::clone(&router),
                            Arc::clone(&spawner),
                            Arc::clone(&config),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Drive one socket from handshake to disconnect.
async fn serve_connection(
    stream: UnixStream,
    router: Arc<Router>,
    spawner: Arc<SpawnManager>,
    config: Arc<RelayConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let mut parser = FrameParser::new();

    // Handshake: the first envelope must arrive within the malformed
    // timeout and must be HELLO.
    let hello_env = match tokio::time::timeout(
        config.malformed_timeout,
        read_one_envelope(&mut read_half, &mut parser),
    )
    .await
    {
        Ok(Ok(Some(envelope))) => envelope,
        Ok(Ok(None)) => return,
        Ok(Err(reason)) => {
            debug!(reason = %reason, "connection failed before handshake");
            return;
        }
        Err(_) => {
            debug!("no HELLO within the malformed timeout");
            return;
        }
    };
    let first_kind = hello_env.kind_tag();
    let Body::Hello { payload: hello } = hello_env.body else {
        warn!(
            kind = first_kind,
            reason = close_reasons::PROTOCOL_ERROR,
            "first envelope was not HELLO"
        );
        return;
    };
    if hello.name.is_empty() {
        warn!(reason = close_reasons::PROTOCOL_ERROR, "HELLO with empty name");
        return;
    }
    if let Some(max) = config.max_agents {
        if hello.entity_type == EntityKind::Agent
            && router.agent_count() >= max as usize
            && router.agent_connection(&hello.name).is_none()
        {
            warn!(name = %hello.name, max, "agent ceiling reached, refusing connection");
            return;
        }
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let conn = Arc::new(ConnectionHandle::new(
        hello.name.clone(),
        hello.entity_type,
        hello.session_id.clone(),
        ConnectionMeta {
            cli: hello.cli.clone(),
            program: hello.program.clone(),
            model: hello.model.clone(),
            task: hello.task.clone(),
            cwd: hello.cwd.clone(),
        },
        outbound_tx,
        config.write_deadline,
    ));
    info!(
        name = %conn.name,
        id = conn.id,
        session = %conn.session_id,
        entity = ?conn.entity,
        "connection registered"
    );
    tokio::spawn(run_writer(write_half, outbound_rx, conn.closed()));
    router.register(Arc::clone(&conn)).await;

    // Read loop.
    let mut closed = conn.closed();
    let mut buf = vec![0u8; READ_CHUNK];
    'read: loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break 'read;
                }
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break 'read;
                }
            }
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(name = %conn.name, reason = close_reasons::TRANSPORT_CLOSED, "peer closed");
                        break 'read;
                    }
                    Ok(n) => {
                        parser.push(&buf[..n]);
                        loop {
                            match parser.next() {
                                Ok(Some(envelope)) => {
                                    dispatch(&router, &spawner, &conn, envelope).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(
                                        name = %conn.name,
                                        error = %e,
                                        reason = close_reasons::PROTOCOL_ERROR,
                                        "framing error, closing connection"
                                    );
                                    break 'read;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(name = %conn.name, error = %e, "read failed");
                        break 'read;
                    }
                }
            }
        }
    }

    conn.close();
    router.unregister(&conn).await;
    info!(name = %conn.name, id = conn.id, "connection gone");
}

/// Route one decoded envelope.
async fn dispatch(
    router: &Arc<Router>,
    spawner: &Arc<SpawnManager>,
    conn: &Arc<ConnectionHandle>,
    envelope: Envelope,
) {
    // Dedup window: a repeated id produces no duplicate effect.
    if !router.observe_inbound(conn.id, &envelope.id) {
        debug!(id = %envelope.id, name = %conn.name, "duplicate envelope suppressed");
        return;
    }
    // Any envelope from an agent clears its processing state.
    if conn.entity == EntityKind::Agent {
        router.clear_processing(&conn.name);
    }

    match &envelope.body {
        Body::Send { .. } => router.route(conn, envelope).await,
        Body::Ack { payload } => router.handle_ack(conn, payload).await,
        Body::Subscribe { payload } => router.subscribe(&conn.name, &payload.topic),
        Body::Unsubscribe { payload } => router.unsubscribe(&conn.name, &payload.topic),
        Body::ChannelJoin { payload } => router.handle_channel_join(conn, payload).await,
        Body::ChannelLeave { payload } => router.handle_channel_leave(conn, payload).await,
        Body::ChannelMessage { .. } => router.handle_channel_message(conn, &envelope).await,
        Body::Spawn { payload } => spawner.handle_spawn(conn, payload).await,
        Body::Release { payload } => spawner.handle_release(conn, payload).await,
        Body::Hello { .. }
        | Body::Deliver { .. }
        | Body::SpawnResult { .. }
        | Body::ReleaseResult { .. } => {
            warn!(
                kind = envelope.kind_tag(),
                name = %conn.name,
                reason = close_reasons::PROTOCOL_ERROR,
                "unexpected envelope kind, closing connection"
            );
            conn.close();
        }
    }
}

/// Read frames until one complete envelope decodes.
///
/// `Ok(None)` means the peer closed cleanly before a full frame.
async fn read_one_envelope(
    read_half: &mut OwnedReadHalf,
    parser: &mut FrameParser,
) -> Result<Option<Envelope>, String> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if let Some(envelope) = parser.next().map_err(|e| e.to_string())? {
            return Ok(Some(envelope));
        }
        let n = read_half.read(&mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(None);
        }
        parser.push(&buf[..n]);
    }
}
