use relay_protocol::framing::{encode, FrameParser};
use relay_protocol::{
    AckPayload, Body, Envelope, EntityKind, HelloPayload, MessagePayload,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// A test agent speaking the framed socket protocol.
pub struct MockAgent {
    stream: UnixStream,
    parser: FrameParser,
    pub name: String,
    pub session_id: String,
}

impl MockAgent {
    /// Connect and complete the HELLO handshake as an agent.
    pub async fn connect(
        socket: &Path,
        name: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        Self::connect_with_session(socket, name, &session_id, EntityKind::Agent).await
    }

    /// Connect reusing a specific session id (resume scenarios) or as a
    /// different entity kind.
    pub async fn connect_with_session(
        socket: &Path,
        name: &str,
        session_id: &str,
        entity: EntityKind,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = UnixStream::connect(socket).await?;
        let mut agent = MockAgent {
            stream,
            parser: FrameParser::new(),
            name: name.to_owned(),
            session_id: session_id.to_owned(),
        };
        agent
            .send(
                Envelope::new(Body::Hello {
                    payload: HelloPayload {
                        name: name.to_owned(),
                        entity_type: entity,
                        cli: Some("mock".to_owned()),
                        program: None,
                        model: None,
                        task: None,
                        cwd: None,
                        session_id: session_id.to_owned(),
                    },
                }),
            )
            .await?;
        Ok(agent)
    }

    pub async fn send(&mut self, envelope: Envelope) -> Result<(), Box<dyn std::error::Error>> {
        let frame = encode(&envelope)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Send a direct message to `to`.
    pub async fn send_message(
        &mut self,
        to: &str,
        body: &str,
    ) -> Result<Envelope, Box<dyn std::error::Error>> {
        let envelope = Envelope::new(Body::Send {
            payload: MessagePayload {
                kind: "message".to_owned(),
                body: body.to_owned(),
                data: None,
                thread: None,
            },
        })
        .with_from(self.name.clone())
        .with_to(to);
        self.send(envelope.clone()).await?;
        Ok(envelope)
    }

    /// Receive the next envelope, waiting up to `timeout`.
    pub async fn recv(
        &mut self,
        timeout: Duration,
    ) -> Result<Envelope, Box<dyn std::error::Error>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            if let Some(envelope) = self.parser.next()? {
                return Ok(envelope);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or("timed out waiting for envelope")?;
            let n = tokio::time::timeout(remaining, self.stream.read(&mut buf))
                .await
                .map_err(|_| "timed out waiting for envelope")??;
            if n == 0 {
                return Err("connection closed".into());
            }
            self.parser.push(&buf[..n]);
        }
    }

    /// Receive until a DELIVER arrives; returns it.
    pub async fn recv_deliver(
        &mut self,
        timeout: Duration,
    ) -> Result<Envelope, Box<dyn std::error::Error>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or("timed out waiting for DELIVER")?;
            let envelope = self.recv(remaining).await?;
            if matches!(envelope.body, Body::Deliver { .. }) {
                return Ok(envelope);
            }
        }
    }

    /// Acknowledge a DELIVER by its envelope id.
    pub async fn ack(&mut self, deliver_id: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.send(
            Envelope::new(Body::Ack {
                payload: AckPayload {
                    ack_id: deliver_id.to_owned(),
                },
            })
            .with_from(self.name.clone()),
        )
        .await
    }

    /// Close the socket.
    pub async fn close(mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
