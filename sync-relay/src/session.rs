//! Per-connection session management.
//!
//! Each connection gets a Session that tracks join state and handles
//! messages. Replies and forwarded envelopes share one bounded outbound
//! queue, drained by a writer task, so forwards from other sessions never
//! wait on this connection's socket.

use crate::error::{ProtocolError, ProtocolResult, RelayError};
use crate::protocol::{read_message, write_message};
use crate::server::{DeliveryTarget, SignalRelay};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use sync_types::{
    DeviceId, ErrorMessage, ForwardResult, Join, Joined, RelayMessage, SignalEnvelope,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Session state machine states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for JOIN message.
    AwaitingJoin,
    /// Envelopes for `device_id` are routed to this connection.
    Joined {
        /// The ID this connection joined as.
        device_id: DeviceId,
    },
    /// Session is closing.
    Closing,
}

/// A per-connection session.
pub struct Session {
    relay: Arc<SignalRelay>,
    peer: String,
    connection_id: u64,
    state: SessionState,
}

impl Session {
    /// Create a new session for a connection from `peer`.
    pub fn new(relay: Arc<SignalRelay>, peer: impl Into<String>) -> Self {
        let connection_id = relay.next_connection_id();
        Self {
            relay,
            peer: peer.into(),
            connection_id,
            state: SessionState::AwaitingJoin,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the session over `stream` until the peer leaves, disconnects,
    /// commits a fatal protocol error, or `shutdown` fires.
    pub async fn run<S>(mut self, stream: S, shutdown: CancellationToken) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(self.relay.config().server.outbound_queue);
        let writer_task = tokio::spawn(write_loop(writer, rx));

        self.relay
            .metrics()
            .connections_active
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!("New connection {} from {}", self.connection_id, self.peer);

        let result = self.read_loop(&mut reader, &tx, &shutdown).await;

        // Cleanup
        if let SessionState::Joined { device_id } = &self.state {
            self.relay.leave(device_id, self.connection_id);
        }
        self.state = SessionState::Closing;
        self.relay
            .metrics()
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);

        // Writer drains pending replies, then exits once every sender is gone.
        drop(tx);
        let _ = writer_task.await;
        tracing::debug!("Connection {} closed", self.connection_id);

        result.map_err(RelayError::from)
    }

    async fn read_loop<R>(
        &mut self,
        reader: &mut R,
        tx: &mpsc::Sender<RelayMessage>,
        shutdown: &CancellationToken,
    ) -> ProtocolResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.relay.config().server.max_frame_size;
        let join_timeout = self.relay.config().limits.join_timeout_secs;

        loop {
            let awaiting_join = matches!(self.state, SessionState::AwaitingJoin);
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Connection {} closed by shutdown", self.connection_id);
                    return Ok(());
                }
                next = async {
                    // Unjoined connections get a bounded window to identify themselves.
                    if awaiting_join {
                        tokio::time::timeout(
                            Duration::from_secs(join_timeout),
                            read_message(reader, limit),
                        )
                        .await
                        .unwrap_or(Err(ProtocolError::JoinTimeout(join_timeout)))
                    } else {
                        read_message(reader, limit).await
                    }
                } => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::debug!("Connection {} closed by peer", self.connection_id);
                    return Ok(());
                }
                Err(e) => {
                    self.report(&e, tx).await;
                    if e.is_fatal() {
                        return Err(e);
                    }
                    continue;
                }
            };

            match self.handle_message(message, tx) {
                Ok(Some(reply)) => {
                    if tx.send(reply).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.report(&e, tx).await;
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }

            if self.state == SessionState::Closing {
                return Ok(());
            }
        }
    }

    /// Count, log and (where the socket still works) answer a protocol error.
    async fn report(&self, err: &ProtocolError, tx: &mpsc::Sender<RelayMessage>) {
        self.relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
        match err {
            ProtocolError::Stream(_) => {
                tracing::debug!("Connection {} stream error: {}", self.connection_id, err);
                return;
            }
            ProtocolError::Spoofed { .. }
            | ProtocolError::RateLimited { .. }
            | ProtocolError::JoinTimeout(_) => {
                tracing::warn!("Connection {} from {}: {}", self.connection_id, self.peer, err);
            }
            _ => {
                tracing::debug!("Connection {} protocol error: {}", self.connection_id, err);
            }
        }
        let _ = tx
            .send(RelayMessage::Error(ErrorMessage {
                reason: err.to_string(),
            }))
            .await;
    }

    /// Handle one inbound message, returning the reply (if any).
    fn handle_message(
        &mut self,
        message: RelayMessage,
        tx: &mpsc::Sender<RelayMessage>,
    ) -> ProtocolResult<Option<RelayMessage>> {
        let joined = match &self.state {
            SessionState::Joined { device_id } => Some(device_id.clone()),
            SessionState::AwaitingJoin => None,
            SessionState::Closing => return Ok(None),
        };

        match message {
            RelayMessage::Ping => Ok(Some(RelayMessage::Pong)),
            RelayMessage::Join(join) => self.handle_join(join, tx).map(Some),
            RelayMessage::Signal(envelope) => {
                let device_id = joined.ok_or(ProtocolError::NotJoined)?;
                self.handle_signal(&device_id, envelope).map(Some)
            }
            RelayMessage::Leave => {
                let device_id = joined.ok_or(ProtocolError::NotJoined)?;
                self.relay.leave(&device_id, self.connection_id);
                tracing::info!("Device {} left relay", device_id);
                self.state = SessionState::Closing;
                Ok(None)
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: self.expected_message_types(),
                actual: other.name().to_string(),
            }),
        }
    }

    /// Handle JOIN. A connection joining under a new ID leaves its old one.
    fn handle_join(
        &mut self,
        join: Join,
        tx: &mpsc::Sender<RelayMessage>,
    ) -> ProtocolResult<RelayMessage> {
        if join.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                client: join.version,
                server: PROTOCOL_VERSION,
            });
        }
        if join.device_id.is_empty() {
            return Err(ProtocolError::EmptyDeviceId);
        }

        if let SessionState::Joined { device_id } = &self.state {
            if *device_id != join.device_id {
                self.relay.leave(device_id, self.connection_id);
            }
        }

        self.relay.join(
            &join.device_id,
            DeliveryTarget::new(self.connection_id, tx.clone()),
        );
        tracing::info!(
            "Session joined: device={} connection={} peer={}",
            join.device_id,
            self.connection_id,
            self.peer
        );

        self.state = SessionState::Joined {
            device_id: join.device_id.clone(),
        };
        Ok(RelayMessage::Joined(Joined {
            device_id: join.device_id,
        }))
    }

    /// Handle SIGNAL: check sender identity and limits, then forward.
    fn handle_signal(
        &self,
        device_id: &DeviceId,
        envelope: SignalEnvelope,
    ) -> ProtocolResult<RelayMessage> {
        if envelope.from != *device_id {
            return Err(ProtocolError::Spoofed {
                claimed: envelope.from,
                joined: device_id.clone(),
            });
        }

        if let Err(e) = self.relay.rate_limits().check_signal(device_id) {
            self.relay
                .metrics()
                .rate_limit_hits
                .fetch_add(1, Ordering::Relaxed);
            return Err(ProtocolError::RateLimited {
                reason: e.to_string(),
            });
        }

        let to = envelope.to.clone();
        tracing::debug!("Signal {:?} {} -> {}", envelope.kind, device_id, to);
        let delivery = self.relay.forward(envelope);

        Ok(RelayMessage::ForwardResult(ForwardResult {
            to,
            delivered: delivery.is_delivered(),
        }))
    }

    fn expected_message_types(&self) -> String {
        match self.state {
            SessionState::AwaitingJoin => "Join or Ping".to_string(),
            SessionState::Joined { .. } => "Signal, Join, Leave or Ping".to_string(),
            SessionState::Closing => "nothing".to_string(),
        }
    }
}

/// Drain the outbound queue onto the socket.
async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<RelayMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
