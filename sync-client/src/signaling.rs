//! Signaling relay client.
//!
//! Joins the relay under this device's ID, forwards envelopes to other
//! devices and hands incoming envelopes to the caller through an mpsc
//! receiver.
//!
//! The relay answers requests in order on each connection, so replies
//! (`ForwardResult`, `Pong`, `Error`) are matched to requests with a FIFO of
//! oneshot senders. Incoming `Signal`s are unsolicited and bypass the FIFO.

use crate::transport::{read_frame, write_frame, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use sync_types::{
    DeviceId, ErrorMessage, ForwardResult, Join, RelayMessage, SignalEnvelope, SyncError,
    PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Largest relay frame accepted or sent.
pub const MAX_SIGNAL_FRAME_SIZE: usize = 64 * 1024;

/// Default wait for a `ForwardResult`.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound envelope channel.
const INBOUND_CAPACITY: usize = 64;

/// Signaling errors.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Could not reach the relay.
    #[error("relay connection failed: {0}")]
    Connect(String),

    /// Relay refused the request.
    #[error("relay rejected request: {0}")]
    Rejected(String),

    /// Target device is not joined (or its queue was full).
    #[error("signal to {to} was not delivered")]
    Undelivered {
        /// Intended recipient.
        to: DeviceId,
    },

    /// Connection to the relay is gone.
    #[error("not connected to relay")]
    Disconnected,

    /// No reply in time.
    #[error("relay did not reply in time")]
    Timeout,

    /// Relay sent something we could not make sense of.
    #[error("relay protocol error: {0}")]
    Protocol(String),

    /// Encoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] SyncError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Sends signaling envelopes to other devices.
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Forward one envelope. `Ok` means the relay delivered it.
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}

/// Signal sender used when no relay is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelay;

#[async_trait]
impl SignalSender for NoRelay {
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        tracing::debug!("No relay configured, dropping {:?} to {}", envelope.kind, envelope.to);
        Err(SignalingError::Disconnected)
    }
}

type PendingReplies = Arc<StdMutex<VecDeque<oneshot::Sender<RelayMessage>>>>;

/// A joined connection to the signaling relay.
pub struct SignalingClient {
    device_id: DeviceId,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingReplies,
    connected: Arc<AtomicBool>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    forward_timeout: Duration,
}

impl SignalingClient {
    /// Connect to the relay at `addr` and join as `device_id`.
    ///
    /// Returns the client and the stream of envelopes addressed to us.
    pub async fn connect(
        addr: &str,
        device_id: DeviceId,
        forward_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<SignalEnvelope>), SignalingError> {
        tracing::info!("Connecting to signaling relay at {}", addr);

        let stream = tokio::time::timeout(forward_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SignalingError::Timeout)?
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let join = RelayMessage::Join(Join {
            version: PROTOCOL_VERSION,
            device_id: device_id.clone(),
        });
        write_frame(&mut writer, &join.to_bytes()?).await?;

        let reply = tokio::time::timeout(
            forward_timeout,
            read_frame(&mut reader, MAX_SIGNAL_FRAME_SIZE),
        )
        .await
        .map_err(|_| SignalingError::Timeout)??;

        match RelayMessage::from_bytes(&reply)? {
            RelayMessage::Joined(joined) if joined.device_id == device_id => {}
            RelayMessage::Joined(joined) => {
                return Err(SignalingError::Protocol(format!(
                    "joined as {} instead of {}",
                    joined.device_id, device_id
                )))
            }
            RelayMessage::Error(ErrorMessage { reason }) => {
                return Err(SignalingError::Rejected(reason))
            }
            other => {
                return Err(SignalingError::Protocol(format!(
                    "expected Joined, got {}",
                    other.name()
                )))
            }
        }
        tracing::info!("Joined signaling relay as {}", device_id);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let pending: PendingReplies = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(read_loop(
            reader,
            inbound_tx,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        let client = Self {
            device_id,
            writer: Mutex::new(writer),
            pending,
            connected,
            reader_task: StdMutex::new(Some(task)),
            forward_timeout,
        };
        Ok((client, inbound_rx))
    }

    /// The ID we joined under.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Whether the relay connection is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Round-trip a `Ping`.
    pub async fn ping(&self) -> Result<Duration, SignalingError> {
        let started = Instant::now();
        match self.request(RelayMessage::Ping).await? {
            RelayMessage::Pong => Ok(started.elapsed()),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Leave the relay and close the connection.
    pub async fn leave(&self) -> Result<(), SignalingError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let bytes = RelayMessage::Leave.to_bytes()?;
        let mut writer = self.writer.lock().await;
        let sent = write_frame(&mut *writer, &bytes).await;
        let _ = writer.shutdown().await;
        drop(writer);

        self.stop_reader();
        lock(&self.pending).clear();
        tracing::info!("Left signaling relay");
        sent.map_err(SignalingError::from)
    }

    /// Send a request and wait for the relay's in-order reply.
    async fn request(&self, message: RelayMessage) -> Result<RelayMessage, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_SIGNAL_FRAME_SIZE {
            return Err(SyncError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_SIGNAL_FRAME_SIZE,
            }
            .into());
        }

        let (tx, rx) = oneshot::channel();
        {
            // Queue the reply slot under the writer lock so slots line up
            // with the order requests hit the wire
            let mut writer = self.writer.lock().await;
            lock(&self.pending).push_back(tx);
            if let Err(e) = write_frame(&mut *writer, &bytes).await {
                self.connected.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.forward_timeout, rx).await {
            Err(_) => Err(SignalingError::Timeout),
            Ok(Err(_)) => Err(SignalingError::Disconnected),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    fn stop_reader(&self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalSender for SignalingClient {
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let to = envelope.to.clone();
        let kind = envelope.kind;

        match self.request(RelayMessage::Signal(envelope)).await? {
            RelayMessage::ForwardResult(ForwardResult {
                delivered: true, ..
            }) => {
                tracing::debug!("Signal {:?} delivered to {}", kind, to);
                Ok(())
            }
            RelayMessage::ForwardResult(ForwardResult {
                delivered: false, ..
            }) => Err(SignalingError::Undelivered { to }),
            RelayMessage::Error(ErrorMessage { reason }) => Err(SignalingError::Rejected(reason)),
            other => Err(unexpected_reply(other)),
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

fn unexpected_reply(message: RelayMessage) -> SignalingError {
    SignalingError::Protocol(format!("unexpected reply {}", message.name()))
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<SignalEnvelope>,
    pending: PendingReplies,
    connected: Arc<AtomicBool>,
) {
    loop {
        let body = match read_frame(&mut reader, MAX_SIGNAL_FRAME_SIZE).await {
            Ok(body) => body,
            Err(TransportError::ConnectionClosed) => {
                tracing::info!("Signaling relay closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Signaling relay read failed: {}", e);
                break;
            }
        };

        let message = match RelayMessage::from_bytes(&body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping undecodable relay message: {}", e);
                continue;
            }
        };

        match message {
            // Not a reply: the relay now routes our ID to another connection
            RelayMessage::Error(notice) if notice.is_replaced() => {
                tracing::warn!("Relay dropped this connection: {}", notice.reason);
                break;
            }
            RelayMessage::Signal(envelope) => {
                tracing::debug!("Signal {:?} from {}", envelope.kind, envelope.from);
                if inbound.send(envelope).await.is_err() {
                    tracing::debug!("Inbound signal receiver dropped");
                }
            }
            reply @ (RelayMessage::ForwardResult(_) | RelayMessage::Pong | RelayMessage::Error(_)) => {
                let slot = lock(&pending).pop_front();
                match (slot, reply) {
                    (Some(tx), reply) => {
                        // Requester may have timed out
                        let _ = tx.send(reply);
                    }
                    (None, RelayMessage::Error(ErrorMessage { reason })) => {
                        tracing::warn!("Relay error: {}", reason);
                    }
                    (None, other) => {
                        tracing::debug!("Unmatched relay reply {}", other.name());
                    }
                }
            }
            other => tracing::debug!("Ignoring relay message {}", other.name()),
        }
    }

    connected.store(false, Ordering::Release);
    // Dropping the senders wakes every waiter with Disconnected
    lock(&pending).clear();
}
