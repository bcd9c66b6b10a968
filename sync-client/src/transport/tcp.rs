//! TCP peer channel.
//!
//! Frames are a 4-byte big-endian length followed by the body. The first
//! frame on a fresh connection is the connecting device's ID, so the
//! accepting side knows who is on the other end before handing the channel
//! to the session manager.

use super::{ChannelFactory, PeerChannel, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_core::DiscoveryRegistry;
use sync_types::{decode_frame_len, encode_frame, DeviceId, FRAME_HEADER_LEN, MAX_PEER_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// How long `connect` waits for the TCP handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read one length-prefixed frame body.
///
/// EOF at a frame boundary is reported as [`TransportError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
    }

    let len = decode_frame_len(header, limit).map_err(|_| TransportError::FrameTooLarge {
        size: u32::from_be_bytes(header) as usize,
        limit,
    })?;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    Ok(body)
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&encode_frame(body))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// Peer channel over a TCP stream.
///
/// Read and write halves are locked independently, so one task can stream
/// a file while another waits for inbound frames.
pub struct TcpChannel {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    peer_addr: SocketAddr,
    max_frame_size: usize,
}

impl TcpChannel {
    fn from_stream(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            connected: AtomicBool::new(true),
            peer_addr,
            max_frame_size: MAX_PEER_FRAME_SIZE,
        }
    }

    /// Connect to a peer and announce `local_id`.
    pub async fn connect(addr: SocketAddr, local_id: &DeviceId) -> Result<Self, TransportError> {
        tracing::debug!("Connecting to peer at {}", addr);

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let channel = Self::from_stream(stream, addr);
        channel.send(local_id.as_str().as_bytes()).await?;
        Ok(channel)
    }

    /// Take an inbound stream and read the connecting device's ID.
    pub async fn accept(stream: TcpStream) -> Result<(DeviceId, Self), TransportError> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let channel = Self::from_stream(stream, peer_addr);

        let hello = tokio::time::timeout(CONNECT_TIMEOUT, channel.recv())
            .await
            .map_err(|_| TransportError::Timeout)??;
        let remote = String::from_utf8(hello)
            .map(DeviceId::new)
            .map_err(|_| TransportError::ReceiveFailed("device id is not utf-8".to_string()))?;
        if remote.is_empty() {
            return Err(TransportError::ReceiveFailed("empty device id".to_string()));
        }

        tracing::debug!("Accepted peer {} from {}", remote, peer_addr);
        Ok((remote, channel))
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if data.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                limit: self.max_frame_size,
            });
        }

        let mut writer = self.writer.lock().await;
        let result = write_frame(&mut *writer, data).await;
        if result.is_err() {
            self.connected.store(false, Ordering::Release);
        }
        result
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut reader = self.reader.lock().await;
        let result = read_frame(&mut *reader, self.max_frame_size).await;
        if result.is_err() {
            self.connected.store(false, Ordering::Release);
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        // Peer may already be gone
        let _ = writer.shutdown().await;
        Ok(())
    }
}

/// Opens TCP channels to devices the registry knows an address for.
pub struct TcpChannelFactory {
    local_id: DeviceId,
    registry: Arc<DiscoveryRegistry>,
}

impl TcpChannelFactory {
    /// Create a factory announcing `local_id` on every connection.
    pub fn new(local_id: DeviceId, registry: Arc<DiscoveryRegistry>) -> Self {
        Self { local_id, registry }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn open(&self, remote: &DeviceId) -> Result<Arc<dyn PeerChannel>, TransportError> {
        let device = self
            .registry
            .get(remote)
            .ok_or_else(|| TransportError::UnknownPeer(remote.clone()))?;
        let channel = TcpChannel::connect(device.socket_addr(), &self.local_id).await?;
        Ok(Arc::new(channel))
    }
}
