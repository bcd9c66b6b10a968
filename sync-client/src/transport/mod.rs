//! Peer channel abstraction for syncstuff.
//!
//! Once two devices have exchanged signals, the sync layer treats the
//! connection between them as an opaque bidirectional stream of frames.
//! This module provides the trait for that stream plus two implementations
//! (TCP for real peers, mock for testing).
//!
//! # Design
//!
//! The channel trait is async and message-oriented:
//! - `send()` transmits one frame body
//! - `recv()` receives one frame body
//! - `close()` gracefully terminates
//!
//! # Example
//!
//! ```ignore
//! let channel = TcpChannel::connect(addr, &local_id).await?;
//! channel.send(&frame_bytes).await?;
//! let reply = channel.recv().await?;
//! ```

mod mock;
mod tcp;

pub use mock::MockChannel;
pub use tcp::{read_frame, write_frame, TcpChannel, TcpChannelFactory, CONNECT_TIMEOUT};

use async_trait::async_trait;
use std::sync::Arc;
use sync_types::DeviceId;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame exceeds the channel limit.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Announced length.
        size: usize,
        /// Channel maximum.
        limit: usize,
    },

    /// Peer address unknown.
    #[error("no address known for {0}")]
    UnknownPeer(DeviceId),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// A duplex, frame-oriented channel to one peer.
///
/// Implementations must allow one concurrent sender and one concurrent
/// receiver; the sync session manager writes while the inbound receiver
/// reads.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send one frame body.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame body.
    ///
    /// Blocks until data is available or the channel closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if the channel is still open.
    fn is_connected(&self) -> bool;

    /// Close the channel gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens a channel to a device once signaling has completed.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Connect to `remote`.
    async fn open(&self, remote: &DeviceId) -> Result<Arc<dyn PeerChannel>, TransportError>;
}
