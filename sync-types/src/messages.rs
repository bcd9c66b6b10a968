//! Framed protocol messages.
//!
//! Two protocols share the same framing (4-byte big-endian length prefix
//! followed by a MessagePack body):
//! - [`RelayMessage`] between a device and the signaling relay
//! - [`PeerFrame`] over an established peer channel

use serde::{Deserialize, Serialize};

use crate::{DeviceId, JobId, SignalEnvelope, SyncError};

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Maximum peer frame body (a file chunk plus envelope overhead).
pub const MAX_PEER_FRAME_SIZE: usize = 1024 * 1024;

/// Prefix `body` with its big-endian u32 length.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Read the body length out of a frame header, rejecting oversize frames.
pub fn decode_frame_len(header: [u8; FRAME_HEADER_LEN], limit: usize) -> Result<usize, SyncError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > limit {
        return Err(SyncError::FrameTooLarge { size: len, limit });
    }
    Ok(len)
}

/// Messages exchanged between a device and the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    /// Register this connection as the delivery target for a device ID
    Join(Join),
    /// Relay confirmation of a join
    Joined(Joined),
    /// Stop receiving envelopes for the joined ID
    Leave,
    /// An envelope to forward (device → relay) or a delivery (relay → device)
    Signal(SignalEnvelope),
    /// Outcome of a forward, sent back to the sender
    ForwardResult(ForwardResult),
    /// Keepalive request
    Ping,
    /// Keepalive response
    Pong,
    /// Request rejected
    Error(ErrorMessage),
}

impl RelayMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RelayMessage::Join(_) => "Join",
            RelayMessage::Joined(_) => "Joined",
            RelayMessage::Leave => "Leave",
            RelayMessage::Signal(_) => "Signal",
            RelayMessage::ForwardResult(_) => "ForwardResult",
            RelayMessage::Ping => "Ping",
            RelayMessage::Pong => "Pong",
            RelayMessage::Error(_) => "Error",
        }
    }
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Protocol version (currently 1)
    pub version: u32,
    /// Device ID to receive envelopes for
    pub device_id: DeviceId,
}

/// Join confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joined {
    /// The ID now routed to this connection
    pub device_id: DeviceId,
}

/// Whether a forwarded envelope reached a joined target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResult {
    /// Envelope recipient
    pub to: DeviceId,
    /// False when the recipient was not joined (or its queue was full)
    pub delivered: bool,
}

/// Rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable reason
    pub reason: String,
}

const REPLACED_SUFFIX: &str = " joined from another connection";

impl ErrorMessage {
    /// Unsolicited notice to a connection whose device ID joined elsewhere.
    pub fn replaced(device_id: &DeviceId) -> Self {
        Self {
            reason: format!("{}{}", device_id, REPLACED_SUFFIX),
        }
    }

    /// Whether this is a [`ErrorMessage::replaced`] notice rather than a reply.
    pub fn is_replaced(&self) -> bool {
        self.reason.ends_with(REPLACED_SUFFIX)
    }
}

/// Frames sent over an established peer channel by the sync session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerFrame {
    /// Complete clipboard item
    Clipboard {
        /// Job that produced this frame
        job_id: JobId,
        /// MIME type of the content
        content_type: String,
        /// Clipboard bytes
        content: Vec<u8>,
    },
    /// A file transfer begins
    FileStart {
        /// Job that produced this frame
        job_id: JobId,
        /// Sender-chosen file identifier
        file_id: String,
        /// Display name of the file
        file_name: String,
        /// Total size in bytes
        total_bytes: u64,
    },
    /// Next slice of file content
    FileChunk {
        /// Job that produced this frame
        job_id: JobId,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// All chunks sent
    FileEnd {
        /// Job that produced this frame
        job_id: JobId,
    },
    /// Transfer abandoned by the sender
    FileAbort {
        /// Job that produced this frame
        job_id: JobId,
        /// Why the transfer stopped
        reason: String,
    },
}

impl PeerFrame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// The job this frame belongs to.
    pub fn job_id(&self) -> JobId {
        match self {
            PeerFrame::Clipboard { job_id, .. }
            | PeerFrame::FileStart { job_id, .. }
            | PeerFrame::FileChunk { job_id, .. }
            | PeerFrame::FileEnd { job_id }
            | PeerFrame::FileAbort { job_id, .. } => *job_id,
        }
    }
}
