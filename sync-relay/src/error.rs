//! Error types for sync-relay.

use sync_types::{DeviceId, SyncError};

/// Main error type for sync-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Invalid message format.
    #[error("invalid message format: {reason}")]
    InvalidMessage {
        /// Reason the message is invalid.
        reason: String,
    },

    /// Frame length exceeds the configured limit.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Announced body length.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Unexpected message type.
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: String,
        /// Actual message type received.
        actual: String,
    },

    /// Message requires a joined session.
    #[error("session not joined: JOIN required first")]
    NotJoined,

    /// Envelope `from` differs from the joined ID.
    #[error("envelope from {claimed} on a connection joined as {joined}")]
    Spoofed {
        /// ID the envelope claims.
        claimed: DeviceId,
        /// ID this connection joined as.
        joined: DeviceId,
    },

    /// Join carried an empty device ID.
    #[error("device id must not be empty")]
    EmptyDeviceId,

    /// Protocol version mismatch.
    #[error("protocol version mismatch: client={client}, server={server}")]
    VersionMismatch {
        /// Client protocol version.
        client: u32,
        /// Server protocol version.
        server: u32,
    },

    /// No JOIN within the configured window.
    #[error("no JOIN within {0}s")]
    JoinTimeout(u64),

    /// Rate limit exceeded.
    #[error("rate limited: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),
}

impl From<SyncError> for ProtocolError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::FrameTooLarge { size, limit } => ProtocolError::FrameTooLarge { size, limit },
            other => ProtocolError::InvalidMessage {
                reason: other.to_string(),
            },
        }
    }
}

impl ProtocolError {
    /// Whether the connection must be closed after reporting this error.
    ///
    /// Oversize frames leave the stream out of sync; version mismatches and
    /// join timeouts end the session by definition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::VersionMismatch { .. }
                | ProtocolError::JoinTimeout(_)
                | ProtocolError::Stream(_)
        )
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
