//! Error types for syncstuff wire types.

use thiserror::Error;

/// Errors that can occur while encoding or validating wire data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON encoding or decoding failed (discovery datagrams)
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Frame exceeds the maximum allowed size
    #[error("frame too large: {size} > {limit}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },
}
