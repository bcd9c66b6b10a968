//! # sync-types
//!
//! Wire format and data model types for syncstuff.
//!
//! This crate provides the foundational types used across all syncstuff crates:
//! - [`DeviceId`], [`JobId`] - Identity types
//! - [`Device`], [`Platform`] - Device descriptor
//! - [`Advertisement`], [`DiscoveryMessage`] - Local discovery datagrams
//! - [`SignalEnvelope`] - Signaling payload forwarded by the relay
//! - [`RelayMessage`], [`PeerFrame`] - Framed protocol messages
//! - [`SyncJob`] - Clipboard and file work items
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod device;
mod discovery;
mod envelope;
mod error;
mod ids;
mod job;
mod messages;

pub use device::{Device, Platform};
pub use discovery::{
    Advertisement, DiscoveryMessage, TxtRecord, PROTOCOL_VERSION, SERVICE_PROTOCOL, SERVICE_TYPE,
};
pub use envelope::{SignalEnvelope, SignalKind};
pub use error::SyncError;
pub use ids::{now_millis, DeviceId, JobId};
pub use job::{FileTransfer, SyncJob};
pub use messages::{
    decode_frame_len, encode_frame, ErrorMessage, ForwardResult, Join, Joined, PeerFrame,
    RelayMessage, FRAME_HEADER_LEN, MAX_PEER_FRAME_SIZE,
};
