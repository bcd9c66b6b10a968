//! SignalEnvelope - the unit the relay forwards between two devices.

use serde::{Deserialize, Serialize};

use crate::{now_millis, DeviceId};

/// What a signaling payload carries. The relay never looks past this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Connection offer from the initiating side
    Offer,
    /// Answer to an offer
    Answer,
    /// Additional connectivity candidate
    Candidate,
}

/// Connection-establishment metadata addressed from one device to another.
///
/// Immutable once sent. The payload is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Sending device
    pub from: DeviceId,
    /// Receiving device
    pub to: DeviceId,
    /// Payload kind
    pub kind: SignalKind,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Unix millis at send time - informational only, not trusted
    #[serde(default)]
    pub sent_at: u64,
}

impl SignalEnvelope {
    /// Create a new envelope stamped with the current time.
    pub fn new(from: DeviceId, to: DeviceId, kind: SignalKind, data: Vec<u8>) -> Self {
        Self {
            from,
            to,
            kind,
            data,
            sent_at: now_millis(),
        }
    }
}
