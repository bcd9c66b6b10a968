//! # sync-relay
//!
//! Store-nothing signaling relay for syncstuff.
//!
//! This crate implements a relay server that:
//! - Accepts TCP connections from devices
//! - Lets each connection join under a device ID
//! - Forwards offer/answer/candidate envelopes to the recipient's connection
//! - Never stores, queues or retries a payload
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                    ┌── Device B
//!            │   Signal(A → B)    │
//!            ├───────────────────►│
//!            │                    │
//!        ┌───┴────────────────────┴───┐
//!        │        sync-relay          │
//!        │  ┌─────────────────────┐   │
//!        │  │ join table (DashMap)│   │
//!        │  └─────────────────────┘   │
//!        └────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Length-prefixed MessagePack frames (see `sync_types::RelayMessage`):
//! - JOIN → JOINED
//! - SIGNAL → FORWARD_RESULT (and SIGNAL to the recipient)
//! - PING → PONG
//! - LEAVE (closes the session)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod maintenance;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError};
pub use error::{ProtocolError, RelayError};
pub use server::{Delivery, DeliveryTarget, RelayMetrics, Route, SignalRelay};
