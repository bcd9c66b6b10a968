//! # sync-core
//!
//! Pure logic for syncstuff (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping behind discovery,
//! pairing and sync sessions without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! Every module here takes the current time as an argument instead of reading
//! a clock, so behaviour is deterministic and tests need no mocks or async.
//!
//! The actual I/O (UDP, relay connection, peer channels, disk) is performed by
//! `sync-client`, which drives these types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pairing;
pub mod progress;
pub mod queue;
pub mod registry;

pub use pairing::{
    PairingCode, PairingConfig, PairingCoordinator, PairingError, PairingLink, PairingRequest,
    PairingState, DEFAULT_LINK_SCHEME, DEFAULT_MAX_RETRIES, DEFAULT_PAIRING_TIMEOUT,
};
pub use progress::{ProgressThrottle, DEFAULT_PROGRESS_INTERVAL};
pub use queue::{JobQueue, QueueError, QueuedJob, DEFAULT_QUEUE_CAPACITY};
pub use registry::{DiscoveryError, DiscoveryRegistry, Upsert, DEFAULT_OFFLINE_TIMEOUT};
