//! # sync-client
//!
//! Device runtime for syncstuff.
//!
//! Everything a device needs to find, pair with and sync to its peers. The
//! decisions live in sync-core; this crate owns the sockets, tasks and files.
//!
//! ## Components
//!
//! - **Discovery**: UDP advertiser and listener feeding the device registry
//! - **Signaling**: relay client for offers and answers between devices
//! - **Pairing**: code and deep link handshakes with persistence
//! - **Sessions**: one ordered job queue and worker per peer channel
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{ClientConfig, JsonDeviceStore, SyncNode, TracingNotifier};
//!
//! let config = ClientConfig::from_file("syncstuff.toml".as_ref())?;
//! let store = Arc::new(JsonDeviceStore::new(&config.sync.store_path));
//! let node = SyncNode::start(config, store, Arc::new(TracingNotifier)).await?;
//!
//! let code = node.pairing().initiate(&remote).await?;
//! node.send_clipboard(&remote, "hello")?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod advertiser;
pub mod config;
pub mod discovery;
pub mod inbound;
pub mod node;
pub mod pairing;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transport;

pub use advertiser::{Advertiser, DEFAULT_ADVERTISE_INTERVAL};
pub use config::{ClientConfig, ConfigError};
pub use discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService, DEFAULT_DISCOVERY_PORT};
pub use inbound::{InboundEvent, InboundReceiver, InboundSink, ReceiveEnd};
pub use node::{NodeError, SyncNode};
pub use pairing::{
    Notifier, PairingDeps, PairingEvent, PairingService, PairingServiceError, TracingNotifier,
};
pub use session::{JobHandle, SessionConfig, SessionError, SessionManager, SyncEvent};
pub use signaling::{NoRelay, SignalSender, SignalingClient, SignalingError};
pub use store::{DeviceStore, JsonDeviceStore, MemoryDeviceStore, StoreError};
pub use transport::{
    ChannelFactory, MockChannel, PeerChannel, TcpChannel, TcpChannelFactory, TransportError,
};
