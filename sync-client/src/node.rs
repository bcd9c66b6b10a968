//! A running syncstuff device.
//!
//! [`SyncNode`] wires the components together: the registry (preloaded with
//! stored pairings), the advertiser and discovery listener, the optional
//! relay connection, the pairing service, the session manager and a TCP
//! listener for peer channels.

use crate::advertiser::Advertiser;
use crate::config::{ClientConfig, ConfigError};
use crate::discovery::DiscoveryService;
use crate::inbound::{InboundEvent, InboundSink};
use crate::pairing::{Notifier, PairingDeps, PairingService};
use crate::session::{JobHandle, SessionError, SessionManager};
use crate::signaling::{NoRelay, SignalSender, SignalingClient};
use crate::store::{DeviceStore, StoreError};
use crate::transport::{ChannelFactory, TcpChannel, TcpChannelFactory, TransportError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::DiscoveryRegistry;
use sync_types::{now_millis, DeviceId, FileTransfer, JobId, SignalEnvelope, SyncJob};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INBOUND_EVENT_CAPACITY: usize = 64;
const PAIRING_TICK: Duration = Duration::from_secs(1);

/// Node start-up and operation errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A socket could not be bound or a file read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Paired devices could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Peer channel failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Only paired devices can be synced with.
    #[error("device {0} is not paired")]
    NotPaired(DeviceId),
}

/// A running device.
pub struct SyncNode {
    device_id: DeviceId,
    config: ClientConfig,
    registry: Arc<DiscoveryRegistry>,
    advertiser: Arc<Advertiser>,
    discovery: Arc<DiscoveryService>,
    sessions: SessionManager,
    pairing: Arc<PairingService>,
    channels: Arc<dyn ChannelFactory>,
    signaling: Option<Arc<SignalingClient>>,
    inbound_events: broadcast::Sender<InboundEvent>,
    listen_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncNode {
    /// Bind every socket, start the background tasks and begin advertising.
    ///
    /// An unreachable relay is logged and the node runs LAN-only.
    pub async fn start(
        config: ClientConfig,
        store: Arc<dyn DeviceStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let device_id = config.device_id();
        tracing::info!("Starting node {} ({})", config.device.name, device_id);

        let registry = Arc::new(DiscoveryRegistry::new(config.offline_timeout()));
        let stored = store.load().await?;
        tracing::info!("Loaded {} paired devices", stored.len());
        for mut device in stored {
            device.is_online = false;
            registry.mark_paired(device);
        }

        let listener = TcpListener::bind(config.sync.listen_address).await?;
        let listen_addr = listener.local_addr()?;

        let advertiser = Arc::new(
            Advertiser::bind(
                device_id.clone(),
                config.device.platform,
                config.broadcast_target(),
                config.advertise_interval(),
            )
            .await?,
        );
        let discovery = Arc::new(
            DiscoveryService::bind(
                config.discovery_config(),
                device_id.clone(),
                registry.clone(),
                Some(advertiser.clone()),
            )
            .await?,
        );

        let (inbound_events, _) = broadcast::channel(INBOUND_EVENT_CAPACITY);
        let sessions = SessionManager::new(config.session_config()).with_inbound(InboundSink {
            download_dir: config.sync.download_dir.clone(),
            events: inbound_events.clone(),
        });

        let (signaling, relay_inbound) = match &config.relay.address {
            Some(address) => {
                match SignalingClient::connect(address, device_id.clone(), config.forward_timeout())
                    .await
                {
                    Ok((client, inbound)) => (Some(Arc::new(client)), Some(inbound)),
                    Err(e) => {
                        tracing::warn!("Relay {} unavailable, running LAN-only: {}", address, e);
                        (None, None)
                    }
                }
            }
            None => (None, None),
        };
        let signals: Arc<dyn SignalSender> = match &signaling {
            Some(client) => client.clone(),
            None => Arc::new(NoRelay),
        };

        let channels: Arc<dyn ChannelFactory> =
            Arc::new(TcpChannelFactory::new(device_id.clone(), registry.clone()));
        let pairing = Arc::new(
            PairingService::new(
                device_id.clone(),
                config.device.name.clone(),
                config.pairing_config(),
                PairingDeps {
                    signals,
                    channels: channels.clone(),
                    store,
                    registry: registry.clone(),
                    sessions: sessions.clone(),
                    notifier,
                },
            )
            .with_link_scheme(config.pairing.link_scheme.clone()),
        );

        let node = Self {
            device_id,
            config,
            registry,
            advertiser,
            discovery,
            sessions,
            pairing,
            channels,
            signaling,
            inbound_events,
            listen_addr,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };

        node.discovery.start();
        node.advertiser
            .start_advertising(&node.config.device.name, listen_addr.port());

        let mut tasks = vec![
            tokio::spawn(accept_loop(
                listener,
                node.pairing.clone(),
                node.shutdown.clone(),
            )),
            tokio::spawn(pairing_ticker(node.pairing.clone(), node.shutdown.clone())),
        ];
        if let Some(inbound) = relay_inbound {
            tasks.push(tokio::spawn(signal_dispatch(
                inbound,
                node.registry.clone(),
                node.pairing.clone(),
                node.shutdown.clone(),
            )));
        }
        node.lock_tasks().extend(tasks);

        tracing::info!("Node listening for peers on {}", listen_addr);
        Ok(node)
    }

    /// This device's ID.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Address the peer listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Known devices.
    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    /// Discovery listener.
    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Pairing service.
    pub fn pairing(&self) -> &Arc<PairingService> {
        &self.pairing
    }

    /// Session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Whether the relay connection is up.
    pub fn relay_connected(&self) -> bool {
        self.signaling
            .as_ref()
            .is_some_and(|client| client.is_connected())
    }

    /// Subscribe to received clipboard items and files.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound_events.subscribe()
    }

    /// Resume advertising under the configured name.
    pub fn start_advertising(&self) {
        self.advertiser
            .start_advertising(&self.config.device.name, self.listen_addr.port());
    }

    /// Stop advertising. Discovery keeps listening.
    pub fn stop_advertising(&self) {
        self.advertiser.stop_advertising();
    }

    /// Open a session with a paired device at its discovered address.
    pub async fn connect(&self, peer: &DeviceId) -> Result<(), NodeError> {
        if !self.registry.get(peer).is_some_and(|d| d.paired) {
            return Err(NodeError::NotPaired(peer.clone()));
        }
        let channel = self.channels.open(peer).await?;
        self.sessions.open_session(peer.clone(), channel).await;
        Ok(())
    }

    /// Queue a clipboard text push to `peer`.
    pub fn send_clipboard(&self, peer: &DeviceId, text: &str) -> Result<JobHandle, NodeError> {
        Ok(self.sessions.enqueue(peer, SyncJob::clipboard_text(text))?)
    }

    /// Queue a file transfer to `peer`.
    pub async fn send_file(&self, peer: &DeviceId, path: &Path) -> Result<JobHandle, NodeError> {
        let metadata = tokio::fs::metadata(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let transfer = FileTransfer::new(JobId::new().to_string(), file_name, metadata.len(), path);
        Ok(self.sessions.enqueue(peer, SyncJob::FileTransfer(transfer))?)
    }

    /// Stop every task, close every session and leave the relay.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.device_id);
        self.shutdown.cancel();
        self.advertiser.stop_advertising();
        self.discovery.shutdown().await;
        self.sessions.close_all().await;
        if let Some(client) = &self.signaling {
            if let Err(e) = client.leave().await {
                tracing::debug!("Relay leave failed: {}", e);
            }
        }

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn accept_loop(
    listener: TcpListener,
    pairing: Arc<PairingService>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Peer accept failed: {}", e);
                    continue;
                }
            },
        };

        let pairing = pairing.clone();
        tokio::spawn(async move {
            let (remote, channel) = match TcpChannel::accept(stream).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!("Handshake from {} failed: {}", addr, e);
                    return;
                }
            };
            if let Err(e) = pairing.accept_channel(remote, Arc::new(channel)).await {
                tracing::warn!("Channel from {} refused: {}", addr, e);
            }
        });
    }
}

async fn signal_dispatch(
    mut inbound: mpsc::Receiver<SignalEnvelope>,
    registry: Arc<DiscoveryRegistry>,
    pairing: Arc<PairingService>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            envelope = inbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    tracing::warn!("Relay connection lost");
                    break;
                }
            },
        };

        registry.touch(&envelope.from, now_millis());
        let from = envelope.from.clone();
        if let Err(e) = pairing.handle_signal(envelope).await {
            tracing::warn!("Signal from {} rejected: {}", from, e);
        }
    }
}

async fn pairing_ticker(pairing: Arc<PairingService>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PAIRING_TICK);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                pairing.tick_timeouts(now_millis());
            }
        }
    }
}
