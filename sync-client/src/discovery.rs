//! Discovery listener.
//!
//! Binds the discovery port, feeds announcements into the
//! [`DiscoveryRegistry`], answers probes with the advertiser's current
//! descriptor and periodically sweeps stale devices offline.

use crate::advertiser::Advertiser;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{DiscoveryRegistry, Upsert};
use sync_types::{now_millis, Device, DeviceId, DiscoveryMessage, SERVICE_TYPE};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default discovery UDP port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 47474;

/// Default gap between offline sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const MAX_DATAGRAM: usize = 4096;
const EVENT_CAPACITY: usize = 64;

/// Registry changes observed by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// First sighting of a device.
    DeviceFound(Device),
    /// A known device that was offline advertised again.
    DeviceOnline(Device),
    /// A device missed its advertisements for longer than the timeout.
    DeviceOffline(DeviceId),
}

/// Socket and timing settings for [`DiscoveryService`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the listener binds.
    pub bind_address: SocketAddr,
    /// Where probes are broadcast.
    pub broadcast_target: SocketAddr,
    /// How often the registry is swept.
    pub sweep_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISCOVERY_PORT)),
            broadcast_target: SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT)),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Listens for advertisements and maintains the registry.
pub struct DiscoveryService {
    local_id: DeviceId,
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    registry: Arc<DiscoveryRegistry>,
    advertiser: Option<Arc<Advertiser>>,
    events: broadcast::Sender<DiscoveryEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Bind the discovery socket. Nothing runs until [`start`](Self::start).
    pub async fn bind(
        config: DiscoveryConfig,
        local_id: DeviceId,
        registry: Arc<DiscoveryRegistry>,
        advertiser: Option<Arc<Advertiser>>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind_address).await?;
        socket.set_broadcast(true)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            local_id,
            socket: Arc::new(socket),
            config,
            registry,
            advertiser,
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The registry this service feeds.
    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Spawn the listen loop and the sweep ticker.
    pub fn start(self: &Arc<Self>) {
        let listen = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.listen_loop().await })
        };
        let sweep = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.sweep_loop().await })
        };
        self.lock_tasks().extend([listen, sweep]);
        tracing::info!(
            "Discovery listening on {}",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );
    }

    /// Broadcast a probe; advertisers answer unicast.
    pub async fn probe(&self) -> io::Result<()> {
        let bytes = DiscoveryMessage::probe()
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket
            .send_to(&bytes, self.config.broadcast_target)
            .await?;
        tracing::debug!("Sent discovery probe to {}", self.config.broadcast_target);
        Ok(())
    }

    /// Stop the background tasks and forget every device.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.registry.clear();
        tracing::info!("Discovery stopped");
    }

    /// Process one datagram. Returns the unicast reply to send, if any.
    pub fn handle_datagram(&self, bytes: &[u8], source: SocketAddr, now: u64) -> Option<Vec<u8>> {
        let message = match DiscoveryMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping malformed datagram from {}: {}", source, e);
                return None;
            }
        };

        match message {
            DiscoveryMessage::Announce(ad) => {
                let id = ad.device_id();
                if id == self.local_id {
                    return None;
                }
                match self.registry.on_advertisement(&ad, source.ip(), now) {
                    Ok(upsert) => self.emit_upsert(&id, upsert),
                    Err(e) => tracing::warn!("Rejected advertisement from {}: {}", source, e),
                }
                None
            }
            DiscoveryMessage::Probe { service_type } => {
                if service_type != SERVICE_TYPE {
                    return None;
                }
                let ad = self.advertiser.as_ref()?.current()?;
                tracing::debug!("Answering probe from {}", source);
                DiscoveryMessage::Announce(ad).to_bytes().ok()
            }
        }
    }

    /// Sweep the registry and emit offline events.
    pub fn sweep(&self, now: u64) -> Vec<DeviceId> {
        let offline = self.registry.sweep(now);
        for id in &offline {
            tracing::info!("Device {} went offline", id);
            let _ = self.events.send(DiscoveryEvent::DeviceOffline(id.clone()));
        }
        offline
    }

    fn emit_upsert(&self, id: &DeviceId, upsert: Upsert) {
        let Some(device) = self.registry.get(id) else {
            return;
        };
        let event = match upsert {
            Upsert::Added => {
                tracing::info!("Discovered {} ({}) at {}", device.name, id, device.socket_addr());
                DiscoveryEvent::DeviceFound(device)
            }
            Upsert::CameOnline => {
                tracing::info!("Device {} is back online", id);
                DiscoveryEvent::DeviceOnline(device)
            }
            Upsert::Refreshed => return,
        };
        let _ = self.events.send(event);
    }

    async fn listen_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, source) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Discovery receive failed: {}", e);
                        continue;
                    }
                },
            };

            if let Some(reply) = self.handle_datagram(&buf[..len], source, now_millis()) {
                if let Err(e) = self.socket.send_to(&reply, source).await {
                    tracing::warn!("Probe reply to {} failed: {}", source, e);
                }
            }
        }
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(now_millis());
                }
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
