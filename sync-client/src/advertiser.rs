//! Presence broadcaster.
//!
//! Periodically sends this device's [`Advertisement`] to the discovery
//! broadcast address. The running task reads the descriptor from a watch
//! channel, so re-advertising with a new name or port updates it in place
//! instead of starting a second broadcaster.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_types::{Advertisement, DeviceId, DiscoveryMessage, Platform};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default gap between broadcasts.
pub const DEFAULT_ADVERTISE_INTERVAL: Duration = Duration::from_secs(3);

/// Broadcasts this device's descriptor while advertising is on.
pub struct Advertiser {
    device_id: DeviceId,
    platform: Platform,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    interval: Duration,
    descriptor: watch::Sender<Option<Advertisement>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Advertiser {
    /// Bind an ephemeral broadcast-capable socket.
    ///
    /// `target` is usually `255.255.255.255:<discovery port>`.
    pub async fn bind(
        device_id: DeviceId,
        platform: Platform,
        target: SocketAddr,
        interval: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        let (descriptor, _) = watch::channel(None);

        Ok(Self {
            device_id,
            platform,
            socket: Arc::new(socket),
            target,
            interval,
            descriptor,
            task: Mutex::new(None),
        })
    }

    /// Start (or update) the advertisement.
    ///
    /// Idempotent: while already advertising, only the descriptor changes and
    /// the running task broadcasts it straight away.
    pub fn start_advertising(&self, name: &str, port: u16) {
        let ad = Advertisement::new(&self.device_id, name, self.platform, port);
        self.descriptor.send_replace(Some(ad));

        let mut task = self.lock_task();
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            tracing::debug!("Advertisement updated: name={} port={}", name, port);
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(broadcast_loop(
            Arc::clone(&self.socket),
            self.target,
            self.interval,
            self.descriptor.subscribe(),
            token.clone(),
        ));
        *task = Some((token, handle));
        tracing::info!(
            "Advertising {} as {:?} on port {} every {:?}",
            self.device_id,
            name,
            port,
            self.interval
        );
    }

    /// Stop broadcasting. Listeners notice after their offline timeout.
    pub fn stop_advertising(&self) {
        self.descriptor.send_replace(None);
        if let Some((token, _)) = self.lock_task().take() {
            token.cancel();
            tracing::info!("Stopped advertising");
        }
    }

    /// Descriptor currently advertised, if any.
    pub fn current(&self) -> Option<Advertisement> {
        self.descriptor.borrow().clone()
    }

    /// Whether a broadcast task is running.
    pub fn is_advertising(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        if let Some((token, _)) = self.lock_task().take() {
            token.cancel();
        }
    }
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    interval: Duration,
    mut descriptor: watch::Receiver<Option<Advertisement>>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            changed = descriptor.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(ad) = descriptor.borrow_and_update().clone() else {
            continue;
        };
        let bytes = match DiscoveryMessage::Announce(ad).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode advertisement: {}", e);
                continue;
            }
        };
        if let Err(e) = socket.send_to(&bytes, target).await {
            tracing::warn!("Advertisement broadcast to {} failed: {}", target, e);
        }
    }
}
