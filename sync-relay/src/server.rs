//! Signaling relay coordination.
//!
//! [`SignalRelay`] owns the join table that maps device IDs to the connection
//! currently receiving envelopes for them. It forwards envelopes best-effort
//! and at most once; nothing is stored or retried.

use crate::config::Config;
use crate::limits::RateLimits;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use sync_types::{DeviceId, ErrorMessage, RelayMessage, SignalEnvelope};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total successful joins.
    pub joins_total: AtomicU64,
    /// Signals delivered to a joined target.
    pub signals_forwarded: AtomicU64,
    /// Signals dropped (target not joined or queue full).
    pub signals_undelivered: AtomicU64,
    /// Total rate limit rejections (connection + signal + global).
    pub rate_limit_hits: AtomicU64,
    /// Total protocol errors (invalid frames, spoofing, etc.).
    pub errors_total: AtomicU64,
}

/// Where envelopes for a joined device are pushed.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    connection_id: u64,
    tx: mpsc::Sender<RelayMessage>,
}

impl DeliveryTarget {
    /// Wrap a connection's outbound queue.
    pub fn new(connection_id: u64, tx: mpsc::Sender<RelayMessage>) -> Self {
        Self { connection_id, tx }
    }

    /// Connection that owns this target.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether the owning connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Routing state of a device ID.
#[derive(Debug, Clone)]
pub enum Route {
    /// No connection receives envelopes for this ID.
    NotJoined,
    /// Envelopes go to this connection.
    Joined(DeliveryTarget),
}

/// Outcome of a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the target connection's queue.
    Delivered,
    /// Dropped; the sender is told and nothing is retried.
    Undelivered,
}

impl Delivery {
    /// True for [`Delivery::Delivered`].
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// The signaling relay.
pub struct SignalRelay {
    config: Config,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    /// One target per device ID; absent means `NotJoined`.
    joined: DashMap<DeviceId, DeliveryTarget>,
    next_connection_id: AtomicU64,
}

impl std::fmt::Debug for SignalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("joined_count", &self.joined.len())
            .finish_non_exhaustive()
    }
}

impl SignalRelay {
    /// Create a relay with the given config.
    pub fn new(config: Config) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        Self {
            config,
            rate_limits,
            metrics: RelayMetrics::default(),
            joined: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Allocate an ID for a new connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route envelopes for `device_id` to `target`.
    ///
    /// A later join for the same ID moves the target; the replaced connection
    /// is told with an `Error` and its ID is returned.
    pub fn join(&self, device_id: &DeviceId, target: DeliveryTarget) -> Option<u64> {
        let connection_id = target.connection_id;
        let previous = self.joined.insert(device_id.clone(), target);
        self.metrics.joins_total.fetch_add(1, Ordering::Relaxed);

        match previous {
            Some(old) if old.connection_id != connection_id => {
                tracing::info!(
                    "Device {} moved from connection {} to {}",
                    device_id,
                    old.connection_id,
                    connection_id
                );
                let _ = old
                    .tx
                    .try_send(RelayMessage::Error(ErrorMessage::replaced(device_id)));
                Some(old.connection_id)
            }
            _ => {
                tracing::debug!("Device {} joined on connection {}", device_id, connection_id);
                None
            }
        }
    }

    /// Stop routing `device_id` to `connection_id`.
    ///
    /// Does nothing if a newer connection has joined since, so a stale
    /// disconnect never tears down a fresh join. Returns whether an entry
    /// was removed.
    pub fn leave(&self, device_id: &DeviceId, connection_id: u64) -> bool {
        let removed = self
            .joined
            .remove_if(device_id, |_, target| target.connection_id == connection_id)
            .is_some();
        if removed {
            tracing::debug!("Device {} left (connection {})", device_id, connection_id);
        }
        removed
    }

    /// Current route for a device.
    pub fn route(&self, device_id: &DeviceId) -> Route {
        match self.joined.get(device_id) {
            Some(target) => Route::Joined(target.clone()),
            None => Route::NotJoined,
        }
    }

    /// Whether anything is joined under `device_id`.
    pub fn is_joined(&self, device_id: &DeviceId) -> bool {
        self.joined.contains_key(device_id)
    }

    /// Deliver an envelope to its recipient's joined connection.
    ///
    /// Never blocks: a full outbound queue counts as undelivered. A target
    /// whose connection has closed is dropped from the table.
    pub fn forward(&self, envelope: SignalEnvelope) -> Delivery {
        let to = envelope.to.clone();
        let target = match self.route(&to) {
            Route::Joined(target) => target,
            Route::NotJoined => {
                tracing::debug!("Undelivered signal {} -> {}: not joined", envelope.from, to);
                self.metrics.signals_undelivered.fetch_add(1, Ordering::Relaxed);
                return Delivery::Undelivered;
            }
        };

        match target.tx.try_send(RelayMessage::Signal(envelope)) {
            Ok(()) => {
                self.metrics.signals_forwarded.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Undelivered signal to {}: outbound queue full", to);
                self.metrics.signals_undelivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Undelivered
            }
            Err(TrySendError::Closed(_)) => {
                self.leave(&to, target.connection_id);
                self.metrics.signals_undelivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Undelivered
            }
        }
    }

    /// Drop targets whose connections have closed. Returns the count removed.
    pub fn prune_closed(&self) -> usize {
        let before = self.joined.len();
        self.joined.retain(|_, target| !target.is_closed());
        before.saturating_sub(self.joined.len())
    }

    /// Number of joined device IDs.
    pub fn joined_count(&self) -> usize {
        self.joined.len()
    }

    /// Open connections.
    pub fn active_connections(&self) -> u64 {
        self.metrics.connections_active.load(Ordering::Relaxed)
    }

    /// Forget every join (shutdown).
    pub fn clear(&self) {
        self.joined.clear();
    }
}
