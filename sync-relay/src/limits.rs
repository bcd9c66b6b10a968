//! Rate limiting for sync-relay.
//!
//! Provides protection against connection flooding and signal spam.
//!
//! ## Design Notes
//!
//! Connections are limited per source IP before any frame is read. Signals
//! are limited per joined [`DeviceId`] and by a global limiter that caps
//! aggregate forwarding regardless of individual quotas.
//!
//! Keyed limiters use the governor crate's DashMap-backed state store.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use sync_types::DeviceId;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per source IP.
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,

    /// Limits forwarded signals per joined device.
    signal_limiter: Arc<KeyedLimiter<DeviceId>>,

    /// Global forward limiter across all devices.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("signal_limiter", &"KeyedLimiter<DeviceId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

/// Zero would make governor reject every request; validated configs never
/// contain it, so clamp rather than panic.
fn nonzero(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(nonzero(config.connections_per_ip));
        let signal_quota = Quota::per_minute(nonzero(config.signals_per_minute));
        let global_quota = Quota::per_second(nonzero(config.global_signals_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            signal_limiter: Arc::new(RateLimiter::keyed(signal_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt from `ip` is allowed.
    pub fn check_connection(&self, ip: &IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if `device_id` may forward another signal.
    ///
    /// The global limiter is consulted first.
    pub fn check_signal(&self, device_id: &DeviceId) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        self.signal_limiter
            .check_key(device_id)
            .map_err(|_| RateLimitError::SignalLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked signal keys (for metrics).
    pub fn signal_keys_count(&self) -> usize {
        self.signal_limiter.len()
    }

    /// Evict stale entries from the keyed rate limiters.
    ///
    /// `retain_recent()` removes entries whose cells have fully recharged
    /// (idle clients). Called periodically from the maintenance task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.signal_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this IP.
    ConnectionLimitExceeded,
    /// Too many signals from this device.
    SignalLimitExceeded,
    /// Global forward rate exceeded across all devices.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => {
                write!(f, "connection rate limit exceeded")
            }
            Self::SignalLimitExceeded => {
                write!(f, "signal rate limit exceeded")
            }
            Self::GlobalLimitExceeded => {
                write!(f, "global rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
