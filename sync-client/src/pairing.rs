//! Pairing service: drives the [`PairingCoordinator`] and performs its side
//! effects.
//!
//! The coordinator decides; this service sends offers and answers through
//! the relay, opens the peer channel, persists the paired device, marks it in
//! the registry and hands the channel to the session manager.
//!
//! # Flow
//!
//! ```text
//! A: initiate(B)          ── Offer ──►  B: handle_signal → Requested
//!    shows code ABC123                  B: await_manual_entry(A)
//!                                       B: confirm_manual_code(A, "ABC123") → Paired
//! A: handle_signal → SignalExchanged ◄── Answer ──
//! A: open channel → Paired → session       B: accept_channel(A) → session
//! ```

use crate::session::{SessionError, SessionManager};
use crate::signaling::{SignalSender, SignalingError};
use crate::store::{DeviceStore, StoreError};
use crate::transport::{ChannelFactory, PeerChannel, TransportError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use sync_core::{
    DiscoveryRegistry, PairingCode, PairingConfig, PairingCoordinator, PairingError, PairingLink,
    PairingState, DEFAULT_LINK_SCHEME,
};
use sync_types::{
    now_millis, Device, DeviceId, Platform, SignalEnvelope, SignalKind, PROTOCOL_VERSION,
};
use thiserror::Error;

/// Something the user (or UI) should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// Show this code while waiting for the remote.
    CodeReady {
        /// Device being paired.
        remote: DeviceId,
        /// Code to display.
        code: PairingCode,
    },
    /// A remote device wants to pair.
    Requested {
        /// Requesting device.
        remote: DeviceId,
        /// Its display name.
        name: String,
    },
    /// A handshake moved to a new state.
    StateChanged {
        /// Device being paired.
        remote: DeviceId,
        /// New state.
        state: PairingState,
    },
    /// Pairing finished; the device is trusted.
    Paired(Device),
    /// Pairing failed.
    Failed {
        /// Device being paired.
        remote: DeviceId,
        /// What went wrong.
        reason: String,
    },
    /// The handshake idled out.
    TimedOut {
        /// Device being paired.
        remote: DeviceId,
    },
}

/// Pairing/UI sink.
pub trait Notifier: Send + Sync {
    /// Deliver one event. Must not block.
    fn notify(&self, event: PairingEvent);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: PairingEvent) {
        match &event {
            PairingEvent::CodeReady { remote, code } => {
                tracing::info!("Pairing code for {}: {}", remote, code)
            }
            PairingEvent::Requested { remote, name } => {
                tracing::info!("Pairing requested by {} ({})", name, remote)
            }
            PairingEvent::StateChanged { remote, state } => {
                tracing::debug!("Pairing with {} is now {}", remote, state)
            }
            PairingEvent::Paired(device) => {
                tracing::info!("Paired with {} ({})", device.name, device.id)
            }
            PairingEvent::Failed { remote, reason } => {
                tracing::warn!("Pairing with {} failed: {}", remote, reason)
            }
            PairingEvent::TimedOut { remote } => tracing::warn!("Pairing with {} timed out", remote),
        }
    }
}

/// Pairing service errors.
#[derive(Debug, Error)]
pub enum PairingServiceError {
    /// Handshake rule violated.
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// Offer/answer could not be sent.
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    /// Peer channel could not be opened.
    #[error("channel failed: {0}")]
    Transport(#[from] TransportError),

    /// Device store failed.
    #[error("device store failed: {0}")]
    Store(#[from] StoreError),

    /// Session manager failed.
    #[error("session failed: {0}")]
    Session(#[from] SessionError),

    /// Channel offered by a device we have not paired with.
    #[error("device {0} is not paired")]
    NotPaired(DeviceId),
}

/// Collaborators the pairing service drives.
pub struct PairingDeps {
    /// Relay client (or [`crate::NoRelay`]).
    pub signals: Arc<dyn SignalSender>,
    /// Opens peer channels.
    pub channels: Arc<dyn ChannelFactory>,
    /// Paired device persistence.
    pub store: Arc<dyn DeviceStore>,
    /// Discovery registry.
    pub registry: Arc<DiscoveryRegistry>,
    /// Session manager that receives finished channels.
    pub sessions: SessionManager,
    /// Event sink.
    pub notifier: Arc<dyn Notifier>,
}

/// Runs pairing handshakes for this device.
pub struct PairingService {
    local_id: DeviceId,
    local_name: String,
    link_scheme: String,
    coordinator: Mutex<PairingCoordinator>,
    // Names announced in offers, for devices we have not discovered
    offered_names: Mutex<HashMap<DeviceId, String>>,
    deps: PairingDeps,
}

impl PairingService {
    /// Create the service.
    pub fn new(
        local_id: DeviceId,
        local_name: impl Into<String>,
        config: PairingConfig,
        deps: PairingDeps,
    ) -> Self {
        Self {
            coordinator: Mutex::new(PairingCoordinator::new(local_id.clone(), config)),
            local_id,
            local_name: local_name.into(),
            link_scheme: DEFAULT_LINK_SCHEME.to_string(),
            offered_names: Mutex::new(HashMap::new()),
            deps,
        }
    }

    /// Use a custom deep link scheme.
    pub fn with_link_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.link_scheme = scheme.into();
        self
    }

    /// Deep link other devices can scan to pair with us.
    pub fn pairing_link(&self) -> String {
        PairingLink::new(self.local_id.clone(), self.local_name.clone()).to_uri(&self.link_scheme)
    }

    /// Current state of the handshake with `remote`.
    pub fn state(&self, remote: &DeviceId) -> PairingState {
        self.coordinator().state(remote)
    }

    /// The code for the handshake with `remote`.
    pub fn present_code(&self, remote: &DeviceId) -> Option<PairingCode> {
        self.coordinator().present_code(remote).cloned()
    }

    /// Show our code and send an offer to `remote`.
    pub async fn initiate(&self, remote: &DeviceId) -> Result<PairingCode, PairingServiceError> {
        let code = self.coordinator().initiate(remote, now_millis())?.code.clone();
        self.notify(PairingEvent::CodeReady {
            remote: remote.clone(),
            code: code.clone(),
        });
        self.state_changed(remote, PairingState::AwaitingRemoteSignal);

        let offer = SignalEnvelope::new(
            self.local_id.clone(),
            remote.clone(),
            SignalKind::Offer,
            self.local_name.as_bytes().to_vec(),
        );
        if let Err(e) = self.deps.signals.send_signal(offer).await {
            self.abandon(remote, &e.to_string());
            return Err(e.into());
        }

        tracing::info!("Pairing offer sent to {}", remote);
        Ok(code)
    }

    /// Prepare to type `remote`'s code.
    pub fn await_manual_entry(&self, remote: &DeviceId) -> Result<(), PairingServiceError> {
        self.coordinator().await_manual_entry(remote, now_millis())?;
        self.state_changed(remote, PairingState::AwaitingManualEntry);
        Ok(())
    }

    /// Check a typed code. On success the device is stored and an answer sent.
    pub async fn confirm_manual_code(
        &self,
        remote: &DeviceId,
        entered: &str,
    ) -> Result<PairingState, PairingServiceError> {
        let result = self
            .coordinator()
            .confirm_manual_code(remote, entered, now_millis());

        match result {
            Ok(state) => {
                self.state_changed(remote, state);
                self.complete(remote).await?;

                let answer = SignalEnvelope::new(
                    self.local_id.clone(),
                    remote.clone(),
                    SignalKind::Answer,
                    self.local_name.as_bytes().to_vec(),
                );
                if let Err(e) = self.deps.signals.send_signal(answer).await {
                    // Paired here; the remote retries from its side
                    tracing::warn!("Answer to {} not delivered: {}", remote, e);
                }
                Ok(state)
            }
            Err(PairingError::MaxRetriesExceeded) => {
                self.state_changed(remote, PairingState::Cancelled);
                self.notify(PairingEvent::Failed {
                    remote: remote.clone(),
                    reason: PairingError::MaxRetriesExceeded.to_string(),
                });
                Err(PairingError::MaxRetriesExceeded.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pair by scanning `remote`'s deep link.
    pub async fn pair_with_link(&self, uri: &str) -> Result<PairingState, PairingServiceError> {
        let link = PairingLink::parse(uri)?;
        let code = link.code()?;
        self.remember_name(&link.device_id, &link.device_name);
        self.await_manual_entry(&link.device_id)?;
        self.confirm_manual_code(&link.device_id, code.as_str()).await
    }

    /// Handle an envelope that arrived through the relay.
    pub async fn handle_signal(
        &self,
        envelope: SignalEnvelope,
    ) -> Result<PairingState, PairingServiceError> {
        let remote = envelope.from.clone();
        let before = self.state(&remote);

        match before {
            PairingState::AwaitingRemoteSignal | PairingState::SignalExchanged => {
                let state = self
                    .coordinator()
                    .submit_remote_signal(&envelope, now_millis())?;
                if envelope.kind != SignalKind::Candidate {
                    self.remember_name(&remote, &String::from_utf8_lossy(&envelope.data));
                }
                if before == PairingState::SignalExchanged {
                    return Ok(state);
                }
                self.state_changed(&remote, state);
                self.establish_channel(&remote).await
            }
            _ if envelope.kind == SignalKind::Offer => {
                if envelope.to != self.local_id {
                    return Err(PairingError::WrongRecipient {
                        expected: self.local_id.clone(),
                        actual: envelope.to,
                    }
                    .into());
                }
                let name = String::from_utf8_lossy(&envelope.data).into_owned();
                self.remember_name(&remote, &name);
                self.notify(PairingEvent::Requested {
                    remote: remote.clone(),
                    name,
                });
                Ok(before)
            }
            state => {
                tracing::debug!(
                    "Ignoring {:?} from {} while pairing is {}",
                    envelope.kind,
                    remote,
                    state
                );
                Ok(state)
            }
        }
    }

    /// Attach an inbound channel from `remote`. Only paired devices are accepted.
    pub async fn accept_channel(
        &self,
        remote: DeviceId,
        channel: Arc<dyn PeerChannel>,
    ) -> Result<(), PairingServiceError> {
        let paired = self.deps.store.get(&remote).await?.is_some()
            || self.deps.registry.get(&remote).is_some_and(|d| d.paired);
        if !paired {
            tracing::warn!("Rejecting channel from unpaired device {}", remote);
            let _ = channel.close().await;
            return Err(PairingServiceError::NotPaired(remote));
        }

        // Late confirmation for a handshake still waiting on its channel
        if self.state(&remote) == PairingState::SignalExchanged {
            self.coordinator().channel_established(&remote, now_millis())?;
            self.state_changed(&remote, PairingState::Paired);
        }

        self.deps.sessions.open_session(remote, channel).await;
        Ok(())
    }

    /// Cancel the handshake with `remote`.
    pub fn cancel(&self, remote: &DeviceId) -> Result<(), PairingServiceError> {
        let state = self.coordinator().cancel(remote, now_millis())?;
        self.state_changed(remote, state);
        Ok(())
    }

    /// Time out idle handshakes. Returns the remotes that timed out.
    pub fn tick_timeouts(&self, now: u64) -> Vec<DeviceId> {
        let expired = self.coordinator().timeout(now);
        expired
            .into_iter()
            .map(|request| {
                let remote = request.remote_device_id;
                self.notify(PairingEvent::TimedOut {
                    remote: remote.clone(),
                });
                remote
            })
            .collect()
    }

    /// Forget `remote`: store, registry, session and any handshake.
    pub async fn unpair(&self, remote: &DeviceId) -> Result<bool, PairingServiceError> {
        let stored = self.deps.store.remove(remote).await?;
        let known = self.deps.registry.remove(remote).is_some();
        match self.deps.sessions.close_session(remote).await {
            Ok(()) | Err(SessionError::NoSession(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.coordinator().dismiss(remote);
        self.offered_names().remove(remote);

        tracing::info!("Unpaired {}", remote);
        Ok(stored || known)
    }

    async fn establish_channel(&self, remote: &DeviceId) -> Result<PairingState, PairingServiceError> {
        let channel = match self.deps.channels.open(remote).await {
            Ok(channel) => channel,
            Err(e) => {
                self.abandon(remote, &e.to_string());
                return Err(e.into());
            }
        };

        let state = self
            .coordinator()
            .channel_established(remote, now_millis())?;
        self.state_changed(remote, state);
        self.complete(remote).await?;
        self.deps.sessions.open_session(remote.clone(), channel).await;
        Ok(state)
    }

    /// Persist and register a freshly paired device.
    async fn complete(&self, remote: &DeviceId) -> Result<(), PairingServiceError> {
        let mut device = self.device_record(remote);
        device.paired = true;
        self.deps.store.save(&device).await?;
        self.deps.registry.mark_paired(device.clone());
        self.notify(PairingEvent::Paired(device));
        Ok(())
    }

    fn device_record(&self, remote: &DeviceId) -> Device {
        if let Some(device) = self.deps.registry.get(remote) {
            return device;
        }
        let name = self
            .offered_names()
            .get(remote)
            .cloned()
            .unwrap_or_else(|| remote.to_string());
        Device {
            id: remote.clone(),
            name,
            platform: Platform::Unknown,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            protocol_version: PROTOCOL_VERSION,
            last_seen: now_millis(),
            is_online: false,
            paired: true,
        }
    }

    fn abandon(&self, remote: &DeviceId, reason: &str) {
        if self.coordinator().cancel(remote, now_millis()).is_ok() {
            self.state_changed(remote, PairingState::Cancelled);
        }
        self.notify(PairingEvent::Failed {
            remote: remote.clone(),
            reason: reason.to_string(),
        });
    }

    fn remember_name(&self, remote: &DeviceId, name: &str) {
        if !name.is_empty() {
            self.offered_names().insert(remote.clone(), name.to_string());
        }
    }

    fn state_changed(&self, remote: &DeviceId, state: PairingState) {
        self.notify(PairingEvent::StateChanged {
            remote: remote.clone(),
            state,
        });
    }

    fn notify(&self, event: PairingEvent) {
        self.deps.notifier.notify(event);
    }

    fn coordinator(&self) -> MutexGuard<'_, PairingCoordinator> {
        self.coordinator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn offered_names(&self) -> MutexGuard<'_, HashMap<DeviceId, String>> {
        self.offered_names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
