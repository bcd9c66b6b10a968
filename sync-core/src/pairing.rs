//! Device pairing for syncstuff.
//!
//! This module provides:
//! - Pairing codes derived from device IDs (first 6 hex characters, uppercased)
//! - Pairing deep links (`scheme://pair?id=<deviceId>&name=<deviceName>`)
//! - The [`PairingCoordinator`] state machine
//!
//! Two flows reach `Paired`:
//!
//! ```text
//! Idle ─initiate──────────► AwaitingRemoteSignal ─signal─► SignalExchanged ─channel─► Paired
//! Idle ─await_manual_entry► AwaitingManualEntry ─code ok──────────────────────────► Paired
//! ```
//!
//! `Cancelled` and `TimedOut` are reachable from every non-terminal state.
//! The coordinator performs no I/O; `sync-client` sends signals, opens the
//! channel and persists the paired device.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;
use sync_types::{DeviceId, SignalEnvelope};
use thiserror::Error;

/// Number of characters in a pairing code.
pub const CODE_LEN: usize = 6;

/// Default manual-entry attempts before a request is cancelled.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default idle window before a request times out.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deep link scheme.
pub const DEFAULT_LINK_SCHEME: &str = "syncstuff";

/// Error type for pairing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The device ID has fewer than six hex characters.
    #[error("device id {0:?} cannot produce a pairing code")]
    InvalidDeviceId(String),
    /// Attempted to pair with ourselves.
    #[error("cannot pair a device with itself")]
    SelfPairing,
    /// No request exists for this remote device.
    #[error("no pairing request for {0}")]
    NoPendingRequest(DeviceId),
    /// The request is not in a state that accepts this input.
    #[error("pairing request is {state}, not {expected}")]
    InvalidState {
        /// Current state.
        state: PairingState,
        /// State the operation requires.
        expected: PairingState,
    },
    /// Envelope addressed to a different device.
    #[error("signal addressed to {actual}, expected {expected}")]
    WrongRecipient {
        /// Our device ID.
        expected: DeviceId,
        /// Envelope's `to`.
        actual: DeviceId,
    },
    /// Entered code did not match.
    #[error("pairing code mismatch ({remaining} attempts left)")]
    CodeMismatch {
        /// Attempts left before cancellation.
        remaining: u32,
    },
    /// Too many wrong codes; the request is now cancelled.
    #[error("too many wrong pairing codes, request cancelled")]
    MaxRetriesExceeded,
    /// The deep link could not be parsed.
    #[error("invalid pairing link: {0}")]
    InvalidLink(String),
}

/// A short human-verifiable code shown on one device and typed on the other.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    /// Derive the code for a device ID.
    ///
    /// Takes the first six ASCII hex digits of the ID and uppercases them.
    /// The same ID always yields the same code.
    pub fn derive(device_id: &DeviceId) -> Result<Self, PairingError> {
        let code: String = device_id
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .take(CODE_LEN)
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if code.len() != CODE_LEN {
            return Err(PairingError::InvalidDeviceId(device_id.to_string()));
        }
        Ok(Self(code))
    }

    /// The code as displayed.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against user input in constant time.
    ///
    /// Input is trimmed and uppercased first, so `" abc123"` matches `ABC123`.
    pub fn matches(&self, entered: &str) -> bool {
        let normalized = entered.trim().to_ascii_uppercase();
        self.0.as_bytes().ct_eq(normalized.as_bytes()).into()
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingCode({})", self.0)
    }
}

/// Deep link encoded into QR codes: `scheme://pair?id=<id>&name=<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingLink {
    /// Device to pair with.
    pub device_id: DeviceId,
    /// Its display name.
    pub device_name: String,
}

impl PairingLink {
    /// Create a link for a device.
    pub fn new(device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
        }
    }

    /// Format as a URI under the given scheme.
    pub fn to_uri(&self, scheme: &str) -> String {
        format!(
            "{}://pair?id={}&name={}",
            scheme,
            urlencoding::encode(self.device_id.as_str()),
            urlencoding::encode(&self.device_name)
        )
    }

    /// Parse a pairing URI. Any scheme is accepted; the host must be `pair`.
    pub fn parse(uri: &str) -> Result<Self, PairingError> {
        let (_, rest) = uri
            .split_once("://")
            .ok_or_else(|| PairingError::InvalidLink("missing scheme".into()))?;
        let (host, query) = rest
            .split_once('?')
            .ok_or_else(|| PairingError::InvalidLink("missing query".into()))?;
        if host.trim_end_matches('/') != "pair" {
            return Err(PairingError::InvalidLink(format!("unexpected host {:?}", host)));
        }

        let mut id = None;
        let mut name = None;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decoded = urlencoding::decode(value)
                .map_err(|e| PairingError::InvalidLink(e.to_string()))?
                .into_owned();
            match key {
                "id" => id = Some(decoded),
                "name" => name = Some(decoded),
                _ => {}
            }
        }

        let id = id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PairingError::InvalidLink("missing id".into()))?;
        Ok(Self {
            device_id: DeviceId::new(id),
            device_name: name.unwrap_or_default(),
        })
    }

    /// The manual code for the linked device.
    pub fn code(&self) -> Result<PairingCode, PairingError> {
        PairingCode::derive(&self.device_id)
    }
}

/// Pairing handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingState {
    /// No handshake in progress.
    Idle,
    /// Code shown; waiting for the remote's signal.
    AwaitingRemoteSignal,
    /// Waiting for the user to type the remote's code.
    AwaitingManualEntry,
    /// Signals exchanged; channel under construction.
    SignalExchanged,
    /// Trusted peer.
    Paired,
    /// Cancelled by the user or by too many wrong codes.
    Cancelled,
    /// Idle longer than the pairing window.
    TimedOut,
}

impl PairingState {
    /// Whether the handshake has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Paired | PairingState::Cancelled | PairingState::TimedOut
        )
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One in-flight pairing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    /// This device.
    pub local_device_id: DeviceId,
    /// Device being paired.
    pub remote_device_id: DeviceId,
    /// Code both sides display/compare.
    pub code: PairingCode,
    /// Current state.
    pub state: PairingState,
    /// Wrong manual entries so far.
    pub retries: u32,
    /// Unix millis of the last transition.
    pub last_activity: u64,
}

/// Coordinator tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingConfig {
    /// Wrong codes allowed before cancellation.
    pub max_retries: u32,
    /// Idle window before timeout.
    pub timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_PAIRING_TIMEOUT,
        }
    }
}

/// Drives pairing handshakes for this device, one request per remote.
///
/// Finished requests (`Paired`, `Cancelled`) remain visible for one timeout
/// window, so late input is rejected against a stable terminal state. They
/// go away on [`PairingCoordinator::dismiss`], a new handshake with the same
/// remote, or the first [`PairingCoordinator::timeout`] after the window.
/// Timed-out live requests are removed by `timeout` and returned.
#[derive(Debug)]
pub struct PairingCoordinator {
    local_device_id: DeviceId,
    config: PairingConfig,
    requests: HashMap<DeviceId, PairingRequest>,
}

impl PairingCoordinator {
    /// Create a coordinator for the local device.
    pub fn new(local_device_id: DeviceId, config: PairingConfig) -> Self {
        Self {
            local_device_id,
            config,
            requests: HashMap::new(),
        }
    }

    /// This device's ID.
    pub fn local_device_id(&self) -> &DeviceId {
        &self.local_device_id
    }

    /// Start a signal-based handshake with `remote`.
    ///
    /// The code is derived from the local ID, since this side displays it.
    pub fn initiate(&mut self, remote: &DeviceId, now: u64) -> Result<&PairingRequest, PairingError> {
        let code = PairingCode::derive(&self.local_device_id)?;
        self.start(remote, code, PairingState::AwaitingRemoteSignal, now)
    }

    /// Start a manual-entry handshake: the user will type `remote`'s code.
    pub fn await_manual_entry(
        &mut self,
        remote: &DeviceId,
        now: u64,
    ) -> Result<&PairingRequest, PairingError> {
        let code = PairingCode::derive(remote)?;
        self.start(remote, code, PairingState::AwaitingManualEntry, now)
    }

    fn start(
        &mut self,
        remote: &DeviceId,
        code: PairingCode,
        state: PairingState,
        now: u64,
    ) -> Result<&PairingRequest, PairingError> {
        if *remote == self.local_device_id {
            return Err(PairingError::SelfPairing);
        }
        let request = PairingRequest {
            local_device_id: self.local_device_id.clone(),
            remote_device_id: remote.clone(),
            code,
            state,
            retries: 0,
            last_activity: now,
        };
        self.requests.insert(remote.clone(), request);
        Ok(&self.requests[remote])
    }

    /// The code for display. Pure accessor.
    pub fn present_code(&self, remote: &DeviceId) -> Option<&PairingCode> {
        self.requests.get(remote).map(|r| &r.code)
    }

    /// Current state of the handshake with `remote` (`Idle` if none).
    pub fn state(&self, remote: &DeviceId) -> PairingState {
        self.requests
            .get(remote)
            .map(|r| r.state)
            .unwrap_or(PairingState::Idle)
    }

    /// The request for `remote`, if any.
    pub fn request(&self, remote: &DeviceId) -> Option<&PairingRequest> {
        self.requests.get(remote)
    }

    /// Accept the remote's offer/answer/candidate.
    ///
    /// `AwaitingRemoteSignal` advances to `SignalExchanged`; additional
    /// signals while `SignalExchanged` are accepted without a transition.
    /// The caller builds the peer channel after this returns.
    pub fn submit_remote_signal(
        &mut self,
        envelope: &SignalEnvelope,
        now: u64,
    ) -> Result<PairingState, PairingError> {
        if envelope.to != self.local_device_id {
            return Err(PairingError::WrongRecipient {
                expected: self.local_device_id.clone(),
                actual: envelope.to.clone(),
            });
        }
        let request = self
            .requests
            .get_mut(&envelope.from)
            .ok_or_else(|| PairingError::NoPendingRequest(envelope.from.clone()))?;

        match request.state {
            PairingState::AwaitingRemoteSignal | PairingState::SignalExchanged => {
                request.state = PairingState::SignalExchanged;
                request.last_activity = now;
                Ok(request.state)
            }
            state => Err(PairingError::InvalidState {
                state,
                expected: PairingState::AwaitingRemoteSignal,
            }),
        }
    }

    /// The peer channel for a `SignalExchanged` request is open.
    pub fn channel_established(
        &mut self,
        remote: &DeviceId,
        now: u64,
    ) -> Result<PairingState, PairingError> {
        let request = self.request_mut(remote)?;
        if request.state != PairingState::SignalExchanged {
            return Err(PairingError::InvalidState {
                state: request.state,
                expected: PairingState::SignalExchanged,
            });
        }
        request.state = PairingState::Paired;
        request.last_activity = now;
        Ok(PairingState::Paired)
    }

    /// Check a manually entered code.
    ///
    /// A match transitions to `Paired`. A mismatch keeps the request in
    /// `AwaitingManualEntry` until `max_retries` wrong entries, after which it
    /// is `Cancelled`. Input against any other state is rejected unchanged.
    pub fn confirm_manual_code(
        &mut self,
        remote: &DeviceId,
        entered: &str,
        now: u64,
    ) -> Result<PairingState, PairingError> {
        let max_retries = self.config.max_retries;
        let request = self.request_mut(remote)?;
        if request.state != PairingState::AwaitingManualEntry {
            return Err(PairingError::InvalidState {
                state: request.state,
                expected: PairingState::AwaitingManualEntry,
            });
        }

        request.last_activity = now;
        if request.code.matches(entered) {
            request.state = PairingState::Paired;
            return Ok(PairingState::Paired);
        }

        request.retries += 1;
        if request.retries >= max_retries {
            request.state = PairingState::Cancelled;
            return Err(PairingError::MaxRetriesExceeded);
        }
        Err(PairingError::CodeMismatch {
            remaining: max_retries - request.retries,
        })
    }

    /// Cancel a non-terminal handshake.
    pub fn cancel(&mut self, remote: &DeviceId, now: u64) -> Result<PairingState, PairingError> {
        let request = self.request_mut(remote)?;
        if request.state.is_terminal() {
            return Err(PairingError::InvalidState {
                state: request.state,
                expected: PairingState::Cancelled,
            });
        }
        request.state = PairingState::Cancelled;
        request.last_activity = now;
        Ok(PairingState::Cancelled)
    }

    /// Time out idle handshakes.
    ///
    /// Every non-terminal request idle for longer than the window moves to
    /// `TimedOut`, is removed, and is returned to the caller. Finished
    /// requests idle for longer than the window are dropped silently.
    pub fn timeout(&mut self, now: u64) -> Vec<PairingRequest> {
        let window = self.config.timeout.as_millis() as u64;
        let idle = |r: &PairingRequest| now.saturating_sub(r.last_activity) > window;

        self.requests
            .retain(|_, r| !(r.state.is_terminal() && idle(r)));

        let expired: Vec<DeviceId> = self
            .requests
            .values()
            .filter(|r| idle(r))
            .map(|r| r.remote_device_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .map(|mut request| {
                request.state = PairingState::TimedOut;
                request
            })
            .collect()
    }

    /// Forget the request for `remote`.
    pub fn dismiss(&mut self, remote: &DeviceId) -> Option<PairingRequest> {
        self.requests.remove(remote)
    }

    /// Number of tracked requests (any state).
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if no requests are tracked.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn request_mut(&mut self, remote: &DeviceId) -> Result<&mut PairingRequest, PairingError> {
        self.requests
            .get_mut(remote)
            .ok_or_else(|| PairingError::NoPendingRequest(remote.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::SignalKind;

    const T0: u64 = 1_700_000_000_000;

    fn a() -> DeviceId {
        DeviceId::new("abc123")
    }

    fn b() -> DeviceId {
        DeviceId::new("def456789")
    }

    fn coordinator(local: DeviceId) -> PairingCoordinator {
        PairingCoordinator::new(local, PairingConfig::default())
    }

    fn answer(from: DeviceId, to: DeviceId) -> SignalEnvelope {
        SignalEnvelope::new(from, to, SignalKind::Answer, b"sdp".to_vec())
    }

    #[test]
    fn code_is_first_six_hex_uppercased() {
        let code = PairingCode::derive(&DeviceId::new("abc123ff")).unwrap();
        assert_eq!(code.as_str(), "ABC123");
    }

    #[test]
    fn code_derivation_is_deterministic() {
        let id = DeviceId::generate();
        assert_eq!(
            PairingCode::derive(&id).unwrap(),
            PairingCode::derive(&id).unwrap()
        );
    }

    #[test]
    fn code_skips_non_hex_characters() {
        let code = PairingCode::derive(&DeviceId::new("ab-cd-ef-01")).unwrap();
        assert_eq!(code.as_str(), "ABCDEF");
    }

    #[test]
    fn short_ids_cannot_produce_a_code() {
        assert!(matches!(
            PairingCode::derive(&DeviceId::new("xyz12")),
            Err(PairingError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn code_match_normalizes_input() {
        let code = PairingCode::derive(&a()).unwrap();
        assert!(code.matches("ABC123"));
        assert!(code.matches(" abc123\n"));
        assert!(!code.matches("ABC124"));
        assert!(!code.matches("ABC12"));
        assert!(!code.matches(""));
    }

    #[test]
    fn deep_link_roundtrip_encodes_name() {
        let link = PairingLink::new(a(), "Jo's Pixel & Co");
        let uri = link.to_uri(DEFAULT_LINK_SCHEME);
        assert_eq!(uri, "syncstuff://pair?id=abc123&name=Jo%27s%20Pixel%20%26%20Co");

        let parsed = PairingLink::parse(&uri).unwrap();
        assert_eq!(parsed, link);
        assert_eq!(parsed.code().unwrap().as_str(), "ABC123");
    }

    #[test]
    fn deep_link_rejects_garbage() {
        assert!(PairingLink::parse("not a link").is_err());
        assert!(PairingLink::parse("syncstuff://unpair?id=abc123").is_err());
        assert!(PairingLink::parse("syncstuff://pair?name=x").is_err());
        assert!(PairingLink::parse("syncstuff://pair?id=&name=x").is_err());
    }

    #[test]
    fn initiate_awaits_remote_signal_with_local_code() {
        let mut coord = coordinator(a());
        let request = coord.initiate(&b(), T0).unwrap();
        assert_eq!(request.state, PairingState::AwaitingRemoteSignal);
        assert_eq!(request.code.as_str(), "ABC123");
        assert_eq!(coord.present_code(&b()).unwrap().as_str(), "ABC123");
    }

    #[test]
    fn cannot_pair_with_self() {
        let mut coord = coordinator(a());
        assert_eq!(coord.initiate(&a(), T0).unwrap_err(), PairingError::SelfPairing);
    }

    #[test]
    fn signal_flow_reaches_paired() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();

        let state = coord.submit_remote_signal(&answer(b(), a()), T0 + 1).unwrap();
        assert_eq!(state, PairingState::SignalExchanged);

        // Trailing candidates are accepted without a transition.
        let candidate = SignalEnvelope::new(b(), a(), SignalKind::Candidate, vec![]);
        assert_eq!(
            coord.submit_remote_signal(&candidate, T0 + 2).unwrap(),
            PairingState::SignalExchanged
        );

        assert_eq!(
            coord.channel_established(&b(), T0 + 3).unwrap(),
            PairingState::Paired
        );
        assert_eq!(coord.state(&b()), PairingState::Paired);
    }

    #[test]
    fn signal_for_other_device_is_rejected() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();

        let misrouted = answer(b(), DeviceId::new("cafe00"));
        assert!(matches!(
            coord.submit_remote_signal(&misrouted, T0),
            Err(PairingError::WrongRecipient { .. })
        ));
        assert_eq!(coord.state(&b()), PairingState::AwaitingRemoteSignal);
    }

    #[test]
    fn signal_without_request_is_rejected() {
        let mut coord = coordinator(a());
        assert!(matches!(
            coord.submit_remote_signal(&answer(b(), a()), T0),
            Err(PairingError::NoPendingRequest(_))
        ));
    }

    #[test]
    fn channel_before_signal_is_rejected() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();
        assert!(coord.channel_established(&b(), T0).is_err());
        assert_eq!(coord.state(&b()), PairingState::AwaitingRemoteSignal);
    }

    #[test]
    fn both_sides_pair_with_shared_code() {
        // A shows its code; B types it.
        let mut side_a = coordinator(a());
        let mut side_b = coordinator(b());

        side_a.initiate(&b(), T0).unwrap();
        side_b.await_manual_entry(&a(), T0).unwrap();
        assert_eq!(
            side_a.present_code(&b()).unwrap(),
            side_b.present_code(&a()).unwrap()
        );

        assert_eq!(
            side_b.confirm_manual_code(&a(), "ABC123", T0 + 1).unwrap(),
            PairingState::Paired
        );

        // B's answer reaches A, A opens the channel.
        side_a.submit_remote_signal(&answer(b(), a()), T0 + 2).unwrap();
        side_a.channel_established(&b(), T0 + 3).unwrap();

        assert_eq!(side_a.state(&b()), PairingState::Paired);
        assert_eq!(side_b.state(&a()), PairingState::Paired);
    }

    #[test]
    fn wrong_code_keeps_waiting_and_counts() {
        let mut coord = coordinator(b());
        coord.await_manual_entry(&a(), T0).unwrap();

        assert_eq!(
            coord.confirm_manual_code(&a(), "000000", T0),
            Err(PairingError::CodeMismatch { remaining: 4 })
        );
        let request = coord.request(&a()).unwrap();
        assert_eq!(request.state, PairingState::AwaitingManualEntry);
        assert_eq!(request.retries, 1);
    }

    #[test]
    fn five_wrong_codes_cancel_and_sixth_is_rejected() {
        let mut coord = coordinator(b());
        coord.await_manual_entry(&a(), T0).unwrap();

        for attempt in 1..=4 {
            assert!(matches!(
                coord.confirm_manual_code(&a(), "FFFFFF", T0 + attempt),
                Err(PairingError::CodeMismatch { .. })
            ));
        }
        assert_eq!(
            coord.confirm_manual_code(&a(), "FFFFFF", T0 + 5),
            Err(PairingError::MaxRetriesExceeded)
        );
        assert_eq!(coord.state(&a()), PairingState::Cancelled);

        let before = coord.request(&a()).cloned().unwrap();
        // Even the correct code is rejected once cancelled.
        assert!(matches!(
            coord.confirm_manual_code(&a(), "ABC123", T0 + 6),
            Err(PairingError::InvalidState {
                state: PairingState::Cancelled,
                ..
            })
        ));
        assert_eq!(coord.request(&a()).unwrap(), &before);
    }

    #[test]
    fn max_retries_is_configurable() {
        let mut coord = PairingCoordinator::new(
            b(),
            PairingConfig {
                max_retries: 2,
                ..PairingConfig::default()
            },
        );
        coord.await_manual_entry(&a(), T0).unwrap();
        assert!(coord.confirm_manual_code(&a(), "x", T0).is_err());
        assert_eq!(
            coord.confirm_manual_code(&a(), "x", T0),
            Err(PairingError::MaxRetriesExceeded)
        );
    }

    #[test]
    fn idle_requests_time_out_and_are_removed() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();
        coord.await_manual_entry(&DeviceId::new("cafe00"), T0 + 50_000).unwrap();

        assert!(coord.timeout(T0 + 60_000).is_empty());

        let expired = coord.timeout(T0 + 61_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].remote_device_id, b());
        assert_eq!(expired[0].state, PairingState::TimedOut);
        assert_eq!(coord.state(&b()), PairingState::Idle);
        assert_eq!(coord.len(), 1);
    }

    #[test]
    fn activity_extends_the_window() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();
        coord.submit_remote_signal(&answer(b(), a()), T0 + 50_000).unwrap();
        assert!(coord.timeout(T0 + 100_000).is_empty());
    }

    #[test]
    fn finished_requests_are_purged_after_the_window() {
        let mut coord = coordinator(b());
        coord.await_manual_entry(&a(), T0).unwrap();
        coord.confirm_manual_code(&a(), "ABC123", T0).unwrap();

        let other = DeviceId::new("cafe00");
        coord.await_manual_entry(&other, T0).unwrap();
        for _ in 0..5 {
            let _ = coord.confirm_manual_code(&other, "000000", T0 + 1_000);
        }
        assert_eq!(coord.state(&other), PairingState::Cancelled);

        // Inside the window the terminal states still reject late input
        assert!(coord.timeout(T0 + 60_000).is_empty());
        assert_eq!(coord.state(&a()), PairingState::Paired);
        assert!(matches!(
            coord.confirm_manual_code(&other, "CAFE00", T0 + 60_000),
            Err(PairingError::InvalidState { .. })
        ));

        // Purged silently: nothing is reported as timed out
        assert!(coord.timeout(T0 + 3_600_000).is_empty());
        assert!(coord.is_empty());
        assert_eq!(coord.state(&a()), PairingState::Idle);
    }

    #[test]
    fn cancel_only_affects_live_requests() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();
        assert_eq!(coord.cancel(&b(), T0).unwrap(), PairingState::Cancelled);
        assert!(coord.cancel(&b(), T0).is_err());
        assert!(coord.dismiss(&b()).is_some());
        assert!(coord.is_empty());
    }

    #[test]
    fn reinitiate_replaces_finished_request() {
        let mut coord = coordinator(a());
        coord.initiate(&b(), T0).unwrap();
        coord.cancel(&b(), T0).unwrap();
        coord.initiate(&b(), T0 + 1).unwrap();
        assert_eq!(coord.state(&b()), PairingState::AwaitingRemoteSignal);
        assert_eq!(coord.len(), 1);
    }
}
