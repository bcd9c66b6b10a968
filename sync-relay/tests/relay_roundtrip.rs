//! Relay and device runtime over real loopback TCP.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_client::{
    ClientConfig, MemoryDeviceStore, Notifier, PairingEvent, SignalSender, SignalingClient,
    SignalingError, SyncNode,
};
use sync_core::PairingState;
use sync_types::{now_millis, Advertisement, DeviceId, Platform, SignalEnvelope, SignalKind};
use syncstuff_relay::protocol::serve;
use syncstuff_relay::{Config, SignalRelay};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    relay: Arc<SignalRelay>,
    shutdown: CancellationToken,
}

impl TestRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(SignalRelay::new(Config::default()));
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, relay.clone(), shutdown.clone()));
        Self {
            addr,
            relay,
            shutdown,
        }
    }

    async fn join(&self, id: &str) -> (SignalingClient, tokio::sync::mpsc::Receiver<SignalEnvelope>) {
        SignalingClient::connect(&self.addr.to_string(), DeviceId::new(id), FORWARD_TIMEOUT)
            .await
            .unwrap()
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn offer_is_forwarded_to_joined_device() {
    let relay = TestRelay::start().await;
    let (alice, _alice_rx) = relay.join("abc123").await;
    let (_bob, mut bob_rx) = relay.join("def456").await;
    assert!(relay.relay.is_joined(&DeviceId::new("def456")));

    let offer = SignalEnvelope::new(
        DeviceId::new("abc123"),
        DeviceId::new("def456"),
        SignalKind::Offer,
        b"v=0 sdp".to_vec(),
    );
    alice.send_signal(offer.clone()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, offer);
}

#[tokio::test]
async fn forward_to_absent_device_is_undelivered() {
    let relay = TestRelay::start().await;
    let (alice, _rx) = relay.join("abc123").await;

    let err = alice
        .send_signal(SignalEnvelope::new(
            DeviceId::new("abc123"),
            DeviceId::new("999999"),
            SignalKind::Candidate,
            vec![1, 2, 3],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::Undelivered { .. }));

    // The connection survives an undelivered forward
    alice.ping().await.unwrap();
    assert!(alice.is_connected());
}

#[tokio::test]
async fn leave_frees_the_device_id() {
    let relay = TestRelay::start().await;
    let (alice, _rx) = relay.join("abc123").await;
    assert!(relay.relay.is_joined(&DeviceId::new("abc123")));

    alice.leave().await.unwrap();
    wait_until(|| !relay.relay.is_joined(&DeviceId::new("abc123"))).await;
}

#[derive(Default)]
struct Events(Mutex<Vec<PairingEvent>>);

impl Notifier for Events {
    fn notify(&self, event: PairingEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl Events {
    fn contains(&self, predicate: impl Fn(&PairingEvent) -> bool) -> bool {
        self.0.lock().unwrap().iter().any(predicate)
    }
}

fn node_config(id: &str, name: &str, relay: SocketAddr, downloads: &std::path::Path) -> ClientConfig {
    let toml = format!(
        r#"
[device]
name = "{name}"
id = "{id}"

[discovery]
port = 0
broadcast_address = "127.0.0.1"

[relay]
address = "{relay}"

[sync]
listen_address = "127.0.0.1:0"
"#
    );
    let mut config: ClientConfig = toml::from_str(&toml).unwrap();
    config.sync.download_dir = downloads.to_path_buf();
    config
}

#[tokio::test]
async fn devices_pair_through_relay() {
    let relay = TestRelay::start().await;
    let dir = tempfile::TempDir::new().unwrap();

    let a_events = Arc::new(Events::default());
    let b_events = Arc::new(Events::default());
    let a = SyncNode::start(
        node_config("abc123aa", "Desk", relay.addr, dir.path()),
        Arc::new(MemoryDeviceStore::new()),
        a_events.clone(),
    )
    .await
    .unwrap();
    let b = SyncNode::start(
        node_config("def456bb", "Phone", relay.addr, dir.path()),
        Arc::new(MemoryDeviceStore::new()),
        b_events.clone(),
    )
    .await
    .unwrap();
    assert!(a.relay_connected());
    assert!(b.relay_connected());

    // A knows where B listens, as it would after LAN discovery
    a.registry()
        .on_advertisement(
            &Advertisement::new(b.device_id(), "Phone", Platform::Mobile, b.listen_addr().port()),
            "127.0.0.1".parse().unwrap(),
            now_millis(),
        )
        .unwrap();

    let code = a.pairing().initiate(b.device_id()).await.unwrap();
    assert_eq!(code.as_str(), "ABC123");

    wait_until(|| {
        b_events.contains(|e| matches!(e, PairingEvent::Requested { name, .. } if name == "Desk"))
    })
    .await;

    b.pairing().await_manual_entry(a.device_id()).unwrap();
    let state = b
        .pairing()
        .confirm_manual_code(a.device_id(), "ABC123")
        .await
        .unwrap();
    assert_eq!(state, PairingState::Paired);

    // The answer travels back through the relay and A opens the channel
    wait_until(|| a.pairing().state(b.device_id()) == PairingState::Paired).await;
    wait_until(|| b.sessions().has_session(a.device_id())).await;
    assert!(a.sessions().has_session(b.device_id()));
    assert!(a_events.contains(|e| matches!(e, PairingEvent::Paired(d) if &d.id == b.device_id())));

    let mut received = b.subscribe_inbound();
    a.send_clipboard(b.device_id(), "over the wire").unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        sync_client::InboundEvent::Clipboard { content, .. } if content == b"over the wire"
    ));

    a.shutdown().await;
    b.shutdown().await;
}
