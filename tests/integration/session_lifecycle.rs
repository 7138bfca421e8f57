//! Integration tests for the session lifecycle against an in-process bus.
//!
//! Covers registration and the `ip_assigned` handshake, peer directory
//! updates on join and leave, identity validation, handshake timeout and
//! reconnecting after a disconnect.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use linkchat::bus::ws::WsConnector;
use linkchat::client::{ChatClient, ClientEvent, ClientSettings};
use linkchat::delivery::link::TcpLinkConnector;
use linkchat::runtime::{self, ClientError, ClientHandle};
use linkchat::session::{ConnectionManager, ConnectionState, SessionError};

/// Start the bus in-process and return its ws:// URL.
async fn start_bus() -> (String, JoinHandle<()>) {
    let (addr, handle) = linkchat_relay::bus::start_server("127.0.0.1:0")
        .await
        .expect("failed to start bus");
    (format!("ws://{addr}/ws"), handle)
}

fn connection(url: &str) -> ConnectionManager<WsConnector> {
    ConnectionManager::new(WsConnector::new(url).with_connect_timeout(Duration::from_secs(2)))
        .with_register_timeout(Duration::from_millis(500))
        .with_refresh_interval(Duration::from_secs(1))
}

fn spawn(url: &str) -> (ClientHandle, mpsc::Receiver<ClientEvent>, JoinHandle<()>) {
    let (client, events) = ChatClient::new(
        connection(url),
        TcpLinkConnector::new("127.0.0.1:9"),
        ClientSettings::default(),
    );
    let (handle, task) = runtime::spawn_client(client, 16);
    (handle, events, task)
}

async fn wait_for(
    events: &mut mpsc::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn lists(event: &ClientEvent, names: &[&str]) -> bool {
    match event {
        ClientEvent::PeersChanged(peers) => {
            let mut seen: Vec<_> = peers.iter().map(|p| p.identity.as_str()).collect();
            seen.sort_unstable();
            seen == names
        }
        _ => false,
    }
}

#[tokio::test]
async fn connect_reports_assigned_address() {
    let (url, _bus) = start_bus().await;
    let (alice, mut events, _task) = spawn(&url);

    alice.connect("alice").await.unwrap();
    let connected = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(
        connected,
        ClientEvent::Connected {
            identity: "alice".into(),
            address: "127.0.0.1".into(),
        }
    );
}

#[tokio::test]
async fn identity_is_trimmed_on_registration() {
    let (url, _bus) = start_bus().await;
    let (alice, mut events, _task) = spawn(&url);

    alice.connect("  alice ").await.unwrap();
    let connected = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert!(matches!(connected, ClientEvent::Connected { identity, .. } if identity == "alice"));
}

#[tokio::test]
async fn peers_see_each_other_join_and_leave() {
    let (url, _bus) = start_bus().await;
    let (alice, mut alice_events, _a) = spawn(&url);
    let (bob, mut bob_events, _b) = spawn(&url);

    alice.connect("alice").await.unwrap();
    bob.connect("bob").await.unwrap();

    // The directory never lists the local identity.
    wait_for(&mut alice_events, |e| lists(e, &["bob"])).await;
    wait_for(&mut bob_events, |e| lists(e, &["alice"])).await;

    let peers = alice.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].identity, "bob");
    assert_eq!(peers[0].address.as_deref(), Some("127.0.0.1"));

    bob.disconnect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::Disconnected { reason: None })).await;
    wait_for(&mut alice_events, |e| lists(e, &[])).await;
}

#[tokio::test]
async fn blank_identity_is_rejected() {
    let (url, _bus) = start_bus().await;
    let (alice, _events, _task) = spawn(&url);

    let err = alice.connect("   ").await.unwrap_err();
    assert!(matches!(err, ClientError::Session(SessionError::InvalidIdentity)));
}

#[tokio::test]
async fn second_connect_is_refused() {
    let (url, _bus) = start_bus().await;
    let (alice, _events, _task) = spawn(&url);

    alice.connect("alice").await.unwrap();
    let err = alice.connect("alice2").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Session(SessionError::AlreadyConnected(name)) if name == "alice"
    ));
}

#[tokio::test]
async fn unreachable_bus_leaves_client_disconnected() {
    let (mut client, _events) = ChatClient::new(
        connection("ws://127.0.0.1:1/ws"),
        TcpLinkConnector::new("127.0.0.1:9"),
        ClientSettings::default(),
    );

    let err = client.connect("alice").await.unwrap_err();
    assert!(matches!(err, SessionError::Bus(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.local_identity().is_none());
}

#[tokio::test]
async fn silent_bus_times_out_the_handshake() {
    // Accepts the WebSocket but never acknowledges registration.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let (mut client, _events) = ChatClient::new(
        connection(&format!("ws://{addr}/ws")),
        TcpLinkConnector::new("127.0.0.1:9"),
        ClientSettings::default(),
    );
    let err = client.connect("alice").await.unwrap_err();
    assert!(matches!(err, SessionError::HandshakeTimeout(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_after_disconnect() {
    let (url, _bus) = start_bus().await;
    let (alice, mut events, _task) = spawn(&url);

    alice.connect("alice").await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    alice.disconnect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;

    alice.connect("alice").await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert!(alice.peers().await.unwrap().is_empty());
}
