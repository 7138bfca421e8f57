//! Integration tests for text messaging through the bus.
//!
//! Two or more clients share an in-process bus: messages route by name,
//! unread counts follow the active conversation, offline recipients get
//! their queue on registration and self-echoes are not duplicated.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use linkchat::bus::ws::WsConnector;
use linkchat::client::{ChatClient, ClientEvent, ClientSettings};
use linkchat::conversation::Origin;
use linkchat::delivery::SendError;
use linkchat::delivery::link::TcpLinkConnector;
use linkchat::directory::DirectoryError;
use linkchat::runtime::{self, ClientError, ClientHandle};
use linkchat::session::ConnectionManager;
use linkchat_relay::bus::BusSettings;

struct Peer {
    handle: ClientHandle,
    events: mpsc::Receiver<ClientEvent>,
    _task: JoinHandle<()>,
}

async fn start_bus(settings: &BusSettings) -> (String, JoinHandle<()>) {
    let (addr, handle) = linkchat_relay::bus::start_server_with("127.0.0.1:0", settings)
        .await
        .expect("failed to start bus");
    (format!("ws://{addr}/ws"), handle)
}

/// Spawn a client and register it as `name`.
async fn join(url: &str, name: &str) -> Peer {
    let connection = ConnectionManager::new(WsConnector::new(url))
        .with_register_timeout(Duration::from_secs(2))
        .with_refresh_interval(Duration::from_secs(1));
    let (client, events) = ChatClient::new(
        connection,
        TcpLinkConnector::new("127.0.0.1:9"),
        ClientSettings::default(),
    );
    let (handle, task) = runtime::spawn_client(client, 16);
    handle.connect(name).await.unwrap();
    Peer {
        handle,
        events,
        _task: task,
    }
}

impl Peer {
    async fn wait_for(&mut self, mut pred: impl FnMut(&ClientEvent) -> bool) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_peer(&mut self, name: &str) {
        self.wait_for(|e| match e {
            ClientEvent::PeersChanged(peers) => peers.iter().any(|p| p.identity == name),
            _ => false,
        })
        .await;
    }

    /// Next message, as (peer, content, unread).
    async fn next_message(&mut self) -> (String, String, u32) {
        match self
            .wait_for(|e| matches!(e, ClientEvent::MessageReceived { .. }))
            .await
        {
            ClientEvent::MessageReceived {
                peer,
                message,
                unread,
            } => (peer, message.content, unread),
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn text_round_trip_between_two_clients() {
    let (url, _bus) = start_bus(&BusSettings::default()).await;
    let mut alice = join(&url, "alice").await;
    let mut bob = join(&url, "bob").await;
    alice.wait_for_peer("bob").await;

    alice.handle.send_text("bob", "hola bob").await.unwrap();
    assert_eq!(
        bob.next_message().await,
        ("alice".to_string(), "hola bob".to_string(), 1)
    );

    bob.handle.send_text("alice", "hola alice").await.unwrap();
    assert_eq!(
        alice.next_message().await,
        ("bob".to_string(), "hola alice".to_string(), 1)
    );

    let history = alice.handle.history("bob").await.unwrap();
    let lines: Vec<_> = history
        .iter()
        .map(|m| (m.from.as_str(), m.content.as_str(), m.origin))
        .collect();
    assert_eq!(
        lines,
        vec![
            ("alice", "hola bob", Origin::Local),
            ("bob", "hola alice", Origin::Remote),
        ]
    );
}

#[tokio::test]
async fn active_conversation_is_not_counted_unread() {
    let (url, _bus) = start_bus(&BusSettings::default()).await;
    let alice = join(&url, "alice").await;
    let mut bob = join(&url, "bob").await;
    bob.wait_for_peer("alice").await;

    alice.handle.send_text("bob", "one").await.unwrap();
    assert_eq!(bob.next_message().await.2, 1);
    alice.handle.send_text("bob", "two").await.unwrap();
    assert_eq!(bob.next_message().await.2, 2);

    // Selecting the conversation clears its unread count.
    bob.handle.select("alice").await.unwrap();
    alice.handle.send_text("bob", "three").await.unwrap();
    assert_eq!(bob.next_message().await.2, 0);
}

#[tokio::test]
async fn offline_recipient_gets_messages_on_connect() {
    let (url, _bus) = start_bus(&BusSettings::default()).await;
    let alice = join(&url, "alice").await;

    alice.handle.send_text("carol", "are you there?").await.unwrap();
    alice.handle.send_text("carol", "ping").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut carol = join(&url, "carol").await;
    assert_eq!(carol.next_message().await.1, "are you there?");
    assert_eq!(carol.next_message().await.1, "ping");
}

#[tokio::test]
async fn self_echo_is_not_recorded_twice() {
    let settings = BusSettings {
        echo_to_sender: true,
        ..BusSettings::default()
    };
    let (url, _bus) = start_bus(&settings).await;
    let mut alice = join(&url, "alice").await;
    let mut bob = join(&url, "bob").await;
    alice.wait_for_peer("bob").await;

    alice.handle.send_text("bob", "only once").await.unwrap();
    bob.next_message().await;

    // The echo is processed before this reply because frames are handled in order.
    bob.handle.send_text("alice", "ack").await.unwrap();
    assert_eq!(alice.next_message().await.1, "ack");

    let history = alice.handle.history("bob").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "only once");
    assert_eq!(history[1].content, "ack");
}

#[tokio::test]
async fn invalid_targets_are_refused() {
    let (url, _bus) = start_bus(&BusSettings::default()).await;
    let alice = join(&url, "alice").await;

    let err = alice.handle.send_text("alice", "me?").await.unwrap_err();
    assert!(matches!(err, ClientError::Send(SendError::NoRecipient)));

    let err = alice.handle.send_text("  ", "nobody").await.unwrap_err();
    assert!(matches!(err, ClientError::Send(SendError::NoRecipient)));

    let err = alice.handle.select("mallory").await.unwrap_err();
    assert!(matches!(err, ClientError::Directory(DirectoryError::InvalidTarget { .. })));
}

#[tokio::test]
async fn sending_after_disconnect_fails() {
    let (url, _bus) = start_bus(&BusSettings::default()).await;
    let alice = join(&url, "alice").await;
    alice.handle.disconnect().await.unwrap();

    let err = alice.handle.send_text("bob", "late").await.unwrap_err();
    assert!(matches!(err, ClientError::Send(SendError::NotConnected)));
    assert!(alice.handle.history("bob").await.unwrap().is_empty());
}
