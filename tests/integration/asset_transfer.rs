//! Integration tests for chunked asset transfer.
//!
//! Runs the bus and the asset service in-process over a shared received
//! directory and drives uploads from a real client: reliable and
//! best-effort modes, simulated loss, service-side rejection and the
//! HTTP fetch path announced in the asset message.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use linkchat::bus::ws::WsConnector;
use linkchat::client::{ChatClient, ClientEvent, ClientSettings};
use linkchat::delivery::TransferError;
use linkchat::delivery::link::TcpLinkConnector;
use linkchat::delivery::transfer::{TransferOptions, TransferState};
use linkchat::runtime::{self, ClientHandle};
use linkchat::session::ConnectionManager;
use linkchat_proto::transfer::{AssetReference, TransferMode};
use linkchat_relay::assets::{AssetSettings, start_asset_server};
use linkchat_relay::bus::{BusSettings, start_server_with};

struct Services {
    bus_url: String,
    bus_addr: std::net::SocketAddr,
    asset_addr: String,
    received_dir: PathBuf,
    _handles: (JoinHandle<()>, JoinHandle<()>),
}

async fn start_services(loss_rate: f64) -> Services {
    let received_dir =
        std::env::temp_dir().join(format!("linkchat-it-{}", uuid::Uuid::now_v7()));
    let (asset_addr, assets) = start_asset_server("127.0.0.1:0", AssetSettings {
        received_dir: received_dir.clone(),
        loss_rate,
        ..AssetSettings::default()
    })
    .await
    .expect("failed to start asset service");
    let bus_settings = BusSettings {
        received_dir: received_dir.clone(),
        ..BusSettings::default()
    };
    let (bus_addr, bus) = start_server_with("127.0.0.1:0", &bus_settings)
        .await
        .expect("failed to start bus");
    Services {
        bus_url: format!("ws://{bus_addr}/ws"),
        bus_addr,
        asset_addr: asset_addr.to_string(),
        received_dir,
        _handles: (bus, assets),
    }
}

struct Client {
    handle: ClientHandle,
    events: mpsc::Receiver<ClientEvent>,
    _task: JoinHandle<()>,
}

async fn join(services: &Services, name: &str, transfer: TransferOptions) -> Client {
    let connection = ConnectionManager::new(WsConnector::new(services.bus_url.clone()))
        .with_register_timeout(Duration::from_secs(2))
        .with_refresh_interval(Duration::from_secs(1));
    let links = TcpLinkConnector::new(services.asset_addr.clone())
        .with_result_timeout(Duration::from_secs(2));
    let settings = ClientSettings {
        transfer,
        ..ClientSettings::default()
    };
    let (client, events) = ChatClient::new(connection, links, settings);
    let (handle, task) = runtime::spawn_client(client, 16);
    handle.connect(name).await.unwrap();
    Client {
        handle,
        events,
        _task: task,
    }
}

impl Client {
    async fn wait_for(&mut self, mut pred: impl FnMut(&ClientEvent) -> bool) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
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

    /// Waits for the transfer to settle.
    async fn outcome(&mut self) -> Result<AssetReference, TransferError> {
        match self
            .wait_for(|e| {
                matches!(
                    e,
                    ClientEvent::TransferCompleted { .. } | ClientEvent::TransferFailed { .. }
                )
            })
            .await
        {
            ClientEvent::TransferCompleted { asset, .. } => Ok(asset),
            ClientEvent::TransferFailed { error, .. } => Err(error),
            _ => unreachable!(),
        }
    }
}

fn options(mode: TransferMode, chunk_size: usize) -> TransferOptions {
    TransferOptions {
        mode,
        chunk_size,
        max_retries: 1,
        ack_timeout: Duration::from_millis(100),
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

/// Minimal HTTP/1.1 GET; returns the raw response.
async fn http_get(addr: std::net::SocketAddr, path: &str) -> Vec<u8> {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

fn stored(dir: &Path, asset: &AssetReference) -> Vec<u8> {
    std::fs::read(dir.join(asset.filename())).unwrap()
}

#[tokio::test]
async fn reliable_upload_is_stored_and_announced() {
    let services = start_services(0.0).await;
    let mut alice = join(&services, "alice", options(TransferMode::Reliable, 64)).await;
    let mut bob = join(&services, "bob", options(TransferMode::Reliable, 64)).await;

    let data = image(300);
    let id = alice
        .handle
        .send_asset("bob", "sunset.png", data.clone(), None)
        .await
        .unwrap();
    let started = alice
        .wait_for(|e| matches!(e, ClientEvent::TransferStarted { .. }))
        .await;
    assert_eq!(
        started,
        ClientEvent::TransferStarted {
            id,
            peer: "bob".into(),
            chunks_total: 5,
        }
    );

    let asset = alice.outcome().await.unwrap();
    assert!(asset.filename().starts_with("img_"));
    assert!(asset.filename().ends_with(".png"));
    assert_eq!(stored(&services.received_dir, &asset), data);

    let ClientEvent::MessageReceived { peer, message, .. } = bob
        .wait_for(|e| matches!(e, ClientEvent::MessageReceived { .. }))
        .await
    else {
        unreachable!()
    };
    assert_eq!(peer, "alice");
    assert_eq!(message.content, asset.to_message());
    assert_eq!(AssetReference::parse_message(&message.content), Some(asset.clone()));

    let transfers = alice.handle.transfers().await.unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].state, TransferState::Completed);
    assert_eq!(transfers[0].progress(), 100);

    // The announced path is served by the bus.
    let response = http_get(services.bus_addr, &asset.path()).await;
    assert!(response.starts_with(b"HTTP/1.1 200"));
    assert!(response.ends_with(&data));
}

#[tokio::test]
async fn best_effort_under_total_loss_stores_partial() {
    let services = start_services(1.0).await;
    let mut alice = join(&services, "alice", options(TransferMode::Reliable, 64)).await;

    let data = image(200);
    alice
        .handle
        .send_asset("bob", "lossy.png", data, Some(TransferMode::BestEffort))
        .await
        .unwrap();

    let asset = alice.outcome().await.unwrap();
    assert!(asset.filename().ends_with(".png.partial"));
    assert_eq!(stored(&services.received_dir, &asset), vec![0u8; 200]);

    // The recorded message names the stored partial.
    let history = alice.handle.history("bob").await.unwrap();
    assert_eq!(history.last().unwrap().content, asset.to_message());
}

#[tokio::test]
async fn reliable_under_total_loss_exhausts_retries() {
    let services = start_services(1.0).await;
    let mut alice = join(&services, "alice", options(TransferMode::Reliable, 64)).await;

    alice
        .handle
        .send_asset("bob", "lost.png", image(128), None)
        .await
        .unwrap();

    let error = alice.outcome().await.unwrap_err();
    assert_eq!(
        error,
        TransferError::RetriesExhausted {
            chunk: 0,
            chunks_acked: 0,
        }
    );
    let transfers = alice.handle.transfers().await.unwrap();
    assert_eq!(transfers[0].state, TransferState::Failed);
    // No asset message goes out for a failed transfer.
    assert!(alice.handle.history("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn chunk_size_below_service_minimum_is_rejected() {
    let services = start_services(0.0).await;
    let mut alice = join(&services, "alice", options(TransferMode::Reliable, 16)).await;

    alice
        .handle
        .send_asset("bob", "tiny.png", image(48), None)
        .await
        .unwrap();

    let error = alice.outcome().await.unwrap_err();
    assert!(
        matches!(&error, TransferError::Rejected(reason) if reason.contains("chunk_size")),
        "unexpected error: {error:?}"
    );
}

#[tokio::test]
async fn asset_without_recipient_is_refused() {
    let services = start_services(0.0).await;
    let alice = join(&services, "alice", options(TransferMode::Reliable, 64)).await;

    let err = alice
        .handle
        .send_asset("alice", "me.png", image(10), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        linkchat::runtime::ClientError::Transfer(TransferError::NoRecipient)
    ));
    assert!(alice.handle.transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn stored_assets_reject_path_traversal() {
    let services = start_services(0.0).await;

    let response = http_get(services.bus_addr, "/received/..%2Fsecret").await;
    assert!(response.starts_with(b"HTTP/1.1 400"));
    let response = http_get(services.bus_addr, "/received/img_missing.png").await;
    assert!(response.starts_with(b"HTTP/1.1 404"));
}
