//! Message bus server: shared state, WebSocket handler, name registry and
//! message routing.
//!
//! Clients connect to `/ws`, register a display name with their first
//! frame, and exchange JSON envelopes. Messages for names that are not
//! connected are held in a [`MessageStore`] and delivered on their next
//! registration. The same router serves stored assets under
//! `/received/{name}`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use linkchat_proto::codec;
use linkchat_proto::envelope::{ClientEnvelope, ServerEnvelope};

use crate::store::{DEFAULT_MAX_QUEUE_SIZE, MessageStore};

/// Default directory stored assets are served from.
pub const DEFAULT_RECEIVED_DIR: &str = "received";

/// Tunables of the bus server.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Also deliver each routed message back to its sender.
    pub echo_to_sender: bool,
    /// Offline queue cap per recipient.
    pub max_queue_size: usize,
    /// Directory served under `/received/`.
    pub received_dir: PathBuf,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            received_dir: PathBuf::from(DEFAULT_RECEIVED_DIR),
        }
    }
}

struct Connection {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
    address: String,
}

/// Shared bus state: who is connected, and what is waiting for whom.
pub struct RelayState {
    connections: RwLock<HashMap<String, Connection>>,
    next_id: AtomicU64,
    /// Store-and-forward queue for offline recipients.
    pub store: MessageStore,
    echo_to_sender: bool,
    received_dir: PathBuf,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::with_settings(&BusSettings::default())
    }
}

impl RelayState {
    /// Creates an empty state with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty state with the given settings.
    #[must_use]
    pub fn with_settings(settings: &BusSettings) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store: MessageStore::with_max_queue_size(settings.max_queue_size),
            echo_to_sender: settings.echo_to_sender,
            received_dir: settings.received_dir.clone(),
        }
    }

    /// Registers `name`, replacing any existing connection under it.
    ///
    /// Returns the id of the new registration; pass it to
    /// [`Self::unregister`] so a replaced connection cannot remove its
    /// successor.
    pub async fn register(
        &self,
        name: &str,
        sender: mpsc::UnboundedSender<Message>,
        address: String,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        if conns
            .insert(
                name.to_string(),
                Connection {
                    id,
                    sender,
                    address,
                },
            )
            .is_some()
        {
            tracing::info!(name, "replaced existing connection");
        }
        id
    }

    /// Removes `name` if it is still held by registration `id`.
    pub async fn unregister(&self, name: &str, id: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(name).is_some_and(|c| c.id == id) {
            conns.remove(name);
            true
        } else {
            false
        }
    }

    /// The outbound channel of `name`, if connected.
    pub async fn get_sender(&self, name: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let conns = self.connections.read().await;
        conns.get(name).map(|c| c.sender.clone())
    }

    /// Hands `frame` to `to`'s connection, or queues it when `to` is offline
    /// or its connection is going away.
    ///
    /// Returns the queue length when the frame was queued. The connection
    /// table stays locked until the frame is placed, so a registration of
    /// `to` either finds it queued when it drains or receives it live.
    pub async fn forward_or_queue(&self, to: &str, from: &str, frame: String) -> Option<usize> {
        let conns = self.connections.read().await;
        if let Some(conn) = conns.get(to) {
            if conn.sender.send(Message::text(frame.clone())).is_ok() {
                return None;
            }
            tracing::warn!(to, "forward failed, queuing");
        }
        Some(self.store.enqueue(to, from, frame).await)
    }

    /// Connected names in sorted order and their observed addresses.
    pub async fn users(&self) -> (Vec<String>, BTreeMap<String, String>) {
        let conns = self.connections.read().await;
        let addresses: BTreeMap<_, _> = conns
            .iter()
            .map(|(name, c)| (name.clone(), c.address.clone()))
            .collect();
        (addresses.keys().cloned().collect(), addresses)
    }

    /// Send a close frame to every connection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (name, conn) in conns.iter() {
            tracing::info!(name = %name, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    async fn send_to(&self, name: &str, envelope: &ServerEnvelope) {
        if let Some(sender) = self.get_sender(name).await
            && let Ok(text) = codec::encode(envelope)
        {
            let _ = sender.send(Message::text(text));
        }
    }

    async fn broadcast_user_list(&self) {
        let (users, user_ips) = self.users().await;
        let update = ServerEnvelope::UserListUpdate { users, user_ips };
        let Ok(text) = codec::encode(&update) else {
            return;
        };
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::text(text.clone()));
        }
    }
}

/// Address a client is seen from: proxy headers first, then the socket.
fn client_address(headers: &HeaderMap, remote: SocketAddr) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header_value("x-real-ip")
        .or_else(|| header_value("x-forwarded-for"))
        .unwrap_or_else(|| remote.ip().to_string())
}

/// Handles an upgraded WebSocket connection for one client.
///
/// 1. Wait for `register`; anything else closes the connection.
/// 2. Reply `ip_assigned` and broadcast the new user list.
/// 3. Deliver queued messages.
/// 4. Route `message` and answer `list` until the client leaves.
/// 5. Unregister and broadcast the user list again.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, address: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(name) = wait_for_register(&mut ws_receiver).await else {
        tracing::warn!("connection closed before registration");
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.register(&name, tx, address.clone()).await;

    let ack = ServerEnvelope::IpAssigned {
        ip: address.clone(),
        username: name.clone(),
    };
    if let Err(e) = send_envelope(&mut ws_sender, &ack).await {
        tracing::error!(name = %name, error = %e, "failed to send ip_assigned");
        state.unregister(&name, conn_id).await;
        return;
    }
    tracing::info!(name = %name, address = %address, "client registered");
    state.broadcast_user_list().await;

    let queued = state.store.drain(&name).await;
    if !queued.is_empty() {
        tracing::info!(name = %name, count = queued.len(), "delivering queued messages");
        for stored in queued {
            if let Err(e) = ws_sender.send(Message::text(stored.frame)).await {
                tracing::warn!(name = %name, error = %e, "queued delivery failed");
                break;
            }
        }
    }

    let writer_name = name.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(name = %writer_name, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_name = name.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(&reader_name, text.as_str(), &reader_state).await;
                }
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_text(&reader_name, text, &reader_state).await,
                    Err(_) => tracing::warn!(name = %reader_name, "non-UTF-8 binary frame ignored"),
                },
                Message::Close(_) => {
                    tracing::info!(name = %reader_name, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    if state.unregister(&name, conn_id).await {
        state.broadcast_user_list().await;
    }
    tracing::info!(name = %name, "client disconnected");
}

/// Waits for the `register` frame and returns the trimmed name.
async fn wait_for_register(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match &msg {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => std::str::from_utf8(data).ok()?,
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        return match codec::decode::<ClientEnvelope>(text) {
            Ok(ClientEnvelope::Register { username }) => {
                let name = username.trim();
                if name.is_empty() {
                    tracing::warn!("register with empty name");
                    None
                } else {
                    Some(name.to_string())
                }
            }
            Ok(other) => {
                tracing::warn!(msg = ?other, "expected register");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable registration frame");
                None
            }
        };
    }
    None
}

/// Handles one text frame from a registered client.
async fn handle_text(name: &str, text: &str, state: &Arc<RelayState>) {
    let envelope = match codec::decode::<ClientEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(name, error = %e, "malformed frame ignored");
            return;
        }
    };

    match envelope {
        ClientEnvelope::Message { to, msg } => {
            // `from` is always the registered name.
            let routed = ServerEnvelope::Message {
                from: name.to_string(),
                to: to.clone(),
                msg,
            };
            route_message(state, name, &to, &routed).await;
        }
        ClientEnvelope::List => {
            let (users, user_ips) = state.users().await;
            let list = ServerEnvelope::List {
                users,
                user_ips,
                current_user: name.to_string(),
            };
            state.send_to(name, &list).await;
        }
        ClientEnvelope::Register { username } => {
            tracing::warn!(name, new_name = %username, "duplicate register ignored");
        }
    }
}

/// Delivers `envelope` to `to`, queuing it when `to` is offline.
async fn route_message(state: &Arc<RelayState>, from: &str, to: &str, envelope: &ServerEnvelope) {
    let text = match codec::encode(envelope) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode routed message");
            return;
        }
    };

    match state.forward_or_queue(to, from, text).await {
        None => tracing::debug!(from, to, "message routed"),
        Some(count) => tracing::info!(to, count, "recipient not connected, message queued"),
    }

    if state.echo_to_sender && to != from {
        state.send_to(from, envelope).await;
    }
}

async fn send_envelope(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    envelope: &ServerEnvelope,
) -> Result<(), String> {
    let text = codec::encode(envelope).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::text(text))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let address = client_address(&headers, remote);
    ws.on_upgrade(move |socket| handle_socket(socket, state, address))
}

/// Whether `name` is a plain file name inside the received directory.
fn is_safe_asset_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

fn content_type(name: &str) -> &'static str {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

async fn received_handler(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
) -> Response {
    if !is_safe_asset_name(&name) {
        tracing::warn!(name = %name, "rejected asset path");
        return StatusCode::BAD_REQUEST.into_response();
    }
    match tokio::fs::read(state.received_dir.join(&name)).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&name))], bytes).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(name = %name, error = %e, "failed to read stored asset");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Starts the bus on `addr` with default settings.
///
/// Returns the bound address and the server task.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn start_server(
    addr: &str,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    start_server_with(addr, &BusSettings::default()).await
}

/// Starts the bus on `addr` with `settings`.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn start_server_with(
    addr: &str,
    settings: &BusSettings,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    start_server_with_state(addr, Arc::new(RelayState::with_settings(settings))).await
}

/// Starts the bus on `addr` around an existing [`RelayState`].
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/received/{name}", axum::routing::get(received_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            tracing::error!(error = %e, "bus server error");
        }
    });

    Ok((bound_addr, handle))
}
