//! WebSocket bus connection.
//!
//! Implements [`Bus`] over a WebSocket text channel. A background reader
//! task forwards incoming text frames into a channel so that `recv` is
//! cancel-safe and `send` never contends with reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Bus, BusConnector, BusError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Default timeout for establishing the WebSocket connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the inbound frame channel.
pub const DEFAULT_BUFFER: usize = 256;

/// A WebSocket connection to the message bus.
pub struct WsBus {
    url: String,
    ws_sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::Receiver<String>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsBus {
    /// Connect to a bus at `url` (`ws://` or `wss://`).
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidUrl`] if `url` is not a WebSocket URL.
    /// - [`BusError::Timeout`] if the connection is not established in time.
    /// - [`BusError::Unreachable`] if the server refuses the connection.
    /// - [`BusError::Io`] for other handshake failures.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        buffer: usize,
    ) -> Result<Self, BusError> {
        validate_url(url)?;

        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "bus connect timed out");
                BusError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "bus connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::debug!(url, "bus connected");
        Ok(Self {
            url: url.to_string(),
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// The URL this bus is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl Bus for WsBus {
    async fn send(&self, frame: &str) -> Result<(), BusError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(BusError::ConnectionClosed);
        }
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::text(frame.to_owned())).await.map_err(|e| {
            tracing::warn!(err = %e, "bus send failed");
            self.connected.store(false, Ordering::Relaxed);
            BusError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<String, BusError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(BusError::ConnectionClosed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "bus close handshake failed");
        }
        self.reader_handle.abort();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Opens [`WsBus`] connections to a fixed URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
    buffer: usize,
}

impl WsConnector {
    /// Create a connector for `url` with default timeout and buffer.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the inbound frame buffer.
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

impl BusConnector for WsConnector {
    type Bus = WsBus;

    async fn connect(&self) -> Result<WsBus, BusError> {
        WsBus::connect(&self.url, self.connect_timeout, self.buffer).await
    }
}

/// Forwards text frames into `tx` until the socket closes.
///
/// Binary frames holding valid UTF-8 are forwarded as text; anything else
/// is skipped. Clears `connected` on exit.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(len = data.len(), "non-utf8 binary bus frame, skipping");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("bus closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                tracing::warn!(err = %e, "bus read error");
                break;
            }
        };
        if tx.send(text).await.is_err() {
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("bus reader task exiting");
}

fn validate_url(raw: &str) -> Result<(), BusError> {
    let parsed = url::Url::parse(raw).map_err(|e| BusError::InvalidUrl(format!("{raw}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(BusError::InvalidUrl(format!(
            "{raw}: unsupported scheme {other}"
        ))),
    }
}

fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> BusError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                BusError::Unreachable(url.to_string())
            } else {
                BusError::Io(io_err)
            }
        }
        WsError::Http(response) => BusError::Io(std::io::Error::other(format!(
            "bus HTTP error: status {}",
            response.status()
        ))),
        other => BusError::Io(std::io::Error::other(format!(
            "bus connection error: {other}"
        ))),
    }
}
