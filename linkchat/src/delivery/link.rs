//! The asset channel: a framed connection to the asset-transfer service.
//!
//! One link carries exactly one transfer: a `transfer` request, the chunk
//! frames, an `end` marker, and finally the service's `result`. The service
//! answers accepted chunks with `ack` frames.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use linkchat_proto::codec::{self, CodecError};
use linkchat_proto::framing::{self, Frame};
use linkchat_proto::transfer::{ControlFrame, TransferRequest, TransferResponse, TransferStats};

/// Default timeout for opening the asset channel.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for the final `result` frame.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors on the asset channel.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The service closed the channel.
    #[error("asset channel closed")]
    Closed,

    /// Connecting or waiting for the result timed out.
    #[error("asset channel timed out")]
    Timeout,

    /// The service answered with an error result.
    #[error("transfer rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("asset channel codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("asset channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single-transfer connection to the asset service.
pub trait ChunkLink: Send {
    /// Announce the transfer.
    fn open(&mut self, request: &TransferRequest)
    -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Send one packed chunk frame.
    fn send_chunk(&mut self, chunk: &[u8]) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Wait for the next chunk acknowledgment.
    ///
    /// Cancel-safe: dropping the future never loses an acknowledgment.
    /// Returns [`LinkError::Rejected`] if the service ends the transfer
    /// with an error while we wait.
    fn next_ack(&mut self) -> impl Future<Output = Result<u16, LinkError>> + Send;

    /// Take an acknowledgment that has already arrived, without waiting.
    fn try_ack(&mut self) -> Option<u16>;

    /// Signal the end of the chunk stream and wait for the result.
    fn finish(
        &mut self,
        stats: &TransferStats,
    ) -> impl Future<Output = Result<TransferResponse, LinkError>> + Send;
}

/// Opens asset channels.
pub trait LinkConnector: Send + Sync {
    /// The link type produced by this connector.
    type Link: ChunkLink + 'static;

    /// Open a new link.
    fn connect(&self) -> impl Future<Output = Result<Self::Link, LinkError>> + Send;
}

/// Control traffic from the service, in arrival order.
#[derive(Debug)]
enum LinkEvent {
    Ack(u16),
    Result(TransferResponse),
}

/// [`ChunkLink`] over a TCP connection with length-prefixed frames.
pub struct TcpChunkLink {
    writer: OwnedWriteHalf,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    pending_result: Option<TransferResponse>,
    result_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl TcpChunkLink {
    /// Connect to the asset service at `addr`.
    ///
    /// # Errors
    ///
    /// [`LinkError::Timeout`] if the connection is not established within
    /// `connect_timeout`, or [`LinkError::Io`] if it fails.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        result_timeout: Duration,
    ) -> Result<Self, LinkError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::warn!(addr, "asset channel connect timed out");
                LinkError::Timeout
            })??;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, events) = mpsc::unbounded_channel();
        let reader_handle = tokio::spawn(reader_loop(reader, tx));
        Ok(Self {
            writer,
            events,
            pending_result: None,
            result_timeout,
            reader_handle,
        })
    }

    async fn write_payload(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let frame = framing::encode_frame(payload)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    async fn write_control(&mut self, control: &ControlFrame) -> Result<(), LinkError> {
        let text = codec::encode(control)?;
        self.write_payload(text.as_bytes()).await
    }

    async fn wait_result(&mut self) -> Result<TransferResponse, LinkError> {
        if let Some(result) = self.pending_result.take() {
            return Ok(result);
        }
        loop {
            match self.events.recv().await {
                Some(LinkEvent::Result(result)) => return Ok(result),
                Some(LinkEvent::Ack(_)) => {}
                None => return Err(LinkError::Closed),
            }
        }
    }
}

impl Drop for TcpChunkLink {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn rejection(result: &TransferResponse) -> Option<LinkError> {
    result.error.as_ref().map(|e| LinkError::Rejected(e.clone()))
}

impl ChunkLink for TcpChunkLink {
    async fn open(&mut self, request: &TransferRequest) -> Result<(), LinkError> {
        self.write_control(&ControlFrame::Transfer(request.clone()))
            .await
    }

    async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), LinkError> {
        self.write_payload(chunk).await
    }

    async fn next_ack(&mut self) -> Result<u16, LinkError> {
        loop {
            match self.events.recv().await {
                Some(LinkEvent::Ack(id)) => return Ok(id),
                Some(LinkEvent::Result(result)) => {
                    let rejected = rejection(&result);
                    self.pending_result = Some(result);
                    if let Some(err) = rejected {
                        return Err(err);
                    }
                }
                None => return Err(LinkError::Closed),
            }
        }
    }

    fn try_ack(&mut self) -> Option<u16> {
        loop {
            match self.events.try_recv() {
                Ok(LinkEvent::Ack(id)) => return Some(id),
                Ok(LinkEvent::Result(result)) => self.pending_result = Some(result),
                Err(_) => return None,
            }
        }
    }

    async fn finish(&mut self, stats: &TransferStats) -> Result<TransferResponse, LinkError> {
        if self.pending_result.is_none() {
            self.write_control(&ControlFrame::End { stats: *stats })
                .await?;
        }
        let timeout = self.result_timeout;
        let result = tokio::time::timeout(timeout, self.wait_result())
            .await
            .map_err(|_| LinkError::Timeout)??;
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(err = %e, "asset channel shutdown failed");
        }
        Ok(result)
    }
}

/// Opens [`TcpChunkLink`]s to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpLinkConnector {
    addr: String,
    connect_timeout: Duration,
    result_timeout: Duration,
}

impl TcpLinkConnector {
    /// Create a connector for `addr` with default timeouts.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            result_timeout: DEFAULT_RESULT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the result timeout.
    #[must_use]
    pub const fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }
}

impl LinkConnector for TcpLinkConnector {
    type Link = TcpChunkLink;

    async fn connect(&self) -> Result<TcpChunkLink, LinkError> {
        TcpChunkLink::connect(&self.addr, self.connect_timeout, self.result_timeout).await
    }
}

/// Reads control frames from the service until the connection ends.
async fn reader_loop(mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<LinkEvent>) {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut scratch = [0u8; 4096];
    loop {
        loop {
            let (event, consumed) = match framing::decode_frame(&buf) {
                Ok(Some((payload, consumed))) => (control_event(payload), consumed),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(err = %e, "asset channel framing error, closing");
                    return;
                }
            };
            buf.drain(..consumed);
            if let Some(event) = event
                && tx.send(event).is_err()
            {
                return;
            }
        }
        match reader.read(&mut scratch).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) => {
                tracing::warn!(err = %e, "asset channel read error");
                break;
            }
        }
    }
    tracing::debug!("asset channel reader exiting");
}

fn control_event(payload: &[u8]) -> Option<LinkEvent> {
    match framing::classify(payload) {
        Ok(Frame::Control(ControlFrame::Ack { chunk_id })) => Some(LinkEvent::Ack(chunk_id)),
        Ok(Frame::Control(ControlFrame::Result(result))) => Some(LinkEvent::Result(result)),
        Ok(other) => {
            tracing::debug!(?other, "unexpected frame from asset service");
            None
        }
        Err(e) => {
            tracing::warn!(err = %e, "malformed frame from asset service, skipping");
            None
        }
    }
}
