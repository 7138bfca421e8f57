//! Asset receiving service.
//!
//! One TCP connection carries one upload: a `transfer` control frame, the
//! binary chunk frames, and an `end` frame, all length-prefixed. Every
//! accepted chunk is answered with an `ack`; the connection closes after
//! the `result` frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use linkchat_proto::chunk::Reassembler;
use linkchat_proto::codec::{self, CodecError};
use linkchat_proto::framing::{self, Frame, LENGTH_PREFIX, MAX_FRAME_LEN};
use linkchat_proto::transfer::{
    ControlFrame, TransferRequest, TransferResponse, TransferStats, chunk_count,
};

/// Smallest chunk size accepted by default.
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 64;

/// Largest chunk size accepted by default.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 65536;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables of the asset service.
#[derive(Debug, Clone)]
pub struct AssetSettings {
    /// Where uploads are stored.
    pub received_dir: PathBuf,
    /// Probability in `[0, 1]` that an arriving chunk is dropped unacked.
    pub loss_rate: f64,
    /// Inclusive lower bound on the requested chunk size.
    pub min_chunk_size: usize,
    /// Inclusive upper bound on the requested chunk size.
    pub max_chunk_size: usize,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            received_dir: PathBuf::from(crate::bus::DEFAULT_RECEIVED_DIR),
            loss_rate: 0.0,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Errors that end an upload connection.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// Socket or file system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or framed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The transfer request was refused.
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    /// The first frame was not a transfer request.
    #[error("expected a transfer request")]
    UnexpectedFrame,
}

/// Validated parameters of an upload.
#[derive(Debug)]
struct Upload {
    file: String,
    chunk_size: usize,
    total_chunks: u16,
    total_len: usize,
}

fn validate(request: &TransferRequest, settings: &AssetSettings) -> Result<Upload, AssetError> {
    let chunk_size = request
        .chunk_size_value()
        .ok_or_else(|| AssetError::InvalidRequest(format!("chunk_size {:?}", request.chunk_size)))?;
    if !(settings.min_chunk_size..=settings.max_chunk_size).contains(&chunk_size) {
        return Err(AssetError::InvalidRequest(format!(
            "chunk_size {chunk_size} outside {}..={}",
            settings.min_chunk_size, settings.max_chunk_size
        )));
    }
    if request.max_retries_value().is_none() {
        return Err(AssetError::InvalidRequest(format!(
            "max_retries {:?}",
            request.max_retries
        )));
    }
    let total_len = u32::try_from(request.total_bytes)
        .ok()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| AssetError::InvalidRequest(format!("total_bytes {}", request.total_bytes)))?;
    let expected = chunk_count(request.total_bytes, chunk_size);
    if u64::from(request.total_chunks) != expected {
        return Err(AssetError::InvalidRequest(format!(
            "total_chunks {} does not match {expected}",
            request.total_chunks
        )));
    }
    let total_chunks = u16::try_from(request.total_chunks)
        .map_err(|_| AssetError::InvalidRequest(format!("total_chunks {}", request.total_chunks)))?;
    Ok(Upload {
        file: request.file.clone(),
        chunk_size,
        total_chunks,
        total_len,
    })
}

/// Stored name for an upload of `original`: `img_<uuid><ext>`.
fn stored_name(original: &str) -> String {
    let ext = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map_or_else(|| ".bin".to_string(), |e| format!(".{}", e.to_ascii_lowercase()));
    format!("img_{}{ext}", Uuid::now_v7().simple())
}

/// Reads one length-prefixed payload, or `None` on a clean EOF.
async fn read_payload(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, AssetError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::InvalidFrame(format!("frame announces {len} bytes")).into());
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Sends an error result, then drains the peer until it closes so the
/// result is not lost to a reset.
async fn refuse(stream: &mut TcpStream, reason: String) -> Result<(), AssetError> {
    write_control(stream, &ControlFrame::Result(TransferResponse::error(reason))).await?;
    stream.shutdown().await?;
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Ok(Some(_)) = read_payload(stream).await {}
    })
    .await;
    Ok(())
}

async fn write_control(stream: &mut TcpStream, control: &ControlFrame) -> Result<(), AssetError> {
    let text = codec::encode(control)?;
    stream
        .write_all(&framing::encode_frame(text.as_bytes())?)
        .await?;
    Ok(())
}

/// Handles one upload connection end to end.
///
/// # Errors
///
/// Returns an [`AssetError`] if the socket fails, the first frame is not a
/// transfer request, or the request is invalid. An error result frame is
/// sent to the peer before an invalid request is reported.
pub async fn handle_upload(
    mut stream: TcpStream,
    settings: Arc<AssetSettings>,
) -> Result<Option<String>, AssetError> {
    let Some(first) = read_payload(&mut stream).await? else {
        return Ok(None);
    };
    let request = match framing::classify(&first) {
        Ok(Frame::Control(ControlFrame::Transfer(request))) => request,
        Ok(_) => {
            refuse(&mut stream, "expected transfer request".to_string()).await?;
            return Err(AssetError::UnexpectedFrame);
        }
        Err(e) => {
            refuse(&mut stream, e.to_string()).await?;
            return Err(e.into());
        }
    };

    let upload = match validate(&request, &settings) {
        Ok(upload) => upload,
        Err(e) => {
            tracing::warn!(error = %e, file = %request.file, "transfer refused");
            refuse(&mut stream, e.to_string()).await?;
            return Err(e);
        }
    };
    tracing::info!(
        file = %upload.file,
        mode = %request.transfer_mode,
        total_chunks = upload.total_chunks,
        total_bytes = upload.total_len,
        "upload started"
    );

    let mut reassembler =
        Reassembler::new(upload.total_len, upload.total_chunks, upload.chunk_size);
    let mut acks_sent: u32 = 0;
    let mut sender_stats = None;

    while let Some(payload) = read_payload(&mut stream).await? {
        match framing::classify(&payload) {
            Ok(Frame::Chunk(chunk)) => {
                let chunk_id = chunk.header.chunk_id;
                if chunk.header.total_chunks != upload.total_chunks {
                    tracing::warn!(chunk_id, "chunk from a different upload ignored");
                    continue;
                }
                if settings.loss_rate > 0.0 && rand::random::<f64>() < settings.loss_rate {
                    tracing::debug!(chunk_id, "simulated loss");
                    continue;
                }
                match reassembler.add(chunk_id, chunk.payload) {
                    Ok(_) => {
                        write_control(&mut stream, &ControlFrame::Ack { chunk_id }).await?;
                        acks_sent += 1;
                    }
                    Err(e) => tracing::warn!(chunk_id, error = %e, "chunk rejected"),
                }
            }
            Ok(Frame::Control(ControlFrame::End { stats })) => {
                sender_stats = Some(stats);
                break;
            }
            Ok(Frame::Control(other)) => {
                tracing::warn!(frame = ?other, "unexpected control frame ignored");
            }
            Err(e) => tracing::warn!(error = %e, "invalid frame ignored"),
        }
    }

    let complete = reassembler.assemble();
    let base = stored_name(&upload.file);
    let (name, bytes) = match complete {
        Some(bytes) => (base, bytes),
        None => {
            tracing::warn!(
                file = %upload.file,
                missing = reassembler.missing().len(),
                "upload incomplete, storing partial"
            );
            (format!("{base}.partial"), reassembler.assemble_partial())
        }
    };
    tokio::fs::write(settings.received_dir.join(&name), &bytes).await?;
    tracing::info!(stored = %name, bytes = bytes.len(), "upload stored");

    if let Some(sent) = sender_stats {
        let stats = TransferStats {
            total_chunks: u32::from(upload.total_chunks),
            sent_chunks: sent.sent_chunks,
            retries: sent.retries,
            acks_received: acks_sent,
            total_bytes: request.total_bytes,
        };
        write_control(
            &mut stream,
            &ControlFrame::Result(TransferResponse::sent(name.clone(), stats)),
        )
        .await?;
    }
    Ok(Some(name))
}

/// Starts the asset service on `addr`.
///
/// Creates the received directory if needed. Returns the bound address
/// and the accept loop task.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the listener
/// cannot bind.
pub async fn start_asset_server(
    addr: &str,
    settings: AssetSettings,
) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    tokio::fs::create_dir_all(&settings.received_dir).await?;
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let settings = Arc::new(settings);

    let handle = tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "asset accept failed");
                    continue;
                }
            };
            let settings = Arc::clone(&settings);
            tokio::spawn(async move {
                if let Err(e) = handle_upload(stream, settings).await {
                    tracing::warn!(peer = %peer, error = %e, "upload ended with error");
                }
            });
        }
    });

    Ok((bound_addr, handle))
}
