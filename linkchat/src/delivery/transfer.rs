//! Chunked asset transfers: the per-transfer state machine and the
//! algorithm that drives one transfer over a [`ChunkLink`].
//!
//! Both reliability modes run through [`drive`]; the mode only decides
//! whether each chunk waits for its acknowledgment (with bounded
//! retransmission) or is fired and forgotten.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use linkchat_proto::chunk::{ChunkHeader, pack_chunk};
use linkchat_proto::transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, TransferMode, TransferRequest, TransferResponse,
    TransferStats,
};

use super::link::{ChunkLink, LinkConnector, LinkError};

/// Default time to wait for each chunk acknowledgment in Reliable mode.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Opaque correlation token for one transfer.
pub type TransferId = Uuid;

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, nothing sent yet.
    Pending,
    /// Chunks are being sent.
    InFlight,
    /// Terminal: the upload finished.
    Completed,
    /// Terminal: see the transfer's failure reason.
    Failed,
}

impl TransferState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a transfer failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferFailure {
    /// A chunk was not acknowledged within the retry budget.
    #[error("chunk {chunk} not acknowledged after retries")]
    RetriesExhausted {
        /// Zero-based index of the chunk that gave up.
        chunk: u32,
    },
    /// The session ended while the transfer was running.
    #[error("connection closed")]
    ConnectionClosed,
    /// The asset channel failed.
    #[error("transport error: {0}")]
    TransportError(String),
    /// The service refused the upload.
    #[error("rejected by service: {0}")]
    Rejected(String),
}

impl From<LinkError> for TransferFailure {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Rejected(reason) => Self::Rejected(reason),
            other => Self::TransportError(other.to_string()),
        }
    }
}

/// Caller-tunable transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Reliability mode.
    pub mode: TransferMode,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
    /// Transmission attempts per chunk, the first send included (Reliable only).
    pub max_retries: u32,
    /// Wait per acknowledgment before retransmitting (Reliable only).
    pub ack_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            mode: TransferMode::Reliable,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

impl TransferOptions {
    /// Same options with a different mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Running counters of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    /// Distinct chunks handed to the link.
    pub chunks_sent: u32,
    /// Distinct chunks acknowledged.
    pub chunks_acked: u32,
    /// Retransmissions performed.
    pub retries_used: u32,
}

/// The record of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Correlation token.
    pub id: TransferId,
    /// Recipient of the asset message.
    pub peer: String,
    /// Original file name.
    pub file_name: String,
    /// Reliability mode.
    pub mode: TransferMode,
    /// Asset size in bytes.
    pub total_bytes: u64,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
    /// Transmission attempts allowed per chunk.
    pub max_retries: u32,
    /// `ceil(total_bytes / chunk_size)`.
    pub chunks_total: u32,
    /// Progress counters.
    pub counters: TransferCounters,
    /// Lifecycle state.
    pub state: TransferState,
    /// Set when `state` is `Failed`.
    pub failure: Option<TransferFailure>,
    /// Stored name reported by the service.
    pub filename: Option<String>,
}

impl Transfer {
    /// Percentage complete.
    ///
    /// Reliable transfers count acknowledged chunks, BestEffort transfers
    /// count sent chunks. A transfer with no chunks is always at 100.
    #[must_use]
    pub fn progress(&self) -> u8 {
        let done = match self.mode {
            TransferMode::Reliable => self.counters.chunks_acked,
            TransferMode::BestEffort => self.counters.chunks_sent,
        };
        progress_percent(done, self.chunks_total)
    }

    /// Statistics in wire form.
    #[must_use]
    pub const fn stats(&self) -> TransferStats {
        TransferStats {
            total_chunks: self.chunks_total,
            sent_chunks: self.counters.chunks_sent,
            retries: self.counters.retries_used,
            acks_received: self.counters.chunks_acked,
            total_bytes: self.total_bytes,
        }
    }
}

/// `round(done / total * 100)`, clamped to 100; 100 when `total` is 0.
#[must_use]
pub fn progress_percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u64::from(done) * 100 + u64::from(total) / 2) / u64::from(total);
    u8::try_from(pct.min(100)).unwrap_or(100)
}

/// Everything needed to run one transfer away from the client state.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Correlation token.
    pub id: TransferId,
    /// Recipient of the asset message.
    pub peer: String,
    /// Original file name.
    pub file_name: String,
    /// Asset bytes.
    pub data: Arc<[u8]>,
    /// Parameters.
    pub options: TransferOptions,
    /// Number of chunks.
    pub chunks_total: u16,
}

impl TransferJob {
    /// The opening request for this job.
    #[must_use]
    pub fn request(&self) -> TransferRequest {
        TransferRequest::new(
            self.file_name.clone(),
            self.options.mode,
            self.options.chunk_size,
            self.options.max_retries,
            self.data.len() as u64,
            u32::from(self.chunks_total),
        )
    }

    fn chunk_frame(&self, index: u16) -> Result<Vec<u8>, LinkError> {
        let size = self.options.chunk_size;
        let start = usize::from(index) * size;
        let end = (start + size).min(self.data.len());
        let header = ChunkHeader {
            total_len: u32::try_from(self.data.len()).unwrap_or(u32::MAX),
            offset: u32::try_from(start).unwrap_or(u32::MAX),
            chunk_id: index,
            total_chunks: self.chunks_total,
        };
        let metadata = (index == 0).then(|| {
            serde_json::json!({
                "file": self.file_name,
                "mode": self.options.mode.wire_name(),
            })
        });
        pack_chunk(&header, &self.data[start..end], metadata.as_ref())
            .map_err(|e| LinkError::Codec(e.into()))
    }
}

/// Counter snapshot published while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Which transfer.
    pub id: TransferId,
    /// Counters at this point.
    pub counters: TransferCounters,
}

/// How a driven transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Every chunk was handed over and the service answered.
    Finished(TransferResponse),
    /// The transfer stopped early.
    Failed(TransferFailure),
}

/// Final report of a driven transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Which transfer.
    pub id: TransferId,
    /// Final counters. `None` when the run was cancelled before reporting.
    pub counters: Option<TransferCounters>,
    /// How it ended.
    pub outcome: DriveOutcome,
}

impl TransferReport {
    /// A report for a transfer cancelled by the end of its session.
    #[must_use]
    pub const fn closed(id: TransferId) -> Self {
        Self {
            id,
            counters: None,
            outcome: DriveOutcome::Failed(TransferFailure::ConnectionClosed),
        }
    }
}

struct Tracker<'a> {
    id: TransferId,
    counters: TransferCounters,
    acked: HashSet<u16>,
    progress: Option<&'a mpsc::UnboundedSender<TransferProgress>>,
}

impl Tracker<'_> {
    fn ack(&mut self, chunk_id: u16) {
        if self.acked.insert(chunk_id) {
            self.counters.chunks_acked += 1;
        }
    }

    fn publish(&self) {
        if let Some(tx) = self.progress {
            let _ = tx.send(TransferProgress {
                id: self.id,
                counters: self.counters,
            });
        }
    }

    fn report(&self, outcome: DriveOutcome) -> TransferReport {
        TransferReport {
            id: self.id,
            counters: Some(self.counters),
            outcome,
        }
    }
}

/// Wait for the acknowledgment of `chunk_id`, recording any other
/// acknowledgments seen on the way.
async fn await_chunk_ack<L: ChunkLink>(
    link: &mut L,
    tracker: &mut Tracker<'_>,
    chunk_id: u16,
) -> Result<(), LinkError> {
    loop {
        let acked = link.next_ack().await?;
        tracker.ack(acked);
        if acked == chunk_id {
            return Ok(());
        }
        tracing::trace!(acked, waiting_for = chunk_id, "stale ack ignored");
    }
}

/// Run one transfer over an open link.
///
/// Reliable: exactly one chunk is outstanding at a time; a chunk is sent
/// at most `max_retries` times in total (at least once), each attempt
/// waiting `ack_timeout` for its acknowledgment. BestEffort: every chunk is sent
/// once, acknowledgments that happen to arrive are counted, nothing waits.
///
/// Counter snapshots are published on `progress` after every change.
pub async fn drive<L: ChunkLink>(
    job: &TransferJob,
    link: &mut L,
    progress: Option<&mpsc::UnboundedSender<TransferProgress>>,
) -> TransferReport {
    let mut tracker = Tracker {
        id: job.id,
        counters: TransferCounters::default(),
        acked: HashSet::new(),
        progress,
    };
    match run(job, link, &mut tracker).await {
        Ok(response) => tracker.report(DriveOutcome::Finished(response)),
        Err(failure) => {
            tracing::warn!(transfer_id = %job.id, %failure, "transfer failed");
            tracker.report(DriveOutcome::Failed(failure))
        }
    }
}

async fn run<L: ChunkLink>(
    job: &TransferJob,
    link: &mut L,
    tracker: &mut Tracker<'_>,
) -> Result<TransferResponse, TransferFailure> {
    link.open(&job.request()).await?;
    tracing::debug!(
        transfer_id = %job.id,
        peer = %job.peer,
        mode = %job.options.mode,
        chunks = job.chunks_total,
        "transfer opened"
    );

    for chunk_id in 0..job.chunks_total {
        let frame = job.chunk_frame(chunk_id)?;
        match job.options.mode {
            TransferMode::Reliable => {
                send_reliably(job, link, tracker, chunk_id, &frame).await?;
            }
            TransferMode::BestEffort => {
                link.send_chunk(&frame).await?;
                tracker.counters.chunks_sent += 1;
                while let Some(acked) = link.try_ack() {
                    tracker.ack(acked);
                }
            }
        }
        tracker.publish();
    }

    let stats = TransferStats {
        total_chunks: u32::from(job.chunks_total),
        sent_chunks: tracker.counters.chunks_sent,
        retries: tracker.counters.retries_used,
        acks_received: tracker.counters.chunks_acked,
        total_bytes: job.data.len() as u64,
    };
    let response = link.finish(&stats).await?;
    while let Some(acked) = link.try_ack() {
        tracker.ack(acked);
    }
    Ok(response)
}

async fn send_reliably<L: ChunkLink>(
    job: &TransferJob,
    link: &mut L,
    tracker: &mut Tracker<'_>,
    chunk_id: u16,
    frame: &[u8],
) -> Result<(), TransferFailure> {
    let max_retries = job.options.max_retries;
    for attempt in 0..max_retries.max(1) {
        link.send_chunk(frame).await?;
        if attempt == 0 {
            tracker.counters.chunks_sent += 1;
        } else {
            tracker.counters.retries_used += 1;
            tracker.publish();
        }

        match tokio::time::timeout(
            job.options.ack_timeout,
            await_chunk_ack(link, tracker, chunk_id),
        )
        .await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::debug!(
                    transfer_id = %job.id,
                    chunk_id,
                    attempt,
                    max_retries,
                    "ack timeout expired"
                );
            }
        }
    }
    Err(TransferFailure::RetriesExhausted {
        chunk: u32::from(chunk_id),
    })
}

/// Open a link through `links` and drive `job` over it.
pub async fn execute<C: LinkConnector>(
    job: &TransferJob,
    links: &C,
    progress: Option<&mpsc::UnboundedSender<TransferProgress>>,
) -> TransferReport {
    match links.connect().await {
        Ok(mut link) => drive(job, &mut link, progress).await,
        Err(e) => {
            tracing::warn!(transfer_id = %job.id, err = %e, "asset channel unavailable");
            TransferReport {
                id: job.id,
                counters: Some(TransferCounters::default()),
                outcome: DriveOutcome::Failed(e.into()),
            }
        }
    }
}
