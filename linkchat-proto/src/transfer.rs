//! Asset channel protocol: transfer requests, acknowledgments and results.
//!
//! An asset upload is a single connection carrying, in order:
//!
//! ```text
//! client -> service   ControlFrame::Transfer(TransferRequest)
//! client -> service   chunk frames (see crate::chunk)
//! service -> client   ControlFrame::Ack { chunk_id }      (one per accepted chunk)
//! client -> service   ControlFrame::End { stats }
//! service -> client   ControlFrame::Result(TransferResponse)
//! ```
//!
//! Field names and mode spellings follow the upload form the service has
//! always accepted (`file`, `transfer_mode`, `chunk_size`, `max_retries`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default number of transmission attempts per chunk in reliable mode.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Path prefix under which the service publishes stored assets.
pub const RECEIVED_PREFIX: &str = "/received/";

/// Marker that opens a rich-content message referencing a stored image.
pub const IMAGE_TAG: &str = "[image] ";

/// Delivery reliability for an asset transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferMode {
    /// Per-chunk acknowledgment with bounded retransmission.
    #[default]
    #[serde(rename = "FIABLE")]
    Reliable,
    /// Fire-and-forget: no acknowledgment gating, no retransmission.
    #[serde(rename = "SEMI-FIABLE")]
    BestEffort,
}

impl TransferMode {
    /// The spelling used on the wire.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Reliable => "FIABLE",
            Self::BestEffort => "SEMI-FIABLE",
        }
    }

    /// Whether completion is gated on acknowledgments.
    #[must_use]
    pub const fn requires_ack(self) -> bool {
        matches!(self, Self::Reliable)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Error returned when parsing an unrecognized transfer mode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transfer mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for TransferMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIABLE" | "RELIABLE" => Ok(Self::Reliable),
            "SEMI-FIABLE" | "SEMI" | "BEST-EFFORT" | "BESTEFFORT" => Ok(Self::BestEffort),
            _ => Err(UnknownMode(s.to_owned())),
        }
    }
}

/// Number of chunks needed for `total_bytes` at `chunk_size`.
///
/// Returns 0 for an empty asset or a zero chunk size.
#[must_use]
pub const fn chunk_count(total_bytes: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_bytes.div_ceil(chunk_size as u64)
}

fn default_chunk_size() -> String {
    DEFAULT_CHUNK_SIZE.to_string()
}

fn default_max_retries() -> String {
    DEFAULT_MAX_RETRIES.to_string()
}

/// Opening frame of an asset upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Original file name supplied by the user.
    pub file: String,
    /// Requested reliability mode.
    pub transfer_mode: TransferMode,
    /// Chunk size, string-encoded.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,
    /// Retransmission budget per chunk, string-encoded.
    #[serde(default = "default_max_retries")]
    pub max_retries: String,
    /// Size of the asset in bytes.
    pub total_bytes: u64,
    /// Number of chunk frames that will follow.
    pub total_chunks: u32,
}

impl TransferRequest {
    /// Builds a request, string-encoding the numeric fields.
    #[must_use]
    pub fn new(
        file: impl Into<String>,
        transfer_mode: TransferMode,
        chunk_size: usize,
        max_retries: u32,
        total_bytes: u64,
        total_chunks: u32,
    ) -> Self {
        Self {
            file: file.into(),
            transfer_mode,
            chunk_size: chunk_size.to_string(),
            max_retries: max_retries.to_string(),
            total_bytes,
            total_chunks,
        }
    }

    /// Parsed chunk size, or `None` if the field is not an integer.
    #[must_use]
    pub fn chunk_size_value(&self) -> Option<usize> {
        self.chunk_size.trim().parse().ok()
    }

    /// Parsed retry budget, or `None` if the field is not an integer.
    #[must_use]
    pub fn max_retries_value(&self) -> Option<u32> {
        self.max_retries.trim().parse().ok()
    }
}

/// Per-transfer statistics, reported by both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Chunks the asset was split into.
    pub total_chunks: u32,
    /// Chunk frames handed to the transport (first transmissions only).
    pub sent_chunks: u32,
    /// Retransmissions performed.
    pub retries: u32,
    /// Distinct chunks acknowledged.
    pub acks_received: u32,
    /// Asset size in bytes.
    pub total_bytes: u64,
}

/// Outcome reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// The upload was accepted.
    Sent,
    /// The upload was rejected.
    Error,
}

/// Closing frame of an asset upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResponse {
    /// Whether the service accepted the upload.
    pub status: TransferStatus,
    /// Name under which the asset was stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Service-side statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TransferStats>,
    /// Rejection reason when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferResponse {
    /// An accepted upload.
    #[must_use]
    pub fn sent(filename: impl Into<String>, stats: TransferStats) -> Self {
        Self {
            status: TransferStatus::Sent,
            filename: Some(filename.into()),
            stats: Some(stats),
            error: None,
        }
    }

    /// A rejected upload.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: TransferStatus::Error,
            filename: None,
            stats: None,
            error: Some(reason.into()),
        }
    }
}

/// JSON control frames on the asset channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Opens an upload.
    Transfer(TransferRequest),
    /// Acknowledges one chunk.
    Ack {
        /// Zero-based chunk index.
        chunk_id: u16,
    },
    /// Sender has handed over every chunk.
    End {
        /// Sender-side statistics.
        stats: TransferStats,
    },
    /// Final verdict from the service.
    Result(TransferResponse),
}

/// A stored asset, addressable by a convention-based path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetReference {
    filename: String,
}

impl AssetReference {
    /// Wraps a stored file name.
    ///
    /// Returns `None` for names that cannot address a stored asset: empty,
    /// containing a path separator, or a relative component.
    #[must_use]
    pub fn new(filename: impl Into<String>) -> Option<Self> {
        let filename = filename.into();
        let trimmed = filename.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed == "."
            || trimmed == ".."
        {
            return None;
        }
        Some(Self {
            filename: trimmed.to_owned(),
        })
    }

    /// Stored file name.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Fetch path, e.g. `/received/img_1234.png`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{RECEIVED_PREFIX}{}", self.filename)
    }

    /// Text of the rich-content message announcing this asset.
    #[must_use]
    pub fn to_message(&self) -> String {
        format!("{IMAGE_TAG}{}", self.path())
    }

    /// Recognizes a rich-content message produced by [`Self::to_message`].
    #[must_use]
    pub fn parse_message(text: &str) -> Option<Self> {
        text.strip_prefix(IMAGE_TAG)?
            .strip_prefix(RECEIVED_PREFIX)
            .and_then(Self::new)
    }
}
