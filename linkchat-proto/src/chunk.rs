//! Binary chunk frames and receiver-side reassembly.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! magic "IMGC" (4) | version (1) | total_len (4) | offset (4) | chunk_id (2)
//! | total_chunks (2) | flags (1) | digest (16) | meta_len (2) | metadata | payload
//! ```
//!
//! `digest` is the first 16 bytes of the SHA-256 of the payload. Metadata
//! is an optional JSON object, present only when [`FLAG_HAS_METADATA`] is set.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Leading bytes of every chunk frame.
pub const MAGIC: [u8; 4] = *b"IMGC";

/// Current chunk format version.
pub const VERSION: u8 = 2;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 4 + 1 + 4 + 4 + 2 + 2 + 1 + 16 + 2;

/// Set when a JSON metadata block follows the header.
pub const FLAG_HAS_METADATA: u8 = 0x2;

const DIGEST_LEN: usize = 16;

/// Errors from packing or unpacking chunk frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// The frame is shorter than its header claims.
    #[error("chunk frame too short: {0} bytes")]
    TooShort(usize),
    /// The frame does not start with [`MAGIC`].
    #[error("bad chunk magic")]
    BadMagic,
    /// The frame uses a version this build does not understand.
    #[error("unsupported chunk version {0}")]
    UnsupportedVersion(u8),
    /// The metadata block does not fit in the 16-bit length field.
    #[error("chunk metadata too large: {0} bytes")]
    MetadataTooLarge(usize),
    /// The metadata block is not valid JSON.
    #[error("invalid chunk metadata: {0}")]
    InvalidMetadata(String),
    /// The payload digest does not match.
    #[error("integrity check failed for chunk {0}")]
    IntegrityMismatch(u16),
    /// The chunk index is outside the announced range.
    #[error("chunk {chunk_id} out of range (total {total})")]
    OutOfRange {
        /// Offending index.
        chunk_id: u16,
        /// Announced chunk count.
        total: u16,
    },
}

/// Position of a chunk within its asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Size of the whole asset in bytes.
    pub total_len: u32,
    /// Byte offset of this chunk's payload.
    pub offset: u32,
    /// Zero-based chunk index.
    pub chunk_id: u16,
    /// Number of chunks in the asset.
    pub total_chunks: u16,
}

/// An unpacked chunk frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<'a> {
    /// Position information.
    pub header: ChunkHeader,
    /// Optional JSON metadata.
    pub metadata: Option<serde_json::Value>,
    /// Verified payload bytes.
    pub payload: &'a [u8],
}

fn digest(payload: &[u8]) -> [u8; DIGEST_LEN] {
    let full = Sha256::digest(payload);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&full[..DIGEST_LEN]);
    out
}

/// Returns true if `bytes` begins with the chunk magic.
#[must_use]
pub fn is_chunk(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

/// Packs a chunk frame.
///
/// # Errors
///
/// Returns [`ChunkError::MetadataTooLarge`] if the serialized metadata
/// exceeds 65535 bytes.
pub fn pack_chunk(
    header: &ChunkHeader,
    payload: &[u8],
    metadata: Option<&serde_json::Value>,
) -> Result<Vec<u8>, ChunkError> {
    let meta_bytes = match metadata {
        Some(m) => {
            serde_json::to_vec(m).map_err(|e| ChunkError::InvalidMetadata(e.to_string()))?
        }
        None => Vec::new(),
    };
    let meta_len = u16::try_from(meta_bytes.len())
        .map_err(|_| ChunkError::MetadataTooLarge(meta_bytes.len()))?;
    let flags = if metadata.is_some() {
        FLAG_HAS_METADATA
    } else {
        0
    };

    let mut frame = Vec::with_capacity(HEADER_SIZE + meta_bytes.len() + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.push(VERSION);
    frame.extend_from_slice(&header.total_len.to_be_bytes());
    frame.extend_from_slice(&header.offset.to_be_bytes());
    frame.extend_from_slice(&header.chunk_id.to_be_bytes());
    frame.extend_from_slice(&header.total_chunks.to_be_bytes());
    frame.push(flags);
    frame.extend_from_slice(&digest(payload));
    frame.extend_from_slice(&meta_len.to_be_bytes());
    frame.extend_from_slice(&meta_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Unpacks and verifies a chunk frame.
///
/// # Errors
///
/// Returns a [`ChunkError`] if the frame is truncated, has the wrong magic
/// or version, carries invalid metadata, or fails the integrity check.
pub fn unpack_chunk(bytes: &[u8]) -> Result<Chunk<'_>, ChunkError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ChunkError::TooShort(bytes.len()));
    }
    if !is_chunk(bytes) {
        return Err(ChunkError::BadMagic);
    }
    if bytes[4] != VERSION {
        return Err(ChunkError::UnsupportedVersion(bytes[4]));
    }

    let header = ChunkHeader {
        total_len: be_u32(bytes, 5),
        offset: be_u32(bytes, 9),
        chunk_id: be_u16(bytes, 13),
        total_chunks: be_u16(bytes, 15),
    };
    let flags = bytes[17];
    let expected_digest = &bytes[18..18 + DIGEST_LEN];
    let meta_len = usize::from(be_u16(bytes, 18 + DIGEST_LEN));

    let data_start = HEADER_SIZE + meta_len;
    if bytes.len() < data_start {
        return Err(ChunkError::TooShort(bytes.len()));
    }

    let metadata = if flags & FLAG_HAS_METADATA == 0 {
        None
    } else {
        Some(
            serde_json::from_slice(&bytes[HEADER_SIZE..data_start])
                .map_err(|e| ChunkError::InvalidMetadata(e.to_string()))?,
        )
    };

    let payload = &bytes[data_start..];
    if digest(payload) != expected_digest {
        return Err(ChunkError::IntegrityMismatch(header.chunk_id));
    }

    Ok(Chunk {
        header,
        metadata,
        payload,
    })
}

/// Collects chunks of one asset and rebuilds it.
///
/// Duplicate chunks are accepted and ignored; chunks can arrive in any
/// order.
#[derive(Debug)]
pub struct Reassembler {
    total_len: usize,
    total_chunks: u16,
    chunk_size: usize,
    received: BTreeMap<u16, Vec<u8>>,
}

impl Reassembler {
    /// Creates a reassembler for an asset of `total_len` bytes split into
    /// `total_chunks` chunks of `chunk_size` bytes.
    #[must_use]
    pub const fn new(total_len: usize, total_chunks: u16, chunk_size: usize) -> Self {
        Self {
            total_len,
            total_chunks,
            chunk_size,
            received: BTreeMap::new(),
        }
    }

    /// Adds a chunk payload. Returns `Ok(true)` if the chunk was new.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::OutOfRange`] if `chunk_id` is not below the
    /// announced chunk count.
    pub fn add(&mut self, chunk_id: u16, payload: &[u8]) -> Result<bool, ChunkError> {
        if chunk_id >= self.total_chunks {
            return Err(ChunkError::OutOfRange {
                chunk_id,
                total: self.total_chunks,
            });
        }
        if self.received.contains_key(&chunk_id) {
            return Ok(false);
        }
        self.received.insert(chunk_id, payload.to_vec());
        Ok(true)
    }

    /// Number of distinct chunks received.
    #[must_use]
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// True once every chunk has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received.len() == usize::from(self.total_chunks)
    }

    /// Indices not yet received, ascending.
    #[must_use]
    pub fn missing(&self) -> Vec<u16> {
        (0..self.total_chunks)
            .filter(|id| !self.received.contains_key(id))
            .collect()
    }

    /// Percentage of chunks received, rounded down. An empty asset is 100%.
    #[must_use]
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        let pct = self.received.len() * 100 / usize::from(self.total_chunks);
        u8::try_from(pct).unwrap_or(100)
    }

    /// Concatenates all chunks, or `None` if any is missing or the result
    /// does not have the announced length.
    #[must_use]
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.total_len);
        for part in self.received.values() {
            out.extend_from_slice(part);
        }
        out.truncate(self.total_len);
        (out.len() == self.total_len).then_some(out)
    }

    /// Rebuilds the asset with missing chunks zero-filled.
    #[must_use]
    pub fn assemble_partial(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_len];
        for (&id, part) in &self.received {
            let start = usize::from(id).saturating_mul(self.chunk_size);
            if start >= self.total_len {
                continue;
            }
            let end = (start + part.len()).min(self.total_len);
            out[start..end].copy_from_slice(&part[..end - start]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(chunk_id: u16, total_chunks: u16) -> ChunkHeader {
        ChunkHeader {
            total_len: 10,
            offset: u32::from(chunk_id) * 4,
            chunk_id,
            total_chunks,
        }
    }

    #[test]
    fn pack_unpack_preserves_payload_and_position() {
        let frame = pack_chunk(&header(1, 3), b"abcd", None).unwrap();
        assert!(is_chunk(&frame));
        let chunk = unpack_chunk(&frame).unwrap();
        assert_eq!(chunk.header, header(1, 3));
        assert_eq!(chunk.payload, b"abcd");
        assert!(chunk.metadata.is_none());
    }

    #[test]
    fn metadata_travels_with_first_chunk() {
        let meta = serde_json::json!({ "image_type": "png" });
        let frame = pack_chunk(&header(0, 3), b"abcd", Some(&meta)).unwrap();
        let chunk = unpack_chunk(&frame).unwrap();
        assert_eq!(chunk.metadata, Some(meta));
        assert_eq!(chunk.payload, b"abcd");
    }

    #[test]
    fn corrupted_payload_fails_integrity() {
        let mut frame = pack_chunk(&header(2, 3), b"ab", None).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert_eq!(unpack_chunk(&frame), Err(ChunkError::IntegrityMismatch(2)));
    }

    #[test]
    fn rejects_bad_magic_version_and_truncation() {
        let frame = pack_chunk(&header(0, 1), b"x", None).unwrap();

        let mut bad_magic = frame.clone();
        bad_magic[0] = b'X';
        assert_eq!(unpack_chunk(&bad_magic), Err(ChunkError::BadMagic));

        let mut bad_version = frame.clone();
        bad_version[4] = 9;
        assert_eq!(unpack_chunk(&bad_version), Err(ChunkError::UnsupportedVersion(9)));

        assert!(matches!(
            unpack_chunk(&frame[..10]),
            Err(ChunkError::TooShort(10))
        ));
    }

    #[test]
    fn reassembles_out_of_order_with_duplicates() {
        let mut r = Reassembler::new(10, 3, 4);
        assert!(r.add(2, b"ij").unwrap());
        assert!(r.add(0, b"abcd").unwrap());
        assert!(!r.add(0, b"abcd").unwrap());
        assert_eq!(r.missing(), vec![1]);
        assert_eq!(r.progress(), 66);
        assert!(r.assemble().is_none());

        assert!(r.add(1, b"efgh").unwrap());
        assert!(r.is_complete());
        assert_eq!(r.assemble().unwrap(), b"abcdefghij");
    }

    #[test]
    fn partial_assembly_zero_fills_gaps() {
        let mut r = Reassembler::new(10, 3, 4);
        r.add(0, b"abcd").unwrap();
        r.add(2, b"ij").unwrap();
        assert_eq!(r.assemble_partial(), b"abcd\0\0\0\0ij");
    }

    #[test]
    fn out_of_range_chunk_is_rejected() {
        let mut r = Reassembler::new(10, 3, 4);
        assert_eq!(
            r.add(3, b"zz"),
            Err(ChunkError::OutOfRange {
                chunk_id: 3,
                total: 3
            })
        );
    }
}
