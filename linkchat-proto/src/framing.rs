//! Length-prefixed framing for the asset channel.
//!
//! Wire format: `[u32 length (BE)][payload bytes]`. A payload is either a
//! binary chunk frame (it starts with [`crate::chunk::MAGIC`]) or a JSON
//! [`ControlFrame`].

use crate::chunk::{self, Chunk};
use crate::codec::{self, CodecError};
use crate::transfer::ControlFrame;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Largest payload accepted in a single frame (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A classified asset-channel payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<'a> {
    /// A verified binary chunk.
    Chunk(Chunk<'a>),
    /// A JSON control frame.
    Control(ControlFrame),
}

/// Prefixes `payload` with its big-endian length.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the payload exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = frame_len(payload.len())?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Validates a payload length and converts it to the prefix type.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if `len` exceeds [`MAX_FRAME_LEN`].
pub fn frame_len(len: usize) -> Result<u32, CodecError> {
    if len > MAX_FRAME_LEN {
        return Err(CodecError::InvalidFrame(format!(
            "payload too large for framing: {len} bytes (max {MAX_FRAME_LEN})"
        )));
    }
    u32::try_from(len).map_err(|_| CodecError::InvalidFrame(format!("payload length {len}")))
}

/// Splits one frame off the front of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the payload
/// and the number of bytes consumed including the prefix.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the prefix announces more than
/// [`MAX_FRAME_LEN`] bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(&[u8], usize)>, CodecError> {
    let Some(prefix) = bytes.get(..LENGTH_PREFIX) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    len_bytes.copy_from_slice(prefix);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(CodecError::InvalidFrame(format!(
            "frame announces {payload_len} bytes (max {MAX_FRAME_LEN})"
        )));
    }
    let total = LENGTH_PREFIX + payload_len;
    Ok(bytes
        .get(LENGTH_PREFIX..total)
        .map(|payload| (payload, total)))
}

/// Classifies a frame payload as a chunk or a control frame.
///
/// # Errors
///
/// Returns `CodecError::Chunk` if a chunk fails to unpack, or
/// `CodecError::MalformedEnvelope` if a control frame is not valid JSON.
pub fn classify(payload: &[u8]) -> Result<Frame<'_>, CodecError> {
    if chunk::is_chunk(payload) {
        Ok(Frame::Chunk(chunk::unpack_chunk(payload)?))
    } else {
        Ok(Frame::Control(codec::decode_bytes(payload)?))
    }
}
