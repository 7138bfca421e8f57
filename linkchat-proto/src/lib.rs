//! Shared protocol definitions for the `LinkChat` wire formats.
//!
//! Two channels are covered: the JSON message bus (registration, peer
//! lists, text messages) and the framed asset channel used for chunked
//! image uploads.

pub mod chunk;
pub mod codec;
pub mod envelope;
pub mod framing;
pub mod transfer;
