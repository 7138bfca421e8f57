//! Serialization and deserialization for the `LinkChat` wire protocol.
//!
//! Bus envelopes and asset-channel control frames travel as JSON text.
//! Outbound encoding is strict; inbound decoding of bus envelopes is
//! lenient (see [`decode_inbound`]) so that a peer or server speaking a
//! slightly different dialect never tears down the session.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::chunk::ChunkError;
use crate::envelope::{Inbound, parse_inbound};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The input was not a recognizable envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// Frame is incomplete or has an invalid length prefix.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// A binary chunk frame failed to unpack.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
}

/// Encodes any protocol value as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a strictly-typed protocol value from JSON text.
///
/// # Errors
///
/// Returns `CodecError::MalformedEnvelope` if the text does not match `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
}

/// Decodes a strictly-typed protocol value from JSON bytes.
///
/// # Errors
///
/// Returns `CodecError::MalformedEnvelope` if the bytes do not match `T`.
pub fn decode_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
}

/// Decodes a bus envelope received by a client.
///
/// Accepts the legacy field spellings (`username` for `from`, `content`
/// for `msg`, `userIPs` for `addresses`) and tolerates missing optional
/// fields. Only input that is not a JSON object with a string `type`, or
/// that lacks a field the envelope kind cannot do without, is rejected.
///
/// # Errors
///
/// Returns `CodecError::MalformedEnvelope` for unusable input.
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))?;
    parse_inbound(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ClientEnvelope, ServerEnvelope};

    #[test]
    fn client_envelopes_use_type_tag() {
        let register = encode(&ClientEnvelope::Register {
            username: "alice".into(),
        })
        .unwrap();
        assert_eq!(register, r#"{"type":"register","username":"alice"}"#);

        let list = encode(&ClientEnvelope::List).unwrap();
        assert_eq!(list, r#"{"type":"list"}"#);

        let message = encode(&ClientEnvelope::Message {
            to: "bob".into(),
            msg: "hi".into(),
        })
        .unwrap();
        assert_eq!(message, r#"{"type":"message","to":"bob","msg":"hi"}"#);
    }

    #[test]
    fn register_accepts_identity_alias() {
        let env: ClientEnvelope = decode(r#"{"type":"register","identity":"carol"}"#).unwrap();
        assert_eq!(
            env,
            ClientEnvelope::Register {
                username: "carol".into()
            }
        );
    }

    #[test]
    fn message_accepts_content_alias() {
        let env: ClientEnvelope =
            decode(r#"{"type":"message","to":"bob","content":"yo"}"#).unwrap();
        assert_eq!(
            env,
            ClientEnvelope::Message {
                to: "bob".into(),
                msg: "yo".into()
            }
        );
    }

    #[test]
    fn server_message_decodes_inbound() {
        let text = encode(&ServerEnvelope::Message {
            from: "bob".into(),
            to: "alice".into(),
            msg: "hello".into(),
        })
        .unwrap();
        match decode_inbound(&text).unwrap() {
            Inbound::Message(m) => {
                assert_eq!(m.from.as_deref(), Some("bob"));
                assert_eq!(m.to.as_deref(), Some("alice"));
                assert_eq!(m.content, "hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn decode_garbage_is_malformed() {
        assert!(matches!(
            decode_inbound("not json at all"),
            Err(CodecError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode::<ClientEnvelope>(r#"{"type":"teleport"}"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }
}
