//! Message bus envelope types.
//!
//! Every frame on the persistent bus connection is a JSON object with a
//! `type` discriminator. Clients send [`ClientEnvelope`]s; the bus sends
//! [`ServerEnvelope`]s. Clients never decode `ServerEnvelope` directly:
//! they go through [`crate::codec::decode_inbound`], which produces the
//! lenient [`Inbound`] view.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::CodecError;

/// Envelopes sent from a client to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Registers the display name for this connection. Sent once per session.
    Register {
        /// Display name to register.
        #[serde(alias = "identity")]
        username: String,
    },
    /// Requests the current peer list.
    List,
    /// A text message addressed to a single peer.
    Message {
        /// Recipient display name.
        to: String,
        /// Message body.
        #[serde(alias = "content")]
        msg: String,
    },
}

/// Envelopes sent from the bus to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Informs a freshly registered client of the address the bus sees for it.
    IpAssigned {
        /// Observed network address.
        ip: String,
        /// The registered name the address belongs to.
        username: String,
    },
    /// Response to a [`ClientEnvelope::List`] request.
    List {
        /// Currently registered names, including the requester.
        users: Vec<String>,
        /// Known addresses keyed by name.
        #[serde(rename = "userIPs")]
        user_ips: BTreeMap<String, String>,
        /// Name of the requesting client.
        #[serde(rename = "currentUser")]
        current_user: String,
    },
    /// Unsolicited peer list broadcast on join or leave.
    UserListUpdate {
        /// Currently registered names.
        users: Vec<String>,
        /// Known addresses keyed by name.
        #[serde(rename = "userIPs")]
        user_ips: BTreeMap<String, String>,
    },
    /// A routed text message.
    Message {
        /// Sender name, enforced by the bus.
        from: String,
        /// Recipient name.
        to: String,
        /// Message body.
        msg: String,
    },
    /// The bus rejected a request.
    Error {
        /// Human-readable reason.
        reason: String,
    },
}

/// A text message as seen by a receiving client.
///
/// Both addressing fields are optional: a message with neither is still
/// delivered to the conversation layer, which attributes it to an
/// unknown sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender name (`from`, or legacy `username`).
    pub from: Option<String>,
    /// Recipient name.
    pub to: Option<String>,
    /// Body (`msg`, or legacy `content`); empty when absent.
    pub content: String,
}

/// A peer list as seen by a receiving client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerListUpdate {
    /// Registered names, in bus order, without empty entries.
    pub users: Vec<String>,
    /// Non-empty addresses keyed by name.
    pub addresses: BTreeMap<String, String>,
}

/// Lenient client-side view of a bus envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A routed text message (or the bus echo of our own send).
    Message(InboundMessage),
    /// A `list`, `user_list` or `user_list_update` envelope.
    PeerList(PeerListUpdate),
    /// The bus reported the address it observed for a registered name.
    AddressAssigned {
        /// Observed address.
        ip: String,
        /// Name the address belongs to, if the bus said.
        identity: Option<String>,
    },
    /// The bus rejected a request.
    Error {
        /// Human-readable reason.
        reason: String,
    },
    /// An envelope type this client does not handle.
    Unknown(String),
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn owned_field(value: &Value, key: &str) -> Option<String> {
    str_field(value, key).map(str::to_owned)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn parse_addresses(value: &Value) -> BTreeMap<String, String> {
    let map = value
        .get("addresses")
        .and_then(Value::as_object)
        .or_else(|| value.get("userIPs").and_then(Value::as_object));
    map.into_iter()
        .flatten()
        .filter_map(|(name, addr)| {
            let addr = addr.as_str()?.trim();
            (!name.is_empty() && !addr.is_empty()).then(|| (name.clone(), addr.to_owned()))
        })
        .collect()
}

/// Builds an [`Inbound`] from a parsed JSON value.
pub(crate) fn parse_inbound(value: &Value) -> Result<Inbound, CodecError> {
    if !value.is_object() {
        return Err(CodecError::MalformedEnvelope("envelope is not an object".into()));
    }
    let kind = str_field(value, "type")
        .ok_or_else(|| CodecError::MalformedEnvelope("missing type".into()))?;

    match kind {
        "message" => Ok(Inbound::Message(InboundMessage {
            from: non_empty(owned_field(value, "from").or_else(|| owned_field(value, "username"))),
            to: non_empty(owned_field(value, "to")),
            content: owned_field(value, "msg")
                .or_else(|| owned_field(value, "content"))
                .unwrap_or_default(),
        })),
        "list" | "user_list" | "user_list_update" => {
            let users = value
                .get("users")
                .and_then(Value::as_array)
                .ok_or_else(|| CodecError::MalformedEnvelope(format!("{kind} without users")))?;
            let mut seen = std::collections::HashSet::new();
            let users = users
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|u| !u.is_empty() && seen.insert(*u))
                .map(str::to_owned)
                .collect();
            Ok(Inbound::PeerList(PeerListUpdate {
                users,
                addresses: parse_addresses(value),
            }))
        }
        "ip_assigned" => {
            let ip = non_empty(owned_field(value, "ip"))
                .ok_or_else(|| CodecError::MalformedEnvelope("ip_assigned without ip".into()))?;
            Ok(Inbound::AddressAssigned {
                ip,
                identity: non_empty(owned_field(value, "username")),
            })
        }
        "error" => Ok(Inbound::Error {
            reason: owned_field(value, "reason").unwrap_or_else(|| "unspecified".into()),
        }),
        other => Ok(Inbound::Unknown(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{CodecError, decode_inbound};

    use super::*;

    #[test]
    fn legacy_message_fields() {
        let env = decode_inbound(r#"{"type":"message","username":"bob","content":"old"}"#).unwrap();
        assert_eq!(
            env,
            Inbound::Message(InboundMessage {
                from: Some("bob".into()),
                to: None,
                content: "old".into(),
            })
        );
    }

    #[test]
    fn message_without_addressing_still_decodes() {
        let env = decode_inbound(r#"{"type":"message","msg":"who am i"}"#).unwrap();
        let Inbound::Message(m) = env else {
            panic!("expected message");
        };
        assert!(m.from.is_none());
        assert!(m.to.is_none());
        assert_eq!(m.content, "who am i");
    }

    #[test]
    fn non_string_sender_is_treated_as_absent() {
        let env = decode_inbound(r#"{"type":"message","from":42,"to":"alice","msg":"x"}"#).unwrap();
        let Inbound::Message(m) = env else {
            panic!("expected message");
        };
        assert!(m.from.is_none());
        assert_eq!(m.to.as_deref(), Some("alice"));
    }

    #[test]
    fn list_with_user_ips() {
        let text = r#"{"type":"list","users":["alice","bob","bob",""],"userIPs":{"bob":"10.0.0.2","alice":""},"currentUser":"alice"}"#;
        let Inbound::PeerList(update) = decode_inbound(text).unwrap() else {
            panic!("expected peer list");
        };
        assert_eq!(update.users, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(update.addresses.len(), 1);
        assert_eq!(update.addresses.get("bob").map(String::as_str), Some("10.0.0.2"));
    }

    #[test]
    fn user_list_with_addresses_key() {
        let text = r#"{"type":"user_list","users":["carol"],"addresses":{"carol":"10.0.0.3"}}"#;
        let Inbound::PeerList(update) = decode_inbound(text).unwrap() else {
            panic!("expected peer list");
        };
        assert_eq!(update.users, vec!["carol".to_string()]);
        assert_eq!(update.addresses.get("carol").map(String::as_str), Some("10.0.0.3"));
    }

    #[test]
    fn list_without_users_is_malformed() {
        assert!(matches!(
            decode_inbound(r#"{"type":"list"}"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn ip_assigned_round_trip() {
        let text = crate::codec::encode(&ServerEnvelope::IpAssigned {
            ip: "127.0.0.1".into(),
            username: "alice".into(),
        })
        .unwrap();
        assert_eq!(
            decode_inbound(&text).unwrap(),
            Inbound::AddressAssigned {
                ip: "127.0.0.1".into(),
                identity: Some("alice".into()),
            }
        );
    }

    #[test]
    fn unknown_type_is_preserved() {
        assert_eq!(
            decode_inbound(r#"{"type":"typing","from":"bob"}"#).unwrap(),
            Inbound::Unknown("typing".into())
        );
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(decode_inbound(r#"{"from":"bob"}"#).is_err());
        assert!(decode_inbound("[1,2,3]").is_err());
    }
}
