//! Conversation Store: per-peer message history and unread counters.
//!
//! Locally sent messages are recorded at send time and are the record of
//! truth. The bus may echo our own sends back; such echoes are recognised
//! by sender equality with the local identity and are never displayed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use linkchat_proto::envelope::InboundMessage;

/// Sender attributed to inbound messages that carry no addressing.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Sent by this session.
    Local,
    /// Received from a peer.
    Remote,
}

/// One entry in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Sender name.
    pub from: String,
    /// Recipient name.
    pub to: String,
    /// Message body.
    pub content: String,
    /// Local or remote authorship.
    pub origin: Origin,
    /// When this client recorded the message.
    pub at: DateTime<Utc>,
}

/// What [`ConversationStore::record_inbound`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Appended as a Remote message.
    Recorded {
        /// Conversation partner.
        peer: String,
        /// Whether the unread counter was incremented.
        unread: bool,
    },
    /// The bus echo of one of our own sends; nothing was appended.
    EchoSuppressed {
        /// The recipient of the original send, if known.
        peer: Option<String>,
    },
}

/// Message history partitioned by peer.
#[derive(Debug, Default)]
pub struct ConversationStore {
    local_identity: Option<String>,
    order: Vec<String>,
    conversations: HashMap<String, Vec<ChatMessage>>,
    unread: HashMap<String, u32>,
    active: Option<String>,
}

impl ConversationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity used for echo detection and as the local sender.
    pub fn set_local_identity(&mut self, identity: impl Into<String>) {
        self.local_identity = Some(identity.into());
    }

    /// Open a conversation without sending anything. Idempotent.
    pub fn open(&mut self, peer: &str) {
        if !self.conversations.contains_key(peer) {
            self.order.push(peer.to_string());
            self.conversations.insert(peer.to_string(), Vec::new());
        }
    }

    fn append(&mut self, peer: &str, message: ChatMessage) {
        self.open(peer);
        if let Some(history) = self.conversations.get_mut(peer) {
            history.push(message);
        }
    }

    /// Append a locally originated message.
    pub fn record_local_send(&mut self, peer: &str, content: &str) -> ChatMessage {
        let message = ChatMessage {
            from: self.local_identity.clone().unwrap_or_default(),
            to: peer.to_string(),
            content: content.to_string(),
            origin: Origin::Local,
            at: Utc::now(),
        };
        self.append(peer, message.clone());
        message
    }

    /// Record an inbound message.
    ///
    /// An envelope whose sender is the local identity is our own send
    /// echoed back: the partner's conversation is opened but nothing is
    /// appended. Anything else is appended as Remote under its sender,
    /// defaulting to [`UNKNOWN_SENDER`].
    pub fn record_inbound(&mut self, envelope: &InboundMessage) -> InboundOutcome {
        let me = self.local_identity.as_deref();
        if me.is_some() && envelope.from.as_deref() == me {
            if let Some(peer) = &envelope.to {
                self.open(peer);
            }
            tracing::debug!(to = ?envelope.to, "suppressed self echo");
            return InboundOutcome::EchoSuppressed {
                peer: envelope.to.clone(),
            };
        }

        let peer = envelope
            .from
            .clone()
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let to = envelope
            .to
            .clone()
            .or_else(|| self.local_identity.clone())
            .unwrap_or_default();
        let message = ChatMessage {
            from: peer.clone(),
            to,
            content: envelope.content.clone(),
            origin: Origin::Remote,
            at: Utc::now(),
        };
        self.append(&peer, message);

        let unread = self.active.as_deref() != Some(peer.as_str());
        if unread {
            self.increment_unread(&peer);
        }
        InboundOutcome::Recorded { peer, unread }
    }

    /// Count one more unread message for `peer`.
    pub fn increment_unread(&mut self, peer: &str) {
        *self.unread.entry(peer.to_string()).or_insert(0) += 1;
    }

    /// Make `peer` the active conversation and zero its unread counter.
    pub fn select(&mut self, peer: &str) {
        self.open(peer);
        self.unread.insert(peer.to_string(), 0);
        self.active = Some(peer.to_string());
    }

    /// The active conversation partner.
    #[must_use]
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// History with `peer`, oldest first.
    #[must_use]
    pub fn messages(&self, peer: &str) -> &[ChatMessage] {
        self.conversations.get(peer).map_or(&[], Vec::as_slice)
    }

    /// Whether a conversation with `peer` exists.
    #[must_use]
    pub fn has_conversation(&self, peer: &str) -> bool {
        self.conversations.contains_key(peer)
    }

    /// Conversation partners in the order their conversations were opened.
    #[must_use]
    pub fn conversation_peers(&self) -> &[String] {
        &self.order
    }

    /// Unread count for `peer`.
    #[must_use]
    pub fn unread(&self, peer: &str) -> u32 {
        self.unread.get(peer).copied().unwrap_or(0)
    }

    /// Unread count across all peers.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    /// Drop all state, as at the end of a session.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
