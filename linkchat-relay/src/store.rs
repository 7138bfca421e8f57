//! In-memory store-and-forward queue for offline recipients.
//!
//! The [`MessageStore`] holds per-name FIFO queues of already-encoded
//! `message` envelopes that could not be delivered because the recipient
//! was not connected. When the name registers again its queue is drained
//! in order.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default maximum number of queued messages per recipient.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// A message held for later delivery.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Registered name of the sender.
    pub from: String,
    /// The encoded envelope, ready to send.
    pub frame: String,
    /// When the message was queued.
    pub queued_at: Instant,
}

/// Per-recipient message queues with FIFO eviction.
///
/// When a queue grows past its cap the oldest message is dropped.
#[derive(Debug)]
pub struct MessageStore {
    queues: RwLock<HashMap<String, VecDeque<StoredMessage>>>,
    max_queue_size: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::with_max_queue_size(DEFAULT_MAX_QUEUE_SIZE)
    }
}

impl MessageStore {
    /// Creates an empty store with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store holding at most `max_queue_size` messages
    /// per recipient.
    #[must_use]
    pub fn with_max_queue_size(max_queue_size: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            max_queue_size: max_queue_size.max(1),
        }
    }

    /// Queues `frame` for `to`, returning the new queue length.
    pub async fn enqueue(&self, to: &str, from: &str, frame: String) -> usize {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(to.to_string()).or_default();
        queue.push_back(StoredMessage {
            from: from.to_string(),
            frame,
            queued_at: Instant::now(),
        });
        if queue.len() > self.max_queue_size
            && let Some(evicted) = queue.pop_front()
        {
            tracing::debug!(
                to,
                from = %evicted.from,
                age_ms = evicted.queued_at.elapsed().as_millis(),
                "offline queue full, oldest message dropped"
            );
        }
        queue.len()
    }

    /// Removes and returns everything queued for `name`, oldest first.
    pub async fn drain(&self, name: &str) -> Vec<StoredMessage> {
        let mut queues = self.queues.write().await;
        queues
            .remove(name)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Number of messages queued for `name`.
    pub async fn queue_len(&self, name: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(name).map_or(0, VecDeque::len)
    }
}
