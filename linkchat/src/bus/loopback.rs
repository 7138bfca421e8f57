//! Loopback bus for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate a bus
//! connection. [`LoopbackBus::create_pair`] returns two connected ends;
//! tests usually keep one end and play the bus server on it.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::{Bus, BusConnector, BusError};

/// In-process bus endpoint backed by `tokio::sync::mpsc` channels.
pub struct LoopbackBus {
    /// Sender toward the other end. Taken on close so the peer sees EOF.
    tx: Mutex<Option<mpsc::Sender<String>>>,
    /// Frames sent by the other end.
    rx: Mutex<mpsc::Receiver<String>>,
    /// Set once [`Bus::close`] has been called on this end.
    closed: AtomicBool,
}

impl LoopbackBus {
    /// Create a pair of connected loopback endpoints.
    ///
    /// `buffer` is the channel capacity in each direction.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);
        (Self::new(tx_b, rx_a), Self::new(tx_a, rx_b))
    }

    fn new(tx: mpsc::Sender<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

impl Bus for LoopbackBus {
    async fn send(&self, frame: &str) -> Result<(), BusError> {
        let tx = self.tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            return Err(BusError::ConnectionClosed);
        };
        tx.send(frame.to_string())
            .await
            .map_err(|_| BusError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<String, BusError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BusError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(BusError::ConnectionClosed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.tx.lock().await.take();
    }

    fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.tx
            .try_lock()
            .map_or(true, |tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
    }
}

/// Connector that hands out loopback buses.
///
/// The remote end of every bus it opens is delivered on the receiver
/// returned by [`LoopbackConnector::new`], so a test can act as the bus
/// server for each session.
pub struct LoopbackConnector {
    buffer: usize,
    remotes: mpsc::UnboundedSender<LoopbackBus>,
}

impl LoopbackConnector {
    /// Create a connector and the receiver of server-side ends.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<LoopbackBus>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (Self { buffer, remotes }, rx)
    }
}

impl BusConnector for LoopbackConnector {
    type Bus = LoopbackBus;

    async fn connect(&self) -> Result<LoopbackBus, BusError> {
        let (local, remote) = LoopbackBus::create_pair(self.buffer);
        self.remotes
            .send(remote)
            .map_err(|_| BusError::Unreachable("loopback".to_string()))?;
        Ok(local)
    }
}
