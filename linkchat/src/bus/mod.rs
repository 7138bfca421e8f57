//! Message bus abstraction for `LinkChat`.
//!
//! The bus is the single persistent, bidirectional text channel a session
//! talks over. Concrete implementations:
//! - [`ws::WsBus`]: WebSocket connection to a bus server
//! - [`loopback::LoopbackBus`]: in-process channel pair for testing
//!
//! Frames are opaque JSON text at this layer; decoding happens in
//! [`linkchat_proto::codec`].

pub mod loopback;
pub mod ws;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The connection to the bus has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("bus operation timed out")]
    Timeout,

    /// The bus endpoint could not be reached.
    #[error("bus {0} is unreachable")]
    Unreachable(String),

    /// The bus URL is not a usable WebSocket URL.
    #[error("invalid bus url: {0}")]
    InvalidUrl(String),

    /// An underlying I/O error occurred.
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected message bus carrying text frames.
///
/// Implementations must allow `send` and `recv` to be called concurrently
/// from different tasks, and `recv` must be cancel-safe: dropping a pending
/// `recv` future never loses a frame.
pub trait Bus: Send + Sync {
    /// Send one text frame.
    ///
    /// Returns once the frame has been handed to the underlying connection.
    fn send(&self, frame: &str) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Receive the next text frame.
    ///
    /// Returns [`BusError::ConnectionClosed`] once the connection is gone.
    fn recv(&self) -> impl Future<Output = Result<String, BusError>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Whether the connection is still usable for sending.
    fn is_connected(&self) -> bool;
}

/// Opens new bus connections.
///
/// A fresh connection is opened for every session, so the connector is
/// held for the lifetime of the client while buses come and go.
pub trait BusConnector: Send + Sync {
    /// The bus type produced by this connector.
    type Bus: Bus + 'static;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Bus, BusError>> + Send;
}
