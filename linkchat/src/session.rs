//! Connection Manager: the single persistent bus connection of a session.
//!
//! Owns the [`Session`] record, runs the registration handshake, and
//! drives the periodic directory refresh. Every session carries a
//! [`SessionLifetime`]; timed work started on behalf of the session
//! (the refresh ticker, asset transfers) watches it and stops as soon as
//! the session ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use linkchat_proto::codec;
use linkchat_proto::envelope::{ClientEnvelope, Inbound};

use crate::bus::{Bus, BusConnector, BusError};

/// Default time to wait for the registration acknowledgment.
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between directory refresh requests.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3);

/// Errors surfaced by the Connection Manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The identity is empty or whitespace.
    #[error("invalid identity: must not be empty")]
    InvalidIdentity,

    /// A session is already connecting or connected.
    #[error("already connected as {0}")]
    AlreadyConnected(String),

    /// The operation needs a connected session.
    #[error("not connected")]
    NotConnected,

    /// The bus did not acknowledge registration in time.
    #[error("registration not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    /// The bus rejected the registration.
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// Bus-level failure.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Registered with the bus.
    Connected,
}

/// A registered session.
#[derive(Debug, Clone)]
pub struct Session {
    local_identity: String,
    assigned_address: Option<String>,
}

impl Session {
    /// The name this session registered with.
    #[must_use]
    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// The address the bus reported for this session, if any.
    #[must_use]
    pub fn assigned_address(&self) -> Option<&str> {
        self.assigned_address.as_deref()
    }
}

/// Observes the end of a session.
///
/// Cheap to clone; every clone resolves [`closed`](Self::closed) when the
/// session is torn down or the owning [`ConnectionManager`] is dropped.
#[derive(Debug, Clone)]
pub struct SessionLifetime {
    rx: watch::Receiver<bool>,
}

impl SessionLifetime {
    fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether the session has already ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        let mut rx = self.rx.clone();
        // An error means the sender is gone, which also ends the session.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Handshake {
    /// Address reported by the bus in its acknowledgment.
    pub assigned_address: String,
    /// Frames that arrived before the acknowledgment, in arrival order.
    pub backlog: Vec<String>,
}

struct Live<B> {
    session: Session,
    bus: Arc<B>,
    lifetime_tx: watch::Sender<bool>,
    lifetime: SessionLifetime,
    refresh_task: tokio::task::JoinHandle<()>,
}

/// Owns the bus connection and the session record.
pub struct ConnectionManager<C: BusConnector> {
    connector: C,
    state: ConnectionState,
    live: Option<Live<C::Bus>>,
    register_timeout: Duration,
    refresh_interval: Duration,
}

impl<C: BusConnector> ConnectionManager<C> {
    /// Create a manager in the `Disconnected` state.
    pub const fn new(connector: C) -> Self {
        Self {
            connector,
            state: ConnectionState::Disconnected,
            live: None,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Override the registration acknowledgment timeout.
    #[must_use]
    pub const fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    /// Override the directory refresh interval.
    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// The live session, if connected.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.live.as_ref().map(|live| &live.session)
    }

    /// The local identity, if connected.
    #[must_use]
    pub fn local_identity(&self) -> Option<&str> {
        self.session().map(Session::local_identity)
    }

    /// A handle to the session's bus, if connected.
    #[must_use]
    pub fn bus(&self) -> Option<Arc<C::Bus>> {
        self.live.as_ref().map(|live| Arc::clone(&live.bus))
    }

    /// The lifetime of the current session, if connected.
    #[must_use]
    pub fn lifetime(&self) -> Option<SessionLifetime> {
        self.live.as_ref().map(|live| live.lifetime.clone())
    }

    /// Record the address the bus reported for the local identity.
    pub fn set_assigned_address(&mut self, address: impl Into<String>) {
        if let Some(live) = self.live.as_mut() {
            live.session.assigned_address = Some(address.into());
        }
    }

    /// Open a connection and register `identity`.
    ///
    /// On acknowledgment the session becomes `Connected`, an initial
    /// directory refresh is requested, and the periodic refresh starts.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidIdentity`] for an empty or blank identity.
    /// - [`SessionError::AlreadyConnected`] if a session exists.
    /// - [`SessionError::HandshakeTimeout`] if no acknowledgment arrives.
    /// - [`SessionError::Bus`] if the connection fails.
    ///
    /// On any error the state is `Disconnected` afterwards.
    pub async fn connect(&mut self, identity: &str) -> Result<Handshake, SessionError> {
        if let Some(live) = &self.live {
            return Err(SessionError::AlreadyConnected(
                live.session.local_identity.clone(),
            ));
        }
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::AlreadyConnected(identity.to_string()));
        }
        let identity = validate_identity(identity)?;

        self.state = ConnectionState::Connecting;
        match self.register(&identity).await {
            Ok((bus, handshake)) => {
                let bus = Arc::new(bus);
                let (lifetime_tx, lifetime) = SessionLifetime::new();
                if let Err(e) = request_list(bus.as_ref()).await {
                    tracing::warn!(err = %e, "initial directory refresh failed");
                }
                let refresh_task = tokio::spawn(refresh_loop(
                    Arc::clone(&bus),
                    self.refresh_interval,
                    lifetime.clone(),
                ));
                self.live = Some(Live {
                    session: Session {
                        local_identity: identity.clone(),
                        assigned_address: Some(handshake.assigned_address.clone()),
                    },
                    bus,
                    lifetime_tx,
                    lifetime,
                    refresh_task,
                });
                self.state = ConnectionState::Connected;
                tracing::info!(
                    identity = %identity,
                    address = %handshake.assigned_address,
                    "session connected"
                );
                Ok(handshake)
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                tracing::warn!(identity = %identity, err = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn register(&self, identity: &str) -> Result<(C::Bus, Handshake), SessionError> {
        let bus = self.connector.connect().await?;
        let register = ClientEnvelope::Register {
            username: identity.to_string(),
        };
        let frame = codec::encode(&register)
            .map_err(|e| SessionError::Bus(BusError::Io(std::io::Error::other(e))))?;
        bus.send(&frame).await?;

        let waited = tokio::time::timeout(self.register_timeout, await_ack(&bus)).await;
        match waited {
            Ok(Ok(handshake)) => Ok((bus, handshake)),
            Ok(Err(e)) => {
                bus.close().await;
                Err(e)
            }
            Err(_) => {
                bus.close().await;
                Err(SessionError::HandshakeTimeout(self.register_timeout))
            }
        }
    }

    /// Close the channel and end the session.
    ///
    /// Unconditional: the session ends regardless of in-flight work, and
    /// every [`SessionLifetime`] observer is released. Returns `false` if
    /// there was no session.
    pub async fn disconnect(&mut self) -> bool {
        self.state = ConnectionState::Disconnected;
        let Some(live) = self.live.take() else {
            return false;
        };
        let _ = live.lifetime_tx.send(true);
        live.refresh_task.abort();
        live.bus.close().await;
        tracing::info!(identity = %live.session.local_identity, "session disconnected");
        true
    }

    /// Send a directory refresh request.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without a session, or
    /// [`SessionError::Bus`] if the send fails.
    pub async fn request_list(&self) -> Result<(), SessionError> {
        let live = self.live.as_ref().ok_or(SessionError::NotConnected)?;
        request_list(live.bus.as_ref()).await?;
        Ok(())
    }

    /// Send one already-encoded frame over the session's bus.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without a session, or
    /// [`SessionError::Bus`] if the send fails.
    pub async fn send_frame(&self, frame: &str) -> Result<(), SessionError> {
        let live = self.live.as_ref().ok_or(SessionError::NotConnected)?;
        live.bus.send(frame).await?;
        Ok(())
    }
}

impl<C: BusConnector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            let _ = live.lifetime_tx.send(true);
            live.refresh_task.abort();
        }
    }
}

/// Trim and validate an identity.
///
/// # Errors
///
/// [`SessionError::InvalidIdentity`] if nothing remains after trimming.
pub fn validate_identity(identity: &str) -> Result<String, SessionError> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(SessionError::InvalidIdentity);
    }
    Ok(trimmed.to_string())
}

/// Wait for the first `ip_assigned` frame, buffering everything before it.
async fn await_ack<B: Bus>(bus: &B) -> Result<Handshake, SessionError> {
    let mut backlog = Vec::new();
    loop {
        let frame = bus.recv().await?;
        match codec::decode_inbound(&frame) {
            Ok(Inbound::AddressAssigned { ip, .. }) => {
                return Ok(Handshake {
                    assigned_address: ip,
                    backlog,
                });
            }
            Ok(Inbound::Error { reason }) => return Err(SessionError::Rejected(reason)),
            Ok(_) => backlog.push(frame),
            Err(e) => tracing::warn!(err = %e, "malformed frame during handshake, skipping"),
        }
    }
}

async fn request_list<B: Bus>(bus: &B) -> Result<(), BusError> {
    let frame = codec::encode(&ClientEnvelope::List)
        .map_err(|e| BusError::Io(std::io::Error::other(e)))?;
    bus.send(&frame).await
}

/// Periodically asks for the peer list until the session ends.
///
/// Fire-and-forget: a failed send is logged, and the loop stops only when
/// the lifetime closes or the bus is gone.
async fn refresh_loop<B: Bus>(bus: Arc<B>, interval: Duration, lifetime: SessionLifetime) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; connect already sent a request.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = lifetime.closed() => break,
            _ = ticker.tick() => {
                if let Err(e) = request_list(bus.as_ref()).await {
                    tracing::debug!(err = %e, "directory refresh failed");
                    if !bus.is_connected() {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("refresh loop exiting");
}
