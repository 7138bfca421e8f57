//! The client facade composing all components of a session.
//!
//! [`ChatClient`] owns the Connection Manager, Peer Directory, Conversation
//! Store and Delivery Orchestrator, and is the only place where their
//! contracts are combined. Observable changes are reported as
//! [`ClientEvent`]s on the channel returned by [`ChatClient::new`].

use std::sync::Arc;

use tokio::sync::mpsc;

use linkchat_proto::codec;
use linkchat_proto::envelope::Inbound;
use linkchat_proto::transfer::{AssetReference, TransferMode};

use crate::bus::{BusConnector, BusError};
use crate::conversation::{ChatMessage, ConversationStore, InboundOutcome};
use crate::delivery::link::LinkConnector;
use crate::delivery::transfer::{
    self, Transfer, TransferFailure, TransferId, TransferJob, TransferOptions, TransferProgress,
    TransferReport,
};
use crate::delivery::{DeliveryOrchestrator, SendError, TransferError};
use crate::directory::{DirectoryError, Peer, PeerDirectory};
use crate::session::{ConnectionManager, ConnectionState, SessionError, SessionLifetime};

/// Something the user interface may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session is registered.
    Connected {
        /// Registered name.
        identity: String,
        /// Address reported by the bus.
        address: String,
    },
    /// The session ended.
    Disconnected {
        /// Why, when it was not requested.
        reason: Option<String>,
    },
    /// The visible peer set or an address changed.
    PeersChanged(Vec<Peer>),
    /// A Remote message was appended.
    MessageReceived {
        /// Conversation partner.
        peer: String,
        /// The appended message.
        message: ChatMessage,
        /// Unread count of that conversation after the append.
        unread: u32,
    },
    /// A transfer was registered.
    TransferStarted {
        /// Transfer id.
        id: TransferId,
        /// Recipient.
        peer: String,
        /// Number of chunks.
        chunks_total: u32,
    },
    /// A transfer made progress.
    TransferProgress {
        /// Transfer id.
        id: TransferId,
        /// Percentage complete.
        progress: u8,
    },
    /// A transfer completed and its asset message was sent.
    TransferCompleted {
        /// Transfer id.
        id: TransferId,
        /// The stored asset.
        asset: AssetReference,
    },
    /// A transfer, or the asset message after it, failed.
    TransferFailed {
        /// Transfer id.
        id: TransferId,
        /// What went wrong.
        error: TransferError,
    },
    /// The bus reported an error.
    BusError(String),
}

/// Tunables of a [`ChatClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    /// Default asset transfer parameters.
    pub transfer: TransferOptions,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            transfer: TransferOptions::default(),
            event_capacity: 256,
        }
    }
}

/// A messaging client session and everything it owns.
pub struct ChatClient<C: BusConnector, L: LinkConnector> {
    connection: ConnectionManager<C>,
    directory: PeerDirectory,
    conversations: ConversationStore,
    delivery: DeliveryOrchestrator,
    links: Arc<L>,
    transfer_options: TransferOptions,
    events: mpsc::Sender<ClientEvent>,
}

impl<C: BusConnector, L: LinkConnector> ChatClient<C, L> {
    /// Create a disconnected client.
    ///
    /// Returns the client and the receiver of its [`ClientEvent`]s.
    pub fn new(
        connection: ConnectionManager<C>,
        links: L,
        settings: ClientSettings,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events, rx) = mpsc::channel(settings.event_capacity.max(1));
        let client = Self {
            connection,
            directory: PeerDirectory::new(),
            conversations: ConversationStore::new(),
            delivery: DeliveryOrchestrator::new(),
            links: Arc::new(links),
            transfer_options: settings.transfer,
            events,
        };
        (client, rx)
    }

    /// Deliver an event, waiting for room in the channel.
    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event receiver gone");
        }
    }

    // -- Session --

    /// Register `identity` and start the session.
    ///
    /// Frames that arrived before the registration acknowledgment are
    /// processed right after it.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&mut self, identity: &str) -> Result<(), SessionError> {
        let handshake = self.connection.connect(identity).await?;
        let identity = self
            .connection
            .local_identity()
            .unwrap_or_default()
            .to_string();
        self.directory.set_local_identity(identity.clone());
        self.directory
            .record_local_address(handshake.assigned_address.clone());
        self.conversations.set_local_identity(identity.clone());
        self.emit(ClientEvent::Connected {
            identity,
            address: handshake.assigned_address,
        })
        .await;
        for frame in handshake.backlog {
            self.handle_frame(&frame).await;
        }
        Ok(())
    }

    /// End the session.
    ///
    /// Unconditional: in-flight transfers fail with `ConnectionClosed`
    /// and per-session state is cleared.
    pub async fn disconnect(&mut self) {
        self.teardown(None).await;
    }

    /// End the session because the bus went away.
    pub async fn handle_bus_closed(&mut self, err: &BusError) {
        tracing::warn!(err = %err, "bus lost");
        self.teardown(Some(err.to_string())).await;
    }

    async fn teardown(&mut self, reason: Option<String>) {
        let had_session = self.connection.disconnect().await;
        for id in self
            .delivery
            .fail_in_flight(&TransferFailure::ConnectionClosed)
        {
            self.emit(ClientEvent::TransferFailed {
                id,
                error: TransferError::ConnectionClosed,
            })
            .await;
        }
        self.directory.clear();
        self.conversations.reset();
        if had_session {
            self.emit(ClientEvent::Disconnected { reason }).await;
        }
    }

    /// Ask the bus for the peer list now.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] without a session.
    pub async fn refresh_peers(&self) -> Result<(), SessionError> {
        self.connection.request_list().await
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The local identity, if connected.
    #[must_use]
    pub fn local_identity(&self) -> Option<&str> {
        self.connection.local_identity()
    }

    /// The address the bus assigned to this session.
    #[must_use]
    pub fn assigned_address(&self) -> Option<&str> {
        self.connection.session().and_then(|s| s.assigned_address())
    }

    /// A handle to the session's bus, for reading inbound frames.
    #[must_use]
    pub fn bus(&self) -> Option<Arc<C::Bus>> {
        self.connection.bus()
    }

    /// The lifetime of the current session.
    #[must_use]
    pub fn lifetime(&self) -> Option<SessionLifetime> {
        self.connection.lifetime()
    }

    // -- Directory and conversations --

    /// Visible peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.directory.peers()
    }

    /// Make `peer` the active conversation, zeroing its unread count.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::InvalidTarget`] for the local identity or a peer
    /// not in the directory.
    pub fn select_peer(&mut self, peer: &str) -> Result<(), DirectoryError> {
        self.directory.validate_target(peer)?;
        self.conversations.select(peer);
        Ok(())
    }

    /// Open a conversation with `peer` without selecting it.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::InvalidTarget`] as for [`Self::select_peer`].
    pub fn open_conversation(&mut self, peer: &str) -> Result<(), DirectoryError> {
        self.directory.validate_target(peer)?;
        self.conversations.open(peer);
        Ok(())
    }

    /// The active conversation partner.
    #[must_use]
    pub fn active_peer(&self) -> Option<&str> {
        self.conversations.active()
    }

    /// History with `peer`.
    #[must_use]
    pub fn conversation(&self, peer: &str) -> &[ChatMessage] {
        self.conversations.messages(peer)
    }

    /// Open conversations in opening order.
    #[must_use]
    pub fn conversation_peers(&self) -> &[String] {
        self.conversations.conversation_peers()
    }

    /// Unread count for `peer`.
    #[must_use]
    pub fn unread(&self, peer: &str) -> u32 {
        self.conversations.unread(peer)
    }

    /// Unread count over all conversations.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.conversations.total_unread()
    }

    // -- Text --

    /// Send a text message to `peer`.
    ///
    /// The message is recorded locally before it is handed to the bus; a
    /// bus failure is reported but the local record stays.
    ///
    /// # Errors
    ///
    /// - [`SendError::NoRecipient`] if `peer` is blank or is the local
    ///   identity. Nothing is recorded.
    /// - [`SendError::NotConnected`] without a session. Nothing is recorded.
    /// - [`SendError::TransportError`] if the bus rejects the frame.
    pub async fn send_text(&mut self, peer: &str, content: &str) -> Result<(), SendError> {
        let local = self.connection.local_identity().unwrap_or_default();
        let (peer, frame) = self.delivery.prepare_text(local, peer, content)?;
        if self.connection.state() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        self.conversations.record_local_send(&peer, content);
        self.connection.send_frame(&frame).await.map_err(|e| {
            tracing::warn!(peer = %peer, err = %e, "text send failed");
            SendError::TransportError(e.to_string())
        })
    }

    // -- Assets --

    /// Default transfer options of this client.
    #[must_use]
    pub const fn transfer_options(&self) -> TransferOptions {
        self.transfer_options
    }

    /// The asset channel connector.
    #[must_use]
    pub fn links(&self) -> Arc<L> {
        Arc::clone(&self.links)
    }

    /// Register a transfer of `data` to `peer`.
    ///
    /// The returned job is run with [`transfer::execute`] and its report
    /// handed back to [`Self::conclude_asset`].
    ///
    /// # Errors
    ///
    /// - [`TransferError::NoRecipient`] for a blank peer or the local identity.
    /// - [`TransferError::NotConnected`] without a session.
    /// - [`TransferError::InvalidRequest`] for unusable options.
    pub async fn begin_asset(
        &mut self,
        peer: &str,
        file_name: &str,
        data: Vec<u8>,
        mode: Option<TransferMode>,
    ) -> Result<TransferJob, TransferError> {
        let local = self.connection.local_identity().unwrap_or_default();
        if peer.trim().is_empty() || peer.trim() == local {
            return Err(TransferError::NoRecipient);
        }
        if self.connection.state() != ConnectionState::Connected {
            return Err(TransferError::NotConnected);
        }
        let mut options = self.transfer_options;
        if let Some(mode) = mode {
            options.mode = mode;
        }
        let job = self
            .delivery
            .begin_asset(local, peer, file_name, data, options)?;
        self.emit(ClientEvent::TransferStarted {
            id: job.id,
            peer: job.peer.clone(),
            chunks_total: u32::from(job.chunks_total),
        })
        .await;
        Ok(job)
    }

    /// Apply a progress snapshot from a running transfer.
    pub async fn record_progress(&mut self, progress: &TransferProgress) {
        if let Some(pct) = self.delivery.record_progress(progress) {
            self.emit(ClientEvent::TransferProgress {
                id: progress.id,
                progress: pct,
            })
            .await;
        }
    }

    /// Settle a transfer and, on success, send its asset message.
    ///
    /// The asset message goes through the text path to the transfer's
    /// peer, so it is recorded locally exactly once. Each transfer emits
    /// one `TransferCompleted` or `TransferFailed`; a report for a
    /// transfer that is already settled emits nothing.
    ///
    /// # Errors
    ///
    /// The transfer's failure, [`TransferError::MissingAssetReference`]
    /// when no asset message can be built,
    /// [`TransferError::TransportError`] if the asset message cannot be
    /// sent, or [`TransferError::AlreadySettled`] for a late report.
    pub async fn conclude_asset(
        &mut self,
        report: TransferReport,
    ) -> Result<AssetReference, TransferError> {
        let id = report.id;
        let peer = self.delivery.transfer(&id).map(|t| t.peer.clone());
        let outcome = match (self.delivery.conclude(report), peer) {
            (Ok(asset), Some(peer)) => self
                .send_text(&peer, &asset.to_message())
                .await
                .map(|()| asset)
                .map_err(|e| match e {
                    SendError::NotConnected => TransferError::ConnectionClosed,
                    SendError::NoRecipient => TransferError::NoRecipient,
                    SendError::TransportError(e) => TransferError::TransportError(e),
                }),
            (Ok(_), None) => Err(TransferError::UnknownTransfer(id)),
            (Err(e), _) => Err(e),
        };
        match &outcome {
            Ok(asset) => {
                self.emit(ClientEvent::TransferCompleted {
                    id,
                    asset: asset.clone(),
                })
                .await;
            }
            Err(TransferError::AlreadySettled(_)) => {}
            Err(error) => {
                self.emit(ClientEvent::TransferFailed {
                    id,
                    error: error.clone(),
                })
                .await;
            }
        }
        outcome
    }

    /// Send an asset and wait for the outcome.
    ///
    /// The transfer is abandoned with `ConnectionClosed` if the session
    /// ends while it runs.
    ///
    /// # Errors
    ///
    /// As for [`Self::begin_asset`] and [`Self::conclude_asset`].
    pub async fn send_asset(
        &mut self,
        peer: &str,
        file_name: &str,
        data: Vec<u8>,
        mode: Option<TransferMode>,
    ) -> Result<AssetReference, TransferError> {
        let job = self.begin_asset(peer, file_name, data, mode).await?;
        let lifetime = self.lifetime().ok_or(TransferError::NotConnected)?;
        let links = self.links();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let report = tokio::select! {
            report = transfer::execute(&job, links.as_ref(), Some(&progress_tx)) => report,
            () = lifetime.closed() => TransferReport::closed(job.id),
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.record_progress(&progress).await;
        }
        self.conclude_asset(report).await
    }

    /// All transfers of this client, oldest first.
    #[must_use]
    pub fn transfers(&self) -> Vec<&Transfer> {
        self.delivery.transfers()
    }

    /// Look up a transfer.
    #[must_use]
    pub fn transfer(&self, id: &TransferId) -> Option<&Transfer> {
        self.delivery.transfer(id)
    }

    // -- Inbound --

    /// Process one inbound bus frame.
    ///
    /// Malformed frames are logged and ignored. Frames arriving without a
    /// session are dropped.
    pub async fn handle_frame(&mut self, frame: &str) {
        if self.connection.state() != ConnectionState::Connected {
            tracing::debug!("frame after disconnect dropped");
            return;
        }
        let inbound = match codec::decode_inbound(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(err = %e, "malformed bus frame, skipping");
                return;
            }
        };
        match inbound {
            Inbound::Message(message) => {
                if let InboundOutcome::Recorded { peer, .. } =
                    self.conversations.record_inbound(&message)
                    && let Some(last) = self.conversations.messages(&peer).last()
                {
                    let event = ClientEvent::MessageReceived {
                        message: last.clone(),
                        unread: self.conversations.unread(&peer),
                        peer,
                    };
                    self.emit(event).await;
                }
            }
            Inbound::PeerList(update) => {
                if self.directory.apply_list(&update) {
                    self.emit(ClientEvent::PeersChanged(self.directory.peers()))
                        .await;
                }
            }
            Inbound::AddressAssigned { ip, identity } => {
                let is_local = identity
                    .as_deref()
                    .is_none_or(|name| Some(name) == self.connection.local_identity());
                if is_local {
                    self.directory.record_local_address(ip.clone());
                    self.connection.set_assigned_address(ip);
                } else if let Some(name) = identity
                    && self.directory.upsert_address(&name, &ip)
                {
                    self.emit(ClientEvent::PeersChanged(self.directory.peers()))
                        .await;
                }
            }
            Inbound::Error { reason } => {
                tracing::warn!(reason = %reason, "bus error");
                self.emit(ClientEvent::BusError(reason)).await;
            }
            Inbound::Unknown(kind) => {
                tracing::debug!(kind = %kind, "unhandled envelope type");
            }
        }
    }
}
