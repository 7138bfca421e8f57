//! Background task that owns a [`ChatClient`] and serialises all access
//! to it.
//!
//! The front end talks to the task through a [`ClientHandle`] (commands
//! with oneshot replies) and drains [`ClientEvent`]s from the receiver
//! returned by [`ChatClient::new`].
//!
//! ```text
//! front end  ─── ClientCommand ──→  client task  ←── bus frames
//!            ←── ClientEvent ────               ←── transfer tasks
//! ```
//!
//! Asset transfers run on their own tasks so inbound traffic keeps being
//! processed while chunks are in flight; their progress and final reports
//! are fed back into the client task.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use linkchat_proto::transfer::TransferMode;

use crate::bus::{Bus, BusConnector, BusError};
use crate::client::{ChatClient, ClientEvent};
use crate::conversation::ChatMessage;
use crate::delivery::link::LinkConnector;
use crate::delivery::transfer::{
    self, Transfer, TransferId, TransferJob, TransferProgress, TransferReport,
};
use crate::delivery::{SendError, TransferError};
use crate::directory::{DirectoryError, Peer};
use crate::session::{SessionError, SessionLifetime};

/// Default capacity of the command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Errors returned through a [`ClientHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Session-level failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The target is not a valid peer.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Text send failure.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Asset send failure.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The client task is gone.
    #[error("client task has stopped")]
    Stopped,
}

type Reply<T> = oneshot::Sender<T>;

/// Commands accepted by the client task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Register and start a session.
    Connect {
        /// Identity to register.
        identity: String,
        /// Outcome.
        reply: Reply<Result<(), SessionError>>,
    },
    /// End the session.
    Disconnect,
    /// Request the peer list now.
    RefreshPeers,
    /// Make a peer the active conversation.
    Select {
        /// Peer identity.
        peer: String,
        /// Outcome.
        reply: Reply<Result<(), DirectoryError>>,
    },
    /// Open a conversation with a peer.
    Open {
        /// Peer identity.
        peer: String,
        /// Outcome.
        reply: Reply<Result<(), DirectoryError>>,
    },
    /// Send a text message.
    SendText {
        /// Recipient.
        peer: String,
        /// Message body.
        content: String,
        /// Outcome.
        reply: Reply<Result<(), SendError>>,
    },
    /// Start an asset transfer. The reply carries the id once registered;
    /// the outcome arrives as a [`ClientEvent`].
    SendAsset {
        /// Recipient.
        peer: String,
        /// Original file name.
        file_name: String,
        /// Asset bytes.
        data: Vec<u8>,
        /// Mode override.
        mode: Option<TransferMode>,
        /// Registered transfer id.
        reply: Reply<Result<TransferId, TransferError>>,
    },
    /// Snapshot of the directory.
    Peers {
        /// Visible peers.
        reply: Reply<Vec<Peer>>,
    },
    /// Snapshot of one conversation.
    History {
        /// Conversation partner.
        peer: String,
        /// Messages, oldest first.
        reply: Reply<Vec<ChatMessage>>,
    },
    /// Snapshot of the transfer registry.
    Transfers {
        /// Transfers, oldest first.
        reply: Reply<Vec<Transfer>>,
    },
    /// Disconnect and stop the task.
    Shutdown,
}

/// Cloneable front-end handle to a running client task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ClientCommand,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    async fn notify(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }

    /// Register `identity` and start a session.
    ///
    /// # Errors
    ///
    /// [`ClientError::Session`] if the handshake fails.
    pub async fn connect(&self, identity: &str) -> Result<(), ClientError> {
        let identity = identity.to_string();
        Ok(self
            .request(|reply| ClientCommand::Connect { identity, reply })
            .await??)
    }

    /// End the session.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the task is gone.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.notify(ClientCommand::Disconnect).await
    }

    /// Request the peer list now.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the task is gone.
    pub async fn refresh_peers(&self) -> Result<(), ClientError> {
        self.notify(ClientCommand::RefreshPeers).await
    }

    /// Make `peer` the active conversation.
    ///
    /// # Errors
    ///
    /// [`ClientError::Directory`] for an invalid target.
    pub async fn select(&self, peer: &str) -> Result<(), ClientError> {
        let peer = peer.to_string();
        Ok(self
            .request(|reply| ClientCommand::Select { peer, reply })
            .await??)
    }

    /// Open a conversation with `peer`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Directory`] for an invalid target.
    pub async fn open(&self, peer: &str) -> Result<(), ClientError> {
        let peer = peer.to_string();
        Ok(self
            .request(|reply| ClientCommand::Open { peer, reply })
            .await??)
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// [`ClientError::Send`] as for [`ChatClient::send_text`].
    pub async fn send_text(&self, peer: &str, content: &str) -> Result<(), ClientError> {
        let (peer, content) = (peer.to_string(), content.to_string());
        Ok(self
            .request(|reply| ClientCommand::SendText {
                peer,
                content,
                reply,
            })
            .await??)
    }

    /// Start an asset transfer and return its id.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transfer`] if the transfer cannot be registered.
    pub async fn send_asset(
        &self,
        peer: &str,
        file_name: &str,
        data: Vec<u8>,
        mode: Option<TransferMode>,
    ) -> Result<TransferId, ClientError> {
        let (peer, file_name) = (peer.to_string(), file_name.to_string());
        Ok(self
            .request(|reply| ClientCommand::SendAsset {
                peer,
                file_name,
                data,
                mode,
                reply,
            })
            .await??)
    }

    /// Visible peers.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the task is gone.
    pub async fn peers(&self) -> Result<Vec<Peer>, ClientError> {
        self.request(|reply| ClientCommand::Peers { reply }).await
    }

    /// History with `peer`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the task is gone.
    pub async fn history(&self, peer: &str) -> Result<Vec<ChatMessage>, ClientError> {
        let peer = peer.to_string();
        self.request(|reply| ClientCommand::History { peer, reply })
            .await
    }

    /// All transfers.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the task is gone.
    pub async fn transfers(&self) -> Result<Vec<Transfer>, ClientError> {
        self.request(|reply| ClientCommand::Transfers { reply }).await
    }

    /// Disconnect and stop the client task.
    ///
    /// # Errors
    ///
    /// [`ClientError::Stopped`] if the task is already gone.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.notify(ClientCommand::Shutdown).await
    }
}

/// Move `client` onto a background task.
pub fn spawn_client<C, L>(
    client: ChatClient<C, L>,
    capacity: usize,
) -> (ClientHandle, JoinHandle<()>)
where
    C: BusConnector + 'static,
    L: LinkConnector + 'static,
{
    let (commands, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run(client, rx));
    (ClientHandle { commands }, task)
}

/// Next frame from the bus, or never when there is no session.
async fn next_frame<B: Bus>(bus: Option<&B>) -> Result<String, BusError> {
    match bus {
        Some(bus) => bus.recv().await,
        None => std::future::pending().await,
    }
}

struct TransferChannels {
    progress: mpsc::UnboundedSender<TransferProgress>,
    reports: mpsc::UnboundedSender<TransferReport>,
}

async fn run<C, L>(mut client: ChatClient<C, L>, mut commands: mpsc::Receiver<ClientCommand>)
where
    C: BusConnector + 'static,
    L: LinkConnector + 'static,
{
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
    let channels = TransferChannels {
        progress: progress_tx,
        reports: reports_tx,
    };

    loop {
        let bus = client.bus();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if matches!(command, ClientCommand::Shutdown) {
                    break;
                }
                handle_command(&mut client, command, &channels).await;
            }
            frame = next_frame(bus.as_deref()) => match frame {
                Ok(frame) => client.handle_frame(&frame).await,
                Err(e) => client.handle_bus_closed(&e).await,
            },
            Some(progress) = progress_rx.recv() => client.record_progress(&progress).await,
            Some(report) = reports_rx.recv() => {
                if let Err(e) = client.conclude_asset(report).await {
                    tracing::debug!(err = %e, "transfer settled with error");
                }
            }
        }
    }

    client.disconnect().await;
    tracing::info!("client task stopped");
}

async fn handle_command<C, L>(
    client: &mut ChatClient<C, L>,
    command: ClientCommand,
    channels: &TransferChannels,
) where
    C: BusConnector + 'static,
    L: LinkConnector + 'static,
{
    match command {
        ClientCommand::Connect { identity, reply } => {
            let _ = reply.send(client.connect(&identity).await);
        }
        ClientCommand::Disconnect => client.disconnect().await,
        ClientCommand::RefreshPeers => {
            if let Err(e) = client.refresh_peers().await {
                tracing::debug!(err = %e, "refresh skipped");
            }
        }
        ClientCommand::Select { peer, reply } => {
            let _ = reply.send(client.select_peer(&peer));
        }
        ClientCommand::Open { peer, reply } => {
            let _ = reply.send(client.open_conversation(&peer));
        }
        ClientCommand::SendText {
            peer,
            content,
            reply,
        } => {
            let _ = reply.send(client.send_text(&peer, &content).await);
        }
        ClientCommand::SendAsset {
            peer,
            file_name,
            data,
            mode,
            reply,
        } => {
            let started = client
                .begin_asset(&peer, &file_name, data, mode)
                .await
                .and_then(|job| {
                    let lifetime = client.lifetime().ok_or(TransferError::NotConnected)?;
                    let id = job.id;
                    tokio::spawn(run_transfer(
                        job,
                        client.links(),
                        lifetime,
                        channels.progress.clone(),
                        channels.reports.clone(),
                    ));
                    Ok(id)
                });
            let _ = reply.send(started);
        }
        ClientCommand::Peers { reply } => {
            let _ = reply.send(client.peers());
        }
        ClientCommand::History { peer, reply } => {
            let _ = reply.send(client.conversation(&peer).to_vec());
        }
        ClientCommand::Transfers { reply } => {
            let _ = reply.send(client.transfers().into_iter().cloned().collect());
        }
        ClientCommand::Shutdown => {}
    }
}

/// Drive one transfer until it finishes or its session ends.
async fn run_transfer<L: LinkConnector>(
    job: TransferJob,
    links: Arc<L>,
    lifetime: SessionLifetime,
    progress: mpsc::UnboundedSender<TransferProgress>,
    reports: mpsc::UnboundedSender<TransferReport>,
) {
    let report = tokio::select! {
        report = transfer::execute(&job, links.as_ref(), Some(&progress)) => report,
        () = lifetime.closed() => {
            tracing::debug!(transfer_id = %job.id, "transfer abandoned with its session");
            TransferReport::closed(job.id)
        }
    };
    let _ = reports.send(report);
}
