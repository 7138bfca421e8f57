//! Delivery Orchestrator: the text send path and the asset transfer registry.
//!
//! Text is fire-and-forget over the bus. Assets go through a separate
//! asset channel (see [`link`]) and are driven by [`transfer::drive`];
//! the orchestrator keeps the registry of every transfer started in this
//! session and turns finished drives into outcomes.
//!
//! Starting and finishing a transfer are split ([`DeliveryOrchestrator::begin_asset`]
//! / [`DeliveryOrchestrator::conclude`]) so the drive itself can run on its
//! own task while inbound traffic keeps being processed.

pub mod link;
pub mod transfer;

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use linkchat_proto::codec;
use linkchat_proto::envelope::ClientEnvelope;
use linkchat_proto::transfer::{AssetReference, TransferStatus, chunk_count};

use transfer::{
    DriveOutcome, Transfer, TransferCounters, TransferFailure, TransferId, TransferJob,
    TransferOptions, TransferProgress, TransferReport, TransferState,
};

/// Errors on the text path.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No peer given, or the peer is the local identity.
    #[error("no recipient selected")]
    NoRecipient,

    /// There is no session to send over.
    #[error("not connected")]
    NotConnected,

    /// The bus failed to take the message.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Outcomes of an asset send that did not produce a usable asset message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// No peer given, or the peer is the local identity.
    #[error("no recipient selected")]
    NoRecipient,

    /// There is no session to send over.
    #[error("not connected")]
    NotConnected,

    /// The requested parameters cannot describe a transfer.
    #[error("invalid transfer: {0}")]
    InvalidRequest(String),

    /// The asset channel or the bus failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A chunk ran out of transmission attempts.
    #[error("chunk {chunk} not acknowledged after retries ({chunks_acked} chunks acknowledged)")]
    RetriesExhausted {
        /// Zero-based index of the chunk that gave up.
        chunk: u32,
        /// Chunks acknowledged before giving up.
        chunks_acked: u32,
    },

    /// The service accepted the upload but named no stored asset.
    #[error("upload accepted but no asset reference was returned")]
    MissingAssetReference,

    /// The session ended during the transfer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The service refused the upload.
    #[error("rejected by service: {0}")]
    Rejected(String),

    /// The transfer id is not in the registry.
    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    /// The transfer was already settled; its outcome has been reported.
    #[error("transfer {0} already settled")]
    AlreadySettled(TransferId),
}

impl TransferError {
    fn from_failure(failure: &TransferFailure, counters: TransferCounters) -> Self {
        match failure {
            TransferFailure::RetriesExhausted { chunk } => Self::RetriesExhausted {
                chunk: *chunk,
                chunks_acked: counters.chunks_acked,
            },
            TransferFailure::ConnectionClosed => Self::ConnectionClosed,
            TransferFailure::TransportError(e) => Self::TransportError(e.clone()),
            TransferFailure::Rejected(reason) => Self::Rejected(reason.clone()),
        }
    }
}

/// Trimmed recipient, or `None` when blank or equal to `local`.
fn recipient<'a>(peer: &'a str, local: &str) -> Option<&'a str> {
    let peer = peer.trim();
    (!peer.is_empty() && peer != local).then_some(peer)
}

/// Drives text sends and owns the transfer registry.
#[derive(Debug, Default)]
pub struct DeliveryOrchestrator {
    transfers: HashMap<TransferId, Transfer>,
    order: Vec<TransferId>,
}

impl DeliveryOrchestrator {
    /// Create an orchestrator with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a text send and encode its bus frame.
    ///
    /// Returns the resolved recipient and the encoded frame.
    ///
    /// # Errors
    ///
    /// [`SendError::NoRecipient`] if `peer` is blank or equals `local`.
    pub fn prepare_text(
        &self,
        local: &str,
        peer: &str,
        content: &str,
    ) -> Result<(String, String), SendError> {
        let peer = recipient(peer, local).ok_or(SendError::NoRecipient)?;
        let frame = codec::encode(&ClientEnvelope::Message {
            to: peer.to_string(),
            msg: content.to_string(),
        })
        .map_err(|e| SendError::TransportError(e.to_string()))?;
        Ok((peer.to_string(), frame))
    }

    /// Register a new transfer and move it to `InFlight`.
    ///
    /// # Errors
    ///
    /// - [`TransferError::NoRecipient`] if `peer` is blank or equals `local`.
    /// - [`TransferError::InvalidRequest`] for a zero chunk size or an asset
    ///   needing more chunks than the chunk header can index.
    ///
    /// Nothing is registered on error.
    pub fn begin_asset(
        &mut self,
        local: &str,
        peer: &str,
        file_name: &str,
        data: Vec<u8>,
        options: TransferOptions,
    ) -> Result<TransferJob, TransferError> {
        let peer = recipient(peer, local).ok_or(TransferError::NoRecipient)?;
        if options.chunk_size == 0 {
            return Err(TransferError::InvalidRequest(
                "chunk size must be positive".into(),
            ));
        }
        let total_bytes = data.len() as u64;
        let chunks = chunk_count(total_bytes, options.chunk_size);
        let chunks_total = u16::try_from(chunks).map_err(|_| {
            TransferError::InvalidRequest(format!(
                "{total_bytes} bytes need {chunks} chunks of {} bytes (max {})",
                options.chunk_size,
                u16::MAX
            ))
        })?;

        let id = Uuid::now_v7();
        let mut record = Transfer {
            id,
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            mode: options.mode,
            total_bytes,
            chunk_size: options.chunk_size,
            max_retries: options.max_retries,
            chunks_total: u32::from(chunks_total),
            counters: TransferCounters::default(),
            state: TransferState::Pending,
            failure: None,
            filename: None,
        };
        record.state = TransferState::InFlight;
        tracing::info!(
            transfer_id = %id,
            peer = %peer,
            mode = %options.mode,
            total_bytes,
            chunks_total,
            "asset transfer started"
        );
        self.transfers.insert(id, record);
        self.order.push(id);

        Ok(TransferJob {
            id,
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            data: Arc::from(data),
            options,
            chunks_total,
        })
    }

    /// Apply a counter snapshot to an in-flight transfer.
    ///
    /// Returns the new progress, or `None` if the transfer is unknown or
    /// already terminal.
    pub fn record_progress(&mut self, progress: &TransferProgress) -> Option<u8> {
        let transfer = self.transfers.get_mut(&progress.id)?;
        if transfer.state.is_terminal() {
            return None;
        }
        transfer.counters = progress.counters;
        Some(transfer.progress())
    }

    /// Settle a transfer from its drive report.
    ///
    /// A finished drive completes the transfer; the returned reference
    /// names the stored asset. A transfer that is already terminal (for
    /// example failed by a disconnect) is left untouched and yields
    /// [`TransferError::AlreadySettled`].
    ///
    /// # Errors
    ///
    /// - [`TransferError::MissingAssetReference`] if the service accepted
    ///   the upload without a usable file name. The transfer itself is
    ///   still `Completed`.
    /// - [`TransferError::Rejected`] for an error response.
    /// - The failure of a drive that stopped early.
    /// - [`TransferError::AlreadySettled`] if the transfer was already
    ///   terminal.
    pub fn conclude(&mut self, report: TransferReport) -> Result<AssetReference, TransferError> {
        let transfer = self
            .transfers
            .get_mut(&report.id)
            .ok_or(TransferError::UnknownTransfer(report.id))?;
        if transfer.state.is_terminal() {
            tracing::debug!(transfer_id = %report.id, "late report for settled transfer");
            return Err(TransferError::AlreadySettled(report.id));
        }
        if let Some(counters) = report.counters {
            transfer.counters = counters;
        }

        match report.outcome {
            DriveOutcome::Finished(response) if response.status == TransferStatus::Sent => {
                transfer.state = TransferState::Completed;
                let Some(reference) = response.filename.and_then(AssetReference::new) else {
                    tracing::warn!(
                        transfer_id = %report.id,
                        "upload accepted without asset reference"
                    );
                    return Err(TransferError::MissingAssetReference);
                };
                transfer.filename = Some(reference.filename().to_string());
                tracing::info!(
                    transfer_id = %report.id,
                    filename = reference.filename(),
                    acked = transfer.counters.chunks_acked,
                    retries = transfer.counters.retries_used,
                    "asset transfer completed"
                );
                Ok(reference)
            }
            DriveOutcome::Finished(response) => {
                let reason = response
                    .error
                    .unwrap_or_else(|| "unspecified error".to_string());
                Err(Self::fail(transfer, TransferFailure::Rejected(reason)))
            }
            DriveOutcome::Failed(failure) => Err(Self::fail(transfer, failure)),
        }
    }

    fn fail(transfer: &mut Transfer, failure: TransferFailure) -> TransferError {
        let err = TransferError::from_failure(&failure, transfer.counters);
        transfer.state = TransferState::Failed;
        transfer.failure = Some(failure);
        err
    }

    /// Fail every transfer that is not yet terminal.
    ///
    /// Returns the ids that were failed.
    pub fn fail_in_flight(&mut self, failure: &TransferFailure) -> Vec<TransferId> {
        let mut failed = Vec::new();
        for id in &self.order {
            if let Some(transfer) = self.transfers.get_mut(id)
                && !transfer.state.is_terminal()
            {
                Self::fail(transfer, failure.clone());
                failed.push(*id);
            }
        }
        if !failed.is_empty() {
            tracing::info!(count = failed.len(), %failure, "failed in-flight transfers");
        }
        failed
    }

    /// Look up a transfer.
    #[must_use]
    pub fn transfer(&self, id: &TransferId) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    /// All transfers, oldest first.
    #[must_use]
    pub fn transfers(&self) -> Vec<&Transfer> {
        self.order
            .iter()
            .filter_map(|id| self.transfers.get(id))
            .collect()
    }

    /// Number of transfers not yet terminal.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }
}
