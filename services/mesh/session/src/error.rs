//! Handshake, transport and upgrade error types.

use crate::stage::Stage;
use mesh_storage::StoreError;
use mesh_wire::{AckStatus, Capability, PacketType, WireError};
use thiserror::Error;

/// Bearer transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link was disconnected
    #[error("link closed")]
    Closed,
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),
    /// Outbound frame rejected by the codec
    #[error("frame rejected: {0}")]
    Frame(#[from] WireError),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Bearer upgrade errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    /// No rendezvous provider for the elected bearer
    #[error("no rendezvous provider for {0}")]
    Unsupported(Capability),
    /// Rendezvous metadata missing or malformed
    #[error("bad rendezvous metadata: {0}")]
    Metadata(String),
    /// Rendezvous could not be created
    #[error("rendezvous creation failed: {0}")]
    Create(String),
    /// Joining the rendezvous failed
    #[error("connect failed: {0}")]
    Connect(String),
    /// Accepting a peer on the rendezvous failed
    #[error("accept failed: {0}")]
    Accept(String),
}

/// Errors that end a handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Framing or packet error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Link failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Bearer upgrade failure
    #[error("upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Revealed LUID does not match its commitment
    #[error("LUID does not match its commitment")]
    InvalidLuid,

    /// Election reveals do not match their commitments
    #[error("election reveals do not match commitments")]
    ElectionVerification,

    /// No unique election winner
    #[error("election has no unique winner")]
    ElectionDegenerate,

    /// Local outcomes named different next stages
    #[error("conflicting next stage: {0} vs {1}")]
    ProtocolConflict(Stage, Stage),

    /// Stage or barrier did not finish in time
    #[error("stage {0} timed out")]
    StageTimeout(Stage),

    /// A handshake with this remote is already running
    #[error("transaction already in progress for {0}")]
    TransactionBusy(String),

    /// Peer sent a packet the current stage does not expect
    #[error("unexpected {got:?} packet in stage {stage}")]
    UnexpectedPacket {
        /// Stage being run
        stage: Stage,
        /// Packet type received
        got: PacketType,
    },

    /// Peer acknowledged its stage with a failure
    #[error("peer failed stage: {status:?} {message}")]
    PeerFailed {
        /// Peer's status code
        status: AckStatus,
        /// Peer's reason
        message: String,
    },

    /// Session disposed before it finished
    #[error("session disposed")]
    Disposed,

    /// Stage traffic attempted while no stage holds the gate
    #[error("no stage is running")]
    Ungated,

    /// Step task panicked or was cancelled
    #[error("stage task failed: {0}")]
    Task(String),
}

impl HandshakeError {
    /// Status code reported to the peer in a failure ack
    pub fn ack_status(&self) -> AckStatus {
        match self {
            HandshakeError::StageTimeout(_) => AckStatus::Timeout,
            HandshakeError::ProtocolConflict(..) => AckStatus::Conflict,
            HandshakeError::TransactionBusy(_) => AckStatus::Busy,
            HandshakeError::Wire(_)
            | HandshakeError::InvalidLuid
            | HandshakeError::ElectionVerification
            | HandshakeError::UnexpectedPacket { .. } => AckStatus::Invalid,
            _ => AckStatus::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_status_mapping() {
        assert_eq!(HandshakeError::InvalidLuid.ack_status(), AckStatus::Invalid);
        assert_eq!(
            HandshakeError::StageTimeout(Stage::Election).ack_status(),
            AckStatus::Timeout
        );
        assert_eq!(
            HandshakeError::ProtocolConflict(Stage::Upgrade, Stage::Identity).ack_status(),
            AckStatus::Conflict
        );
        assert_eq!(HandshakeError::ElectionDegenerate.ack_status(), AckStatus::Fatal);
        assert_eq!(
            HandshakeError::from(WireError::Integrity).ack_status(),
            AckStatus::Invalid
        );
    }
}
