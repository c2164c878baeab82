//! Error taxonomy shared by the core state machines and the node runtime.

use crate::checksum::Checksum;
use crate::frame::{FrameDecodeError, FrameEncodeError};
use crate::identity::DeviceId;
use crate::message::MessageError;
use crate::transfer::TransferId;

/// Any failure surfaced to the caller of a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("frame encode error: {0}")]
    FrameEncode(#[from] FrameEncodeError),
    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// One human-readable line per failure category.
    pub fn notification(&self) -> String {
        match self {
            Error::Bind(_) => "No free network port; discovery is unavailable".into(),
            Error::Transport(e) => format!("Connection problem: {e}"),
            Error::Transfer(e) => e.notification(),
            Error::Pairing(e) => e.notification(),
            Error::FrameEncode(_) | Error::FrameDecode(_) | Error::Message(_) => {
                "Received data could not be understood".into()
            }
            Error::Io(e) => format!("File error: {e}"),
        }
    }
}

/// No free port (or radio channel) after a bounded scan.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no free port after {attempts} attempts starting at {base}")]
pub struct BindError {
    pub base: u16,
    pub attempts: u16,
}

/// Send failure after any link-level retries were exhausted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("send failed after {attempts} attempt(s): {reason}")]
    SendFailed { attempts: u32, reason: String },
    #[error("{0} cannot be carried on this link")]
    Unsupported(&'static str),
    #[error("no route to peer {0}")]
    NoRoute(DeviceId),
    #[error("link is not available")]
    LinkUnavailable,
    #[error("channel closed")]
    Closed,
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Transfer-scoped failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("another transfer is already in progress")]
    TransferInProgress,
    #[error("receiver did not acknowledge the transfer announcement")]
    StartAckTimeout,
    #[error("receiver did not confirm the completed file")]
    ConfirmTimeout,
    #[error("chunk {index} failed its checksum")]
    ChunkChecksumMismatch { index: u32 },
    #[error("file checksum mismatch: expected {expected}, got {actual}")]
    WholeFileChecksumMismatch { expected: Checksum, actual: Checksum },
    #[error("message for unknown transfer {0}")]
    UnknownTransfer(TransferId),
    #[error("file has {chunks} chunks; the radio link indexes at most {max}")]
    TooManyChunks { chunks: u64, max: u64 },
    #[error("transfer aborted: {0}")]
    Aborted(String),
    #[error("peer {0} is not connected")]
    NotConnected(DeviceId),
}

impl TransferError {
    pub fn notification(&self) -> String {
        match self {
            TransferError::TransferInProgress => "A transfer is already running".into(),
            TransferError::StartAckTimeout => "The other device did not respond".into(),
            TransferError::ConfirmTimeout => "The other device did not confirm the file".into(),
            TransferError::ChunkChecksumMismatch { .. } => "Part of the file arrived damaged".into(),
            TransferError::WholeFileChecksumMismatch { .. } => {
                "The received file is damaged".into()
            }
            TransferError::UnknownTransfer(_) => "Received data for an unknown transfer".into(),
            TransferError::TooManyChunks { .. } => "File is too large for this link".into(),
            TransferError::Aborted(reason) => format!("Transfer stopped: {reason}"),
            TransferError::NotConnected(_) => "Pair with a device before sending".into(),
        }
    }
}

/// Who cancelled a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// This device's operator.
    Local,
    /// The other device.
    Peer,
}

/// Pairing-attempt failures. None of these touch the peer table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing rejected: {reason}")]
    Rejected { reason: String },
    #[error("pairing timed out")]
    Timeout,
    #[error("pairing cancelled ({origin:?})")]
    Cancelled { origin: CancelOrigin },
    #[error("code does not match")]
    CodeMismatch,
    #[error("code must be four digits")]
    InvalidCode,
    #[error("no pairing attempt in progress")]
    NoAttempt,
    #[error("a pairing attempt is already in progress")]
    Busy,
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceId),
}

impl PairingError {
    pub fn notification(&self) -> String {
        match self {
            PairingError::Rejected { reason } => format!("Pairing refused: {reason}"),
            PairingError::Timeout => "Pairing timed out".into(),
            PairingError::Cancelled {
                origin: CancelOrigin::Local,
            } => "You cancelled pairing".into(),
            PairingError::Cancelled {
                origin: CancelOrigin::Peer,
            } => "The other device cancelled pairing".into(),
            PairingError::CodeMismatch => "Wrong pairing code".into(),
            PairingError::InvalidCode => "Enter a 4-digit code".into(),
            PairingError::NoAttempt => "No pairing in progress".into(),
            PairingError::Busy => "Already pairing with a device".into(),
            PairingError::UnknownPeer(_) => "That device is no longer nearby".into(),
        }
    }
}
