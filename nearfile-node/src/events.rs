//! Typed session events, fanned out over a broadcast channel.

use std::path::PathBuf;

use nearfile_core::transfer::TransferRole;
use nearfile_core::{Checksum, DeviceId, PairCode, PairingError, Peer, TransferId};

/// Capacity of the event channel; slow listeners see `Lagged` rather than blocking the session.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Peer table changed; carries the full sorted table.
    PeersChanged(Vec<Peer>),
    /// This device initiated pairing; show the code to the operator.
    PairingCodeGenerated { peer: DeviceId, code: PairCode },
    /// A peer wants to pair; prompt the operator for the code shown on that device.
    PairingRequested { peer: DeviceId, name: String },
    PairingConnected { peer: DeviceId, name: String },
    PairingFailed(PairingError),
    ReceiveStarted {
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
    },
    Progress {
        transfer_id: TransferId,
        role: TransferRole,
        bytes: u64,
        total: u64,
    },
    SendCompleted {
        transfer_id: TransferId,
        file_name: String,
    },
    ReceiveCompleted {
        transfer_id: TransferId,
        path: PathBuf,
    },
    /// Whole-file checksum mismatch. The bytes were kept at `path` for inspection.
    ReceiveCorrupt {
        transfer_id: TransferId,
        path: Option<PathBuf>,
        expected: Checksum,
        actual: Checksum,
    },
    TransferFailed {
        transfer_id: Option<TransferId>,
        notice: String,
    },
    DuplicateTransferIgnored { transfer_id: TransferId },
    LinkInterrupted { peer: DeviceId },
    LinkRestored { peer: DeviceId },
    Disconnected { peer: DeviceId },
}

impl SessionEvent {
    /// One line for the operator, or `None` for events that are not shown.
    pub fn notification(&self) -> Option<String> {
        let line = match self {
            SessionEvent::PeersChanged(peers) => match peers.len() {
                0 => "No devices nearby".to_string(),
                1 => "1 device nearby".to_string(),
                n => format!("{n} devices nearby"),
            },
            SessionEvent::PairingCodeGenerated { code, .. } => {
                format!("Pairing code: {code}. Enter it on the other device")
            }
            SessionEvent::PairingRequested { name, .. } => {
                format!("{name} wants to pair. Enter the code shown on that device")
            }
            SessionEvent::PairingConnected { name, .. } => format!("Connected to {name}"),
            SessionEvent::PairingFailed(e) => e.notification(),
            SessionEvent::ReceiveStarted {
                file_name,
                file_size,
                ..
            } => format!("Receiving {file_name} ({file_size} bytes)"),
            SessionEvent::Progress { .. } => return None,
            SessionEvent::SendCompleted { file_name, .. } => format!("Sent {file_name}"),
            SessionEvent::ReceiveCompleted { path, .. } => {
                format!("Received {}", path.display())
            }
            SessionEvent::ReceiveCorrupt { path, .. } => match path {
                Some(p) => format!("The received file is damaged; kept as {}", p.display()),
                None => "The received file is damaged".to_string(),
            },
            SessionEvent::TransferFailed { notice, .. } => notice.clone(),
            SessionEvent::DuplicateTransferIgnored { .. } => return None,
            SessionEvent::LinkInterrupted { .. } => "Connection lost; reconnecting".to_string(),
            SessionEvent::LinkRestored { .. } => "Connection restored".to_string(),
            SessionEvent::Disconnected { .. } => "Disconnected".to_string(),
        };
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearfile_core::CancelOrigin;

    #[test]
    fn internal_events_stay_quiet() {
        let dup = SessionEvent::DuplicateTransferIgnored {
            transfer_id: TransferId::from("1"),
        };
        assert!(dup.notification().is_none());
    }

    #[test]
    fn pairing_failures_use_error_text() {
        let e = SessionEvent::PairingFailed(PairingError::Cancelled {
            origin: CancelOrigin::Peer,
        });
        assert_eq!(
            e.notification().unwrap(),
            "The other device cancelled pairing"
        );
    }
}
