//! Pairing state machine: numeric-code challenge/response between two peers.
//!
//! The initiator generates a code and sends it in `pair_request`; the
//! responder's operator must type the same code back. The code travels
//! in-band, so this is operator confirmation, not authentication.
//!
//! ```text
//! Idle -> RequestSent (initiator) | RequestReceived (responder)
//!      -> CodeConfirmed -> Connected
//! any non-terminal -> Cancelled
//! ```

use std::time::{Duration, Instant};

use crate::error::{CancelOrigin, PairingError};
use crate::identity::{DeviceId, PairCode};
use crate::message::PairResponse;

/// Default time an attempt may sit without a response.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    RequestSent,
    RequestReceived,
    CodeConfirmed,
    Connected,
    Cancelled,
}

impl PairingPhase {
    fn is_pending(self) -> bool {
        matches!(
            self,
            PairingPhase::RequestSent | PairingPhase::RequestReceived | PairingPhase::CodeConfirmed
        )
    }
}

/// One in-flight attempt. `seq` identifies it to timers armed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAttempt {
    pub seq: u64,
    pub peer_id: DeviceId,
    pub code: PairCode,
    pub initiated_by_self: bool,
    pub started_at: Instant,
}

/// What to do with an inbound `pair_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Show the operator a code prompt. `yielded` is set when this device had
    /// its own request outstanding to the same peer and gave up the initiator role.
    Prompt { seq: u64, yielded: bool },
    /// Both sides initiated; this side keeps the initiator role and ignores the request.
    KeepInitiator,
    /// Busy with a different peer; reply with a rejection.
    Busy,
}

#[derive(Debug)]
pub struct PairingController {
    self_id: DeviceId,
    phase: PairingPhase,
    attempt: Option<PairingAttempt>,
    connected_peer: Option<DeviceId>,
    next_seq: u64,
}

impl PairingController {
    pub fn new(self_id: DeviceId) -> Self {
        Self {
            self_id,
            phase: PairingPhase::Idle,
            attempt: None,
            connected_peer: None,
            next_seq: 1,
        }
    }

    pub fn phase(&self) -> PairingPhase {
        self.phase
    }

    pub fn attempt(&self) -> Option<&PairingAttempt> {
        self.attempt.as_ref()
    }

    pub fn connected_peer(&self) -> Option<&DeviceId> {
        self.connected_peer.as_ref()
    }

    fn begin(&mut self, peer_id: DeviceId, code: PairCode, by_self: bool, now: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.attempt = Some(PairingAttempt {
            seq,
            peer_id,
            code,
            initiated_by_self: by_self,
            started_at: now,
        });
        self.phase = if by_self {
            PairingPhase::RequestSent
        } else {
            PairingPhase::RequestReceived
        };
        seq
    }

    fn end(&mut self, phase: PairingPhase) -> Option<PairingAttempt> {
        self.phase = phase;
        self.attempt.take()
    }

    /// Start pairing with `peer_id` as initiator. Returns the code to show locally.
    pub fn initiate(&mut self, peer_id: DeviceId, now: Instant) -> Result<PairingAttempt, PairingError> {
        if self.phase.is_pending() {
            return Err(PairingError::Busy);
        }
        let code = PairCode::generate();
        self.begin(peer_id, code, true, now);
        self.attempt.clone().ok_or(PairingError::NoAttempt)
    }

    /// Inbound `pair_request` from `from` carrying `code`.
    pub fn on_request(&mut self, from: DeviceId, code: PairCode, now: Instant) -> RequestDisposition {
        let same_peer = self.attempt.as_ref().is_some_and(|a| a.peer_id == from);
        match self.phase {
            PairingPhase::RequestSent if same_peer => {
                // Simultaneous initiation: the smaller id stays initiator.
                if self.self_id < from {
                    return RequestDisposition::KeepInitiator;
                }
                let seq = self.begin(from, code, false, now);
                RequestDisposition::Prompt { seq, yielded: true }
            }
            PairingPhase::RequestReceived if same_peer => {
                // Retransmitted request; the newest code wins.
                let seq = self.begin(from, code, false, now);
                RequestDisposition::Prompt {
                    seq,
                    yielded: false,
                }
            }
            phase if phase.is_pending() => RequestDisposition::Busy,
            _ => {
                let seq = self.begin(from, code, false, now);
                RequestDisposition::Prompt {
                    seq,
                    yielded: false,
                }
            }
        }
    }

    /// Responder's operator entered a value. A wrong value leaves the attempt untouched.
    pub fn submit_code(&mut self, entered: &str) -> Result<PairingAttempt, PairingError> {
        if self.phase != PairingPhase::RequestReceived {
            return Err(PairingError::NoAttempt);
        }
        let entered = PairCode::parse(entered).ok_or(PairingError::InvalidCode)?;
        let attempt = self.attempt.as_ref().ok_or(PairingError::NoAttempt)?;
        if attempt.code != entered {
            return Err(PairingError::CodeMismatch);
        }
        self.phase = PairingPhase::CodeConfirmed;
        Ok(attempt.clone())
    }

    /// Responder: the confirming `pair_response` went out; the peer is now connected.
    pub fn mark_connected(&mut self) -> Result<DeviceId, PairingError> {
        if self.phase != PairingPhase::CodeConfirmed {
            return Err(PairingError::NoAttempt);
        }
        let attempt = self.end(PairingPhase::Connected).ok_or(PairingError::NoAttempt)?;
        self.connected_peer = Some(attempt.peer_id.clone());
        Ok(attempt.peer_id)
    }

    /// Responder's operator declined the request.
    pub fn reject(&mut self) -> Result<PairingAttempt, PairingError> {
        if self.phase != PairingPhase::RequestReceived {
            return Err(PairingError::NoAttempt);
        }
        self.end(PairingPhase::Cancelled).ok_or(PairingError::NoAttempt)
    }

    /// Initiator: a `pair_response` arrived. `success:false` ends the attempt.
    pub fn on_response(&mut self, resp: &PairResponse) -> Result<DeviceId, PairingError> {
        if self.phase != PairingPhase::RequestSent || resp.device_id != self.self_id {
            return Err(PairingError::NoAttempt);
        }
        let attempt = self.attempt.as_ref().ok_or(PairingError::NoAttempt)?;
        if attempt.peer_id != resp.from_device_id {
            return Err(PairingError::UnknownPeer(resp.from_device_id.clone()));
        }
        if !resp.success {
            self.end(PairingPhase::Cancelled);
            return Err(PairingError::Rejected {
                reason: resp
                    .reason
                    .clone()
                    .unwrap_or_else(|| "declined".to_string()),
            });
        }
        if resp.pair_code.as_ref().is_some_and(|c| *c != attempt.code) {
            return Err(PairingError::CodeMismatch);
        }
        let attempt = self.end(PairingPhase::Connected).ok_or(PairingError::NoAttempt)?;
        self.connected_peer = Some(attempt.peer_id.clone());
        Ok(attempt.peer_id)
    }

    /// Local operator cancels the pending attempt.
    pub fn cancel_local(&mut self) -> Result<PairingAttempt, PairingError> {
        if !self.phase.is_pending() {
            return Err(PairingError::NoAttempt);
        }
        self.end(PairingPhase::Cancelled).ok_or(PairingError::NoAttempt)
    }

    /// Inbound `pair_cancel`. Own id means our own broadcast came back.
    /// A foreign id only cancels an attempt with that same peer.
    pub fn on_cancel(&mut self, canceller: &DeviceId) -> Option<CancelOrigin> {
        if *canceller == self.self_id {
            return Some(CancelOrigin::Local);
        }
        let matches = self.phase.is_pending()
            && self.attempt.as_ref().is_some_and(|a| a.peer_id == *canceller);
        if !matches {
            return None;
        }
        self.end(PairingPhase::Cancelled);
        Some(CancelOrigin::Peer)
    }

    /// Timer for attempt `seq` fired. Returns the attempt if it was still pending.
    pub fn expire(&mut self, seq: u64) -> Option<PairingAttempt> {
        let pending = self.phase.is_pending() && self.attempt.as_ref().is_some_and(|a| a.seq == seq);
        if !pending {
            return None;
        }
        self.end(PairingPhase::Cancelled)
    }

    /// The connected peer went away.
    pub fn disconnect(&mut self) -> Option<DeviceId> {
        if self.phase == PairingPhase::Connected {
            self.phase = PairingPhase::Idle;
        }
        self.connected_peer.take()
    }

    /// Drop everything (session teardown).
    pub fn reset(&mut self) {
        self.phase = PairingPhase::Idle;
        self.attempt = None;
        self.connected_peer = None;
    }
}
