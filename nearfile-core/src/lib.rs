//! Nearby file transfer protocol.
//! Host-driven: no I/O; the node runtime feeds in messages and timer events
//! and acts on the decisions returned.

pub mod checksum;
pub mod chunk;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod identity;
pub mod message;
pub mod pairing;
pub mod peer;
pub mod transfer;

pub use checksum::Checksum;
pub use chunk::{split_into_chunks, ChunkSpan, Reassembly, DEFAULT_CHUNK_SIZE, RADIO_CHUNK_SIZE};
pub use dedup::{DedupPolicy, DuplicateReason};
pub use error::{
    BindError, CancelOrigin, Error, PairingError, TransferError, TransportError,
};
pub use frame::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameKind};
pub use identity::{DeviceId, Identity, InvalidPairCode, PairCode};
pub use message::{Message, MessageError, Plane};
pub use pairing::{PairingController, PairingPhase, RequestDisposition};
pub use peer::{LinkKind, Peer, PeerChange, PeerTable};
pub use transfer::{
    now_millis, CompleteReadiness, Finish, Receiver, TransferHistory, TransferId,
    TransferIdGenerator, TransferRole, TransferState, TransferStatus,
};
