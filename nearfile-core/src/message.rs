//! Datagram-link messages: JSON objects tagged by `type`.
//!
//! Unknown or malformed types fail decoding with [`MessageError`]; there is no
//! silent default branch.

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::identity::{DeviceId, PairCode};
use crate::transfer::TransferId;

/// Largest UDP payload; a FILE_DATA message must fit in one.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// All datagram message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "DISCOVER")]
    Discover(Announce),
    #[serde(rename = "DISCOVER_REPLY")]
    DiscoverReply(Announce),
    #[serde(rename = "device_state")]
    DeviceState(DeviceState),
    #[serde(rename = "pair_request")]
    PairRequest(PairRequest),
    #[serde(rename = "pair_response")]
    PairResponse(PairResponse),
    #[serde(rename = "pair_cancel")]
    PairCancel(PairCancel),
    #[serde(rename = "PREPARE_TRANSFER")]
    PrepareTransfer(Prepare),
    #[serde(rename = "PREPARE_TRANSFER_ACK")]
    PrepareTransferAck(Prepare),
    #[serde(rename = "FILE_START")]
    FileStart(FileStart),
    #[serde(rename = "FILE_START_ACK")]
    FileStartAck(FileStartAck),
    #[serde(rename = "FILE_DATA")]
    FileData(FileData),
    #[serde(rename = "FILE_ACK")]
    FileAck(FileAck),
    #[serde(rename = "FILE_COMPLETE")]
    FileComplete(FileComplete),
    #[serde(rename = "FILE_RECEIVED_CONFIRM")]
    FileReceivedConfirm(FileReceivedConfirm),
}

/// Which datagram socket a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Discovery, pairing and transfer preparation.
    Control,
    /// Transfer announcement, chunks and their acknowledgments.
    Data,
}

/// DISCOVER / DISCOVER_REPLY body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: String,
    /// Data-socket port of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_port: Option<u16>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub device_name: String,
    pub state: LinkState,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    /// Requester's id. Older peers omit it; the receiver then resolves the peer by address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub timestamp: u64,
    pub device_name: String,
    pub pair_code: PairCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    pub success: bool,
    /// Responder.
    pub from_device_id: DeviceId,
    /// Initiator the response is addressed to.
    pub device_id: DeviceId,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_code: Option<PairCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairCancel {
    /// Device that cancelled.
    pub device_id: DeviceId,
    pub timestamp: u64,
}

/// PREPARE_TRANSFER / PREPARE_TRANSFER_ACK body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prepare {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub original_file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    /// Whole-file checksum, announced up front so a size-triggered completion can verify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStartAck {
    pub transfer_id: TransferId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub transfer_id: TransferId,
    pub chunk_index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Per-chunk checksum. The radio link has no room for it and leaves it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAck {
    pub transfer_id: TransferId,
    pub chunk_index: u32,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileComplete {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub original_file_name: String,
    pub checksum: Checksum,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReceivedConfirm {
    pub transfer_id: TransferId,
    pub file_name: String,
    /// Always "completed".
    pub status: String,
    pub timestamp: u64,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

impl Message {
    /// Encode as UTF-8 JSON.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    /// Decode one datagram. Unknown `type` values and missing fields both land here.
    pub fn decode(bytes: &[u8]) -> Result<Message, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }

    /// The wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Discover(_) => "DISCOVER",
            Message::DiscoverReply(_) => "DISCOVER_REPLY",
            Message::DeviceState(_) => "device_state",
            Message::PairRequest(_) => "pair_request",
            Message::PairResponse(_) => "pair_response",
            Message::PairCancel(_) => "pair_cancel",
            Message::PrepareTransfer(_) => "PREPARE_TRANSFER",
            Message::PrepareTransferAck(_) => "PREPARE_TRANSFER_ACK",
            Message::FileStart(_) => "FILE_START",
            Message::FileStartAck(_) => "FILE_START_ACK",
            Message::FileData(_) => "FILE_DATA",
            Message::FileAck(_) => "FILE_ACK",
            Message::FileComplete(_) => "FILE_COMPLETE",
            Message::FileReceivedConfirm(_) => "FILE_RECEIVED_CONFIRM",
        }
    }

    /// Socket this message belongs on.
    pub fn plane(&self) -> Plane {
        match self {
            Message::Discover(_)
            | Message::DiscoverReply(_)
            | Message::DeviceState(_)
            | Message::PairRequest(_)
            | Message::PairResponse(_)
            | Message::PairCancel(_)
            | Message::PrepareTransfer(_)
            | Message::PrepareTransferAck(_) => Plane::Control,
            Message::FileStart(_)
            | Message::FileStartAck(_)
            | Message::FileData(_)
            | Message::FileAck(_)
            | Message::FileComplete(_)
            | Message::FileReceivedConfirm(_) => Plane::Data,
        }
    }

    /// Transfer this message is scoped to, if any.
    pub fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            Message::PrepareTransfer(m) | Message::PrepareTransferAck(m) => Some(&m.transfer_id),
            Message::FileStart(m) => Some(&m.transfer_id),
            Message::FileStartAck(m) => Some(&m.transfer_id),
            Message::FileData(m) => Some(&m.transfer_id),
            Message::FileAck(m) => Some(&m.transfer_id),
            Message::FileComplete(m) => Some(&m.transfer_id),
            Message::FileReceivedConfirm(m) => Some(&m.transfer_id),
            _ => None,
        }
    }
}

/// Error encoding or decoding a datagram message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("unrecognized or malformed message: {0}")]
    Decode(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn discover_uses_wire_field_names() {
        let msg = Message::Discover(Announce {
            device_id: DeviceId::from("device_a"),
            device_name: "Pixel".into(),
            device_type: "android".into(),
            transfer_port: Some(41000),
            timestamp: 7,
        });
        let v: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "DISCOVER",
                "deviceId": "device_a",
                "deviceName": "Pixel",
                "deviceType": "android",
                "transferPort": 41000,
                "timestamp": 7
            })
        );
    }

    #[test]
    fn file_data_carries_base64_payload() {
        let msg = Message::FileData(FileData {
            transfer_id: TransferId::from("T1"),
            chunk_index: 3,
            data: vec![0, 1, 2, 255],
            checksum: Some(Checksum::of(&[0, 1, 2, 255])),
            timestamp: 1,
        });
        let bytes = msg.encode().unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["data"], "AAEC/w==");
        assert_eq!(v["chunkIndex"], 3);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn decodes_pair_request_without_device_id() {
        let raw = br#"{"type":"pair_request","timestamp":5,"deviceName":"phone","pairCode":"4821"}"#;
        match Message::decode(raw).unwrap() {
            Message::PairRequest(req) => {
                assert_eq!(req.device_id, None);
                assert_eq!(req.pair_code.as_str(), "4821");
            }
            other => panic!("expected pair_request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let raw = br#"{"type":"HELLO","timestamp":1}"#;
        assert!(matches!(Message::decode(raw), Err(MessageError::Decode(_))));
        assert!(matches!(
            Message::decode(b"not json"),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn missing_required_field_is_a_decode_error() {
        let raw = br#"{"type":"FILE_START_ACK","timestamp":1}"#;
        assert!(Message::decode(raw).is_err());
    }

    #[test]
    fn routes_chunks_to_the_data_plane() {
        let ack = Message::FileAck(FileAck {
            transfer_id: TransferId::from("T"),
            chunk_index: 0,
            status: AckStatus::Success,
            error: None,
            timestamp: 0,
        });
        assert_eq!(ack.plane(), Plane::Data);
        assert_eq!(ack.kind(), "FILE_ACK");
        let cancel = Message::PairCancel(PairCancel {
            device_id: DeviceId::from("d"),
            timestamp: 0,
        });
        assert_eq!(cancel.plane(), Plane::Control);
        assert!(cancel.transfer_id().is_none());
    }
}
