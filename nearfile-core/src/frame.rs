//! Radio-link framing: fixed 8-byte big-endian header + payload.
//!
//! ```text
//! offset 0: u32 magic
//! offset 4: u8  version
//! offset 5: u8  kind
//! offset 6: u16 payload length
//! offset 8: payload
//! ```

pub const MAGIC: u32 = 0xAA55_AA55;
pub const FRAME_VERSION: u8 = 0x02;
pub const HEADER_LEN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Length of the chunk index that prefixes every FILE_DATA payload.
pub const CHUNK_INDEX_LEN: usize = 2;

/// Message kind carried in byte 5 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    FileInfo = 1,
    FileData = 2,
    Ack = 3,
    Resume = 4,
    Error = 5,
    PairRequest = 6,
    PairResponse = 7,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameDecodeError;

    fn try_from(b: u8) -> Result<Self, FrameDecodeError> {
        Ok(match b {
            1 => FrameKind::FileInfo,
            2 => FrameKind::FileData,
            3 => FrameKind::Ack,
            4 => FrameKind::Resume,
            5 => FrameKind::Error,
            6 => FrameKind::PairRequest,
            7 => FrameKind::PairResponse,
            other => return Err(FrameDecodeError::UnknownKind(other)),
        })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Encode a frame: header + payload.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.push(FRAME_VERSION);
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes does not fit a frame")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Returns `NeedMore` on a partial buffer; the caller should retry after more data arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != MAGIC {
        return Err(FrameDecodeError::BadMagic(magic));
    }
    if bytes[4] != FRAME_VERSION {
        return Err(FrameDecodeError::UnsupportedVersion(bytes[4]));
    }
    let kind = FrameKind::try_from(bytes[5])?;
    let len = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
    if bytes.len() < HEADER_LEN + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let payload = bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
    Ok((Frame { kind, payload }, HEADER_LEN + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("FILE_DATA payload shorter than its chunk index")]
    ShortChunk,
}

/// FILE_DATA payload: `u16 chunk index` followed by raw chunk bytes.
pub fn encode_chunk_payload(index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_INDEX_LEN + chunk.len());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(chunk);
    out
}

/// Split a FILE_DATA payload into its chunk index and bytes.
pub fn decode_chunk_payload(payload: &[u8]) -> Result<(u16, &[u8]), FrameDecodeError> {
    if payload.len() < CHUNK_INDEX_LEN {
        return Err(FrameDecodeError::ShortChunk);
    }
    let index = u16::from_be_bytes([payload[0], payload[1]]);
    Ok((index, &payload[CHUNK_INDEX_LEN..]))
}
