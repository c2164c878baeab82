//! Radio link: every message travels as one binary frame over a small-MTU,
//! point-to-point link. Writes may fail transiently and are retried with a
//! fixed backoff; the platform radio itself sits behind [`RadioLink`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nearfile_core::frame::{decode_chunk_payload, encode_chunk_payload, MAGIC};
use nearfile_core::message::{
    AckStatus, FileAck, FileData, FileReceivedConfirm, FileStart, FileStartAck, PairRequest,
    PairResponse,
};
use nearfile_core::{
    decode_frame, encode_frame, now_millis, Frame, FrameDecodeError, FrameKind, LinkKind, Message,
    Peer, TransferId, TransportError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Inbound, InboundSender, Origin, TransportChannel};

/// Attempts per frame write before the operation fails.
pub const RADIO_WRITE_ATTEMPTS: u32 = 3;

/// Chunk indices are 16 bits on this link.
pub const RADIO_MAX_CHUNKS: u64 = u16::MAX as u64 + 1;

/// What the platform radio reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioNotification {
    /// Bytes arrived on the characteristic; may hold a partial or several frames.
    Value(Vec<u8>),
    /// Link dropped.
    Dropped,
}

/// Platform radio capability.
#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> std::io::Result<()>;
    fn is_connected(&self) -> bool;
    async fn reconnect(&self) -> std::io::Result<()>;
    /// Notification stream. A new call replaces the previous subscriber.
    fn notifications(&self) -> mpsc::UnboundedReceiver<RadioNotification>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AckStage {
    Start,
    Chunk,
    Complete,
}

/// ACK frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadioAck {
    transfer_id: TransferId,
    stage: AckStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
}

/// ERROR frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadioFault {
    transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_index: Option<u32>,
    error: String,
}

fn json<T: Serialize>(kind: FrameKind, body: &T) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_vec(body).map_err(|e| TransportError::Encode(e.to_string()))?;
    encode_frame(kind, &payload).map_err(|e| TransportError::Encode(e.to_string()))
}

/// Map a message onto its frame. Messages with no frame kind are refused.
pub fn message_to_frame(message: &Message) -> Result<Vec<u8>, TransportError> {
    match message {
        Message::FileStart(m) => json(FrameKind::FileInfo, m),
        Message::FileData(m) => {
            let index = u16::try_from(m.chunk_index).map_err(|_| {
                TransportError::Encode(format!("chunk index {} exceeds 16 bits", m.chunk_index))
            })?;
            encode_frame(FrameKind::FileData, &encode_chunk_payload(index, &m.data))
                .map_err(|e| TransportError::Encode(e.to_string()))
        }
        Message::FileStartAck(m) => json(
            FrameKind::Ack,
            &RadioAck {
                transfer_id: m.transfer_id.clone(),
                stage: AckStage::Start,
                chunk_index: None,
                file_name: None,
            },
        ),
        Message::FileAck(m) if m.status == AckStatus::Success => json(
            FrameKind::Ack,
            &RadioAck {
                transfer_id: m.transfer_id.clone(),
                stage: AckStage::Chunk,
                chunk_index: Some(m.chunk_index),
                file_name: None,
            },
        ),
        Message::FileAck(m) => json(
            FrameKind::Error,
            &RadioFault {
                transfer_id: m.transfer_id.clone(),
                chunk_index: Some(m.chunk_index),
                error: m.error.clone().unwrap_or_else(|| "rejected".to_string()),
            },
        ),
        Message::FileReceivedConfirm(m) => json(
            FrameKind::Ack,
            &RadioAck {
                transfer_id: m.transfer_id.clone(),
                stage: AckStage::Complete,
                chunk_index: None,
                file_name: Some(m.file_name.clone()),
            },
        ),
        Message::PairRequest(m) => json(FrameKind::PairRequest, m),
        Message::PairResponse(m) => json(FrameKind::PairResponse, m),
        other => Err(TransportError::Unsupported(other.kind())),
    }
}

/// Accumulates notification bytes and yields complete messages.
///
/// FILE_DATA frames carry no transfer id; they belong to the transfer named by
/// the most recent FILE_INFO.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    current: Option<TransferId>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match decode_frame(&self.buf) {
                Ok((frame, used)) => {
                    self.buf.drain(..used);
                    if let Some(m) = self.translate(frame) {
                        out.push(m);
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "bad radio frame; resynchronizing");
                    self.resync();
                }
            }
        }
        out
    }

    /// Drop bytes up to the next magic after the current position.
    fn resync(&mut self) {
        let magic = MAGIC.to_be_bytes();
        let next = self
            .buf
            .windows(magic.len())
            .skip(1)
            .position(|w| w == magic)
            .map(|p| p + 1);
        match next {
            Some(at) => {
                self.buf.drain(..at);
            }
            None => self.buf.clear(),
        }
    }

    fn translate(&mut self, frame: Frame) -> Option<Message> {
        let parsed = match frame.kind {
            FrameKind::FileInfo => serde_json::from_slice::<FileStart>(&frame.payload)
                .map(|start| {
                    self.current = Some(start.transfer_id.clone());
                    Message::FileStart(start)
                })
                .map_err(|e| e.to_string()),
            FrameKind::FileData => {
                let Some(transfer_id) = self.current.clone() else {
                    tracing::warn!("FILE_DATA before FILE_INFO; dropped");
                    return None;
                };
                decode_chunk_payload(&frame.payload)
                    .map(|(index, data)| {
                        Message::FileData(FileData {
                            transfer_id,
                            chunk_index: u32::from(index),
                            data: data.to_vec(),
                            checksum: None,
                            timestamp: now_millis(),
                        })
                    })
                    .map_err(|e| e.to_string())
            }
            FrameKind::Ack => serde_json::from_slice::<RadioAck>(&frame.payload)
                .map(ack_to_message)
                .map_err(|e| e.to_string()),
            FrameKind::Error => serde_json::from_slice::<RadioFault>(&frame.payload)
                .map(|fault| {
                    Message::FileAck(FileAck {
                        transfer_id: fault.transfer_id,
                        chunk_index: fault.chunk_index.unwrap_or(0),
                        status: AckStatus::Error,
                        error: Some(fault.error),
                        timestamp: now_millis(),
                    })
                })
                .map_err(|e| e.to_string()),
            FrameKind::Resume => {
                tracing::debug!(len = frame.payload.len(), "RESUME frame ignored");
                return None;
            }
            FrameKind::PairRequest => serde_json::from_slice::<PairRequest>(&frame.payload)
                .map(Message::PairRequest)
                .map_err(|e| e.to_string()),
            FrameKind::PairResponse => serde_json::from_slice::<PairResponse>(&frame.payload)
                .map(Message::PairResponse)
                .map_err(|e| e.to_string()),
        };
        match parsed {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(kind = ?frame.kind, error = %e, "undecodable radio payload");
                None
            }
        }
    }
}

fn ack_to_message(ack: RadioAck) -> Message {
    let timestamp = now_millis();
    match ack.stage {
        AckStage::Start => Message::FileStartAck(FileStartAck {
            transfer_id: ack.transfer_id,
            timestamp,
        }),
        AckStage::Chunk => Message::FileAck(FileAck {
            transfer_id: ack.transfer_id,
            chunk_index: ack.chunk_index.unwrap_or(0),
            status: AckStatus::Success,
            error: None,
            timestamp,
        }),
        AckStage::Complete => Message::FileReceivedConfirm(FileReceivedConfirm {
            transfer_id: ack.transfer_id,
            file_name: ack.file_name.unwrap_or_default(),
            status: "completed".to_string(),
            timestamp,
        }),
    }
}

pub struct RadioChannel {
    link: Arc<dyn RadioLink>,
    backoff: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RadioChannel {
    pub fn new(link: Arc<dyn RadioLink>, backoff: Duration) -> Self {
        Self {
            link,
            backoff,
            reader: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.link
            .reconnect()
            .await
            .map_err(|e| TransportError::SendFailed {
                attempts: 1,
                reason: e.to_string(),
            })
    }

    async fn write_frame(&self, kind: &'static str, frame: &[u8]) -> Result<(), TransportError> {
        let mut reason = String::new();
        for attempt in 1..=RADIO_WRITE_ATTEMPTS {
            match self.link.write(frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(kind, attempt, error = %e, "radio write failed");
                    reason = e.to_string();
                    if attempt < RADIO_WRITE_ATTEMPTS {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        tracing::warn!(kind, attempts = RADIO_WRITE_ATTEMPTS, "radio write retries exhausted");
        Err(TransportError::SendFailed {
            attempts: RADIO_WRITE_ATTEMPTS,
            reason,
        })
    }

    fn lock_reader(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn notification_loop(
    mut notes: mpsc::UnboundedReceiver<RadioNotification>,
    handler: InboundSender,
) {
    let mut reader = FrameReader::new();
    while let Some(note) = notes.recv().await {
        match note {
            RadioNotification::Value(bytes) => {
                for message in reader.push(&bytes) {
                    let inbound = Inbound::Message {
                        origin: Origin::Radio,
                        message,
                    };
                    if handler.send(inbound).is_err() {
                        return;
                    }
                }
            }
            RadioNotification::Dropped => {
                tracing::info!("radio link dropped");
                if handler.send(Inbound::LinkDropped(LinkKind::Radio)).is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TransportChannel for RadioChannel {
    fn link(&self) -> LinkKind {
        LinkKind::Radio
    }

    fn is_up(&self) -> bool {
        self.link.is_connected()
    }

    async fn send(&self, _peer: &Peer, message: &Message) -> Result<(), TransportError> {
        let frame = message_to_frame(message)?;
        self.write_frame(message.kind(), &frame).await
    }

    async fn reply(&self, _origin: &Origin, message: &Message) -> Result<(), TransportError> {
        let frame = message_to_frame(message)?;
        self.write_frame(message.kind(), &frame).await
    }

    fn on_receive(&self, handler: InboundSender) {
        let notes = self.link.notifications();
        let task = tokio::spawn(notification_loop(notes, handler));
        if let Some(old) = self.lock_reader().replace(task) {
            old.abort();
        }
    }

    async fn close(&self) {
        if let Some(task) = self.lock_reader().take() {
            task.abort();
        }
    }
}

impl Drop for RadioChannel {
    fn drop(&mut self) {
        if let Some(task) = self.lock_reader().take() {
            task.abort();
        }
    }
}

/// In-memory radio link with write-failure injection.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::io;
    use std::sync::Weak;

    #[derive(Default)]
    struct Inner {
        connected: bool,
        reconnect_ok: bool,
        reconnects: u32,
        write_attempts: u32,
        fail_writes: u32,
        written: Vec<Vec<u8>>,
        subscriber: Option<mpsc::UnboundedSender<RadioNotification>>,
        peer: Option<Weak<Mutex<Inner>>>,
    }

    #[derive(Clone)]
    pub struct MockRadioLink {
        inner: Arc<Mutex<Inner>>,
    }

    impl Default for MockRadioLink {
        fn default() -> Self {
            Self::new()
        }
    }

    fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
        inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    impl MockRadioLink {
        /// A connected link with no far end; writes are only recorded.
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    connected: true,
                    reconnect_ok: true,
                    ..Inner::default()
                })),
            }
        }

        /// Two links wired back to back: a write on one arrives as a notification on the other.
        pub fn pair() -> (Self, Self) {
            let a = Self::new();
            let b = Self::new();
            lock(&a.inner).peer = Some(Arc::downgrade(&b.inner));
            lock(&b.inner).peer = Some(Arc::downgrade(&a.inner));
            (a, b)
        }

        /// Fail the next `n` writes.
        pub fn fail_next_writes(&self, n: u32) {
            lock(&self.inner).fail_writes = n;
        }

        pub fn write_attempts(&self) -> u32 {
            lock(&self.inner).write_attempts
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            lock(&self.inner).written.clone()
        }

        pub fn set_reconnect_ok(&self, ok: bool) {
            lock(&self.inner).reconnect_ok = ok;
        }

        pub fn reconnects(&self) -> u32 {
            lock(&self.inner).reconnects
        }

        /// Inject inbound bytes as if the far end wrote them.
        pub fn deliver(&self, bytes: Vec<u8>) {
            if let Some(tx) = &lock(&self.inner).subscriber {
                let _ = tx.send(RadioNotification::Value(bytes));
            }
        }

        /// Simulate the link dropping.
        pub fn drop_link(&self) {
            let mut inner = lock(&self.inner);
            inner.connected = false;
            if let Some(tx) = &inner.subscriber {
                let _ = tx.send(RadioNotification::Dropped);
            }
        }
    }

    #[async_trait]
    impl RadioLink for MockRadioLink {
        async fn write(&self, bytes: &[u8]) -> io::Result<()> {
            let peer = {
                let mut inner = lock(&self.inner);
                inner.write_attempts += 1;
                if inner.fail_writes > 0 {
                    inner.fail_writes -= 1;
                    return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
                }
                if !inner.connected {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "radio link down"));
                }
                inner.written.push(bytes.to_vec());
                inner.peer.as_ref().and_then(Weak::upgrade)
            };
            if let Some(peer) = peer {
                if let Some(tx) = &lock(&peer).subscriber {
                    let _ = tx.send(RadioNotification::Value(bytes.to_vec()));
                }
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            lock(&self.inner).connected
        }

        async fn reconnect(&self) -> io::Result<()> {
            let mut inner = lock(&self.inner);
            inner.reconnects += 1;
            if inner.reconnect_ok {
                inner.connected = true;
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::NotConnected, "peer out of range"))
            }
        }

        fn notifications(&self) -> mpsc::UnboundedReceiver<RadioNotification> {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&self.inner).subscriber = Some(tx);
            rx
        }
    }
}
