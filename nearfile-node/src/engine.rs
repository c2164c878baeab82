//! Transfer engine: drives one outbound file at a time and the receive side
//! of inbound transfers.
//!
//! Outbound acknowledgments reach the sending task through an mpsc channel
//! registered for the active transfer id; anything for another id is stale
//! and dropped. Link loss pauses the sending task until the session reports
//! the link back or gives up on it.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearfile_core::chunk::{split_into_chunks, ChunkInsert, ChunkSpan};
use nearfile_core::dedup::DedupPolicy;
use nearfile_core::message::{
    AckStatus, FileAck, FileComplete, FileData, FileReceivedConfirm, FileStart, FileStartAck,
    Prepare,
};
use nearfile_core::transfer::{StartDecision, TransferRole};
use nearfile_core::{
    now_millis, Checksum, CompleteReadiness, Error, Finish, LinkKind, Message, Peer, Receiver,
    TransferError, TransferHistory, TransferId, TransferIdGenerator, TransferState, TransferStatus,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout_at;

use crate::config::Config;
use crate::events::SessionEvent;
use crate::session::RECONNECT_ATTEMPTS;
use crate::storage::FileStore;
use crate::transport::radio::RADIO_MAX_CHUNKS;
use crate::transport::{Origin, TransportChannel};

/// FILE_START is sent at most this many times.
pub const START_ATTEMPTS: u32 = 3;
/// Retransmissions allowed per chunk after a negative acknowledgment.
pub const MAX_CHUNK_RETRIES: u32 = 3;
/// Missing chunks requested in response to one early FILE_COMPLETE.
const MAX_NACKS_PER_COMPLETE: usize = 32;
/// Confirmation rounds without any retransmission before the sender gives up.
/// On datagram links each round starts with a fresh FILE_COMPLETE.
const COMPLETE_ROUNDS: u32 = 4;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chunk_size: u32,
    pub radio_chunk_size: u32,
    pub warmup: Duration,
    pub start_ack_timeout: Duration,
    pub confirm_timeout: Duration,
    /// How long a paused send waits for the link to come back.
    pub link_grace: Duration,
    pub dedup: DedupPolicy,
}

impl EngineSettings {
    pub fn from_config(c: &Config) -> Self {
        Self {
            chunk_size: c.chunk_size,
            radio_chunk_size: c.radio_chunk_size,
            warmup: c.timing.warmup(),
            start_ack_timeout: c.timing.start_ack_timeout(),
            confirm_timeout: c.timing.confirm_timeout(),
            link_grace: c.timing.reconnect_interval() * (RECONNECT_ATTEMPTS + 2),
            dedup: c.timing.dedup_policy(),
        }
    }
}

/// Feedback from the receiver, or from the session about the link, to the sending task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Signal {
    StartAcked,
    ChunkAcked(u32),
    ChunkRejected(u32),
    Confirmed,
    Interrupted,
    Resumed,
    Aborted(String),
}

struct Outbound {
    state: TransferState,
    signals: mpsc::UnboundedSender<Signal>,
}

/// Holds the single-flight flag for the lifetime of one send.
struct SendGuard(Arc<AtomicBool>);

impl SendGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SendGuard(flag.clone()))
    }
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type Signals = mpsc::UnboundedReceiver<Signal>;

enum Wait {
    Signal(Signal),
    Elapsed,
}

/// One file being sent.
struct Outgoing {
    id: TransferId,
    file_name: String,
    bytes: Vec<u8>,
    spans: Vec<ChunkSpan>,
    checksum: Checksum,
    retries: HashMap<u32, u32>,
    /// Feedback that arrived while paused, handled once the link is back.
    deferred: VecDeque<Signal>,
    /// Something was retransmitted (or the send was paused) this confirmation round.
    active_round: bool,
}

impl Outgoing {
    fn chunk(&self, index: u32) -> Option<Message> {
        let span = self.spans.get(index as usize)?;
        let data = span.slice(&self.bytes).to_vec();
        Some(Message::FileData(FileData {
            transfer_id: self.id.clone(),
            chunk_index: span.index,
            checksum: Some(Checksum::of(&data)),
            data,
            timestamp: now_millis(),
        }))
    }

    fn complete(&self) -> Message {
        Message::FileComplete(FileComplete {
            transfer_id: self.id.clone(),
            file_name: self.file_name.clone(),
            original_file_name: self.file_name.clone(),
            checksum: self.checksum,
            timestamp: now_millis(),
        })
    }

    async fn next_signal(
        &mut self,
        rx: &mut Signals,
        deadline: tokio::time::Instant,
    ) -> Result<Wait, Error> {
        if let Some(signal) = self.deferred.pop_front() {
            return Ok(Wait::Signal(signal));
        }
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(signal)) => Ok(Wait::Signal(signal)),
            Ok(None) => Err(TransferError::Aborted("engine closed".into()).into()),
            Err(_) => Ok(Wait::Elapsed),
        }
    }
}

pub struct TransferEngine {
    settings: EngineSettings,
    ids: TransferIdGenerator,
    busy: Arc<AtomicBool>,
    outbound: Mutex<Option<Outbound>>,
    sent: Mutex<TransferHistory>,
    receiver: Mutex<Receiver>,
    store: Arc<dyn FileStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl TransferEngine {
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn FileStore>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            receiver: Mutex::new(Receiver::new(settings.dedup)),
            settings,
            ids: TransferIdGenerator::new(),
            busy: Arc::new(AtomicBool::new(false)),
            outbound: Mutex::new(None),
            sent: Mutex::new(TransferHistory::new()),
            store,
            events,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// An outbound send holds the single-flight flag.
    pub fn is_sending(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn is_receiving(&self) -> bool {
        self.receiver.lock().await.active().is_some()
    }

    /// Lifecycle status of a running or recently ended transfer, either direction.
    pub async fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        if let Some(o) = self.outbound.lock().await.as_ref() {
            if &o.state.id == id {
                return Some(o.state.status);
            }
        }
        if let Some(status) = self.sent.lock().await.status(id) {
            return Some(status);
        }
        self.receiver.lock().await.status(id)
    }

    async fn update_outbound(&self, f: impl FnOnce(&mut TransferState)) {
        if let Some(o) = self.outbound.lock().await.as_mut() {
            f(&mut o.state);
        }
    }

    /// Send one file to `peer`. Fails with `TransferInProgress` while another send runs.
    pub async fn send_file(
        &self,
        path: &Path,
        peer: &Peer,
        channel: Arc<dyn TransportChannel>,
    ) -> Result<TransferId, Error> {
        let _guard = SendGuard::acquire(&self.busy).ok_or(TransferError::TransferInProgress)?;

        let bytes = self.store.read_file(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let chunk_size = match channel.link() {
            LinkKind::Radio => self.settings.radio_chunk_size,
            LinkKind::Datagram => self.settings.chunk_size,
        };
        let spans = split_into_chunks(bytes.len() as u64, chunk_size);
        if channel.link() == LinkKind::Radio && spans.len() as u64 > RADIO_MAX_CHUNKS {
            return Err(TransferError::TooManyChunks {
                chunks: spans.len() as u64,
                max: RADIO_MAX_CHUNKS,
            }
            .into());
        }

        let id = self.ids.next();
        let checksum = Checksum::of(&bytes);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.outbound.lock().await = Some(Outbound {
            state: TransferState::outbound(
                id.clone(),
                &file_name,
                bytes.len() as u64,
                chunk_size,
                checksum,
            ),
            signals: tx,
        });
        let mut out = Outgoing {
            id: id.clone(),
            file_name,
            checksum,
            bytes,
            spans,
            retries: HashMap::new(),
            deferred: VecDeque::new(),
            active_round: false,
        };
        tracing::info!(
            transfer = %id,
            peer = %peer.id,
            file = %out.file_name,
            size = out.bytes.len(),
            chunks = out.spans.len(),
            "send started"
        );

        let result = self
            .drive_send(&mut out, peer, channel.as_ref(), &mut rx)
            .await;
        let ended = self.outbound.lock().await.take();
        if let Some(Outbound { mut state, .. }) = ended {
            state.end(result.is_ok());
            self.sent.lock().await.record(&state);
        }

        match &result {
            Ok(()) => {
                tracing::info!(transfer = %id, "send completed");
                self.emit(SessionEvent::SendCompleted {
                    transfer_id: id.clone(),
                    file_name: out.file_name.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(transfer = %id, error = %e, "send failed");
                self.emit(SessionEvent::TransferFailed {
                    transfer_id: Some(id.clone()),
                    notice: e.notification(),
                });
            }
        }
        result.map(|()| id)
    }

    async fn drive_send(
        &self,
        out: &mut Outgoing,
        peer: &Peer,
        channel: &dyn TransportChannel,
        rx: &mut Signals,
    ) -> Result<(), Error> {
        let link = channel.link();
        if link == LinkKind::Datagram {
            let prepare = Message::PrepareTransfer(Prepare {
                transfer_id: out.id.clone(),
                transfer_port: None,
                ready: None,
                timestamp: now_millis(),
            });
            self.send_held(out, &prepare, peer, channel, rx).await?;
            tokio::time::sleep(self.settings.warmup).await;
        }

        let start = Message::FileStart(FileStart {
            transfer_id: out.id.clone(),
            file_name: out.file_name.clone(),
            original_file_name: out.file_name.clone(),
            file_size: out.bytes.len() as u64,
            chunk_size: match link {
                LinkKind::Radio => self.settings.radio_chunk_size,
                LinkKind::Datagram => self.settings.chunk_size,
            },
            total_chunks: u32::try_from(out.spans.len()).ok(),
            checksum: Some(out.checksum),
            timestamp: now_millis(),
        });
        self.announce(&start, out, peer, channel, rx).await?;
        self.update_outbound(TransferState::acknowledged).await;

        let total = out.bytes.len() as u64;
        for index in 0..out.spans.len() as u32 {
            while let Some(signal) = out.deferred.pop_front().or_else(|| rx.try_recv().ok()) {
                self.on_signal(signal, out, peer, channel, rx).await?;
            }
            if let Some(msg) = out.chunk(index) {
                self.send_held(out, &msg, peer, channel, rx).await?;
            }
            let sent = out.spans[index as usize].end;
            self.emit(SessionEvent::Progress {
                transfer_id: out.id.clone(),
                role: TransferRole::Sender,
                bytes: sent,
                total,
            });
            tokio::task::yield_now().await;
        }

        self.await_confirm(out, peer, channel, rx).await
    }

    /// Send FILE_START until acknowledged, spreading the attempts over the start timeout.
    /// An attempt cut short by link loss is not counted.
    async fn announce(
        &self,
        start: &Message,
        out: &mut Outgoing,
        peer: &Peer,
        channel: &dyn TransportChannel,
        rx: &mut Signals,
    ) -> Result<(), Error> {
        let per_attempt = self.settings.start_ack_timeout / START_ATTEMPTS;
        let mut attempt = 0;
        while attempt < START_ATTEMPTS {
            attempt += 1;
            self.send_held(out, start, peer, channel, rx).await?;
            let deadline = tokio::time::Instant::now() + per_attempt;
            loop {
                match out.next_signal(rx, deadline).await? {
                    Wait::Signal(Signal::StartAcked) => return Ok(()),
                    Wait::Signal(Signal::Aborted(reason)) => {
                        return Err(TransferError::Aborted(reason).into())
                    }
                    Wait::Signal(Signal::Interrupted) => {
                        self.hold(out, rx).await?;
                        attempt -= 1;
                        break;
                    }
                    Wait::Signal(_) => continue,
                    Wait::Elapsed => {
                        tracing::debug!(attempt, "FILE_START not acknowledged");
                        break;
                    }
                }
            }
        }
        Err(TransferError::StartAckTimeout.into())
    }

    /// Wait for FILE_RECEIVED_CONFIRM, answering retransmission requests meanwhile.
    async fn await_confirm(
        &self,
        out: &mut Outgoing,
        peer: &Peer,
        channel: &dyn TransportChannel,
        rx: &mut Signals,
    ) -> Result<(), Error> {
        let per_round = self.settings.confirm_timeout / COMPLETE_ROUNDS;
        let mut idle_rounds = 0;
        while idle_rounds < COMPLETE_ROUNDS {
            out.active_round = false;
            if channel.link() == LinkKind::Datagram {
                let complete = out.complete();
                self.send_held(out, &complete, peer, channel, rx).await?;
            }
            let deadline = tokio::time::Instant::now() + per_round;
            loop {
                match out.next_signal(rx, deadline).await? {
                    Wait::Signal(Signal::Confirmed) => return Ok(()),
                    Wait::Signal(signal) => self.on_signal(signal, out, peer, channel, rx).await?,
                    Wait::Elapsed => break,
                }
            }
            if out.active_round {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                tracing::debug!(transfer = %out.id, round = idle_rounds, "no confirmation yet");
            }
        }
        Err(TransferError::ConfirmTimeout.into())
    }

    /// Handle receiver feedback that arrives while chunks are still going out.
    async fn on_signal(
        &self,
        signal: Signal,
        out: &mut Outgoing,
        peer: &Peer,
        channel: &dyn TransportChannel,
        rx: &mut Signals,
    ) -> Result<(), Error> {
        match signal {
            Signal::ChunkRejected(index) => {
                let tries = out.retries.entry(index).or_insert(0);
                if *tries >= MAX_CHUNK_RETRIES {
                    return Err(TransferError::Aborted(format!(
                        "chunk {index} rejected {MAX_CHUNK_RETRIES} times"
                    ))
                    .into());
                }
                *tries += 1;
                tracing::debug!(chunk = index, retry = *tries, "retransmitting chunk");
                out.active_round = true;
                if let Some(msg) = out.chunk(index) {
                    self.send_held(out, &msg, peer, channel, rx).await?;
                }
                Ok(())
            }
            Signal::Aborted(reason) => Err(TransferError::Aborted(reason).into()),
            Signal::Interrupted => self.hold(out, rx).await,
            Signal::ChunkAcked(index) => {
                tracing::trace!(chunk = index, "chunk acknowledged");
                Ok(())
            }
            Signal::StartAcked | Signal::Confirmed | Signal::Resumed => Ok(()),
        }
    }

    /// Send, and when the link is down pause until it returns and send again.
    async fn send_held(
        &self,
        out: &mut Outgoing,
        message: &Message,
        peer: &Peer,
        channel: &dyn TransportChannel,
        rx: &mut Signals,
    ) -> Result<(), Error> {
        loop {
            match channel.send(peer, message).await {
                Ok(()) => return Ok(()),
                Err(e) if !channel.is_up() => {
                    tracing::debug!(kind = message.kind(), error = %e, "send hit a dropped link");
                    self.hold(out, rx).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pause until the session reports the link back, gives up on it, or the grace period ends.
    async fn hold(&self, out: &mut Outgoing, rx: &mut Signals) -> Result<(), Error> {
        tracing::info!(transfer = %out.id, "send paused until the link returns");
        out.active_round = true;
        let deadline = tokio::time::Instant::now() + self.settings.link_grace;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(Signal::Resumed)) => {
                    tracing::info!(transfer = %out.id, "send resumed");
                    return Ok(());
                }
                Ok(Some(Signal::Aborted(reason))) => {
                    return Err(TransferError::Aborted(reason).into())
                }
                Ok(Some(Signal::Interrupted)) => continue,
                Ok(Some(other)) => out.deferred.push_back(other),
                Ok(None) => return Err(TransferError::Aborted("engine closed".into()).into()),
                Err(_) => {
                    return Err(TransferError::Aborted("link did not come back".into()).into())
                }
            }
        }
    }

    async fn signal(&self, id: &TransferId, signal: Signal) {
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(o) if &o.state.id == id => {
                let _ = o.signals.send(signal);
            }
            _ => tracing::debug!(transfer = %id, ?signal, "feedback for inactive transfer"),
        }
    }

    /// Handle a transfer-scoped inbound message. `peer` is the connected peer
    /// the message is attributed to, if known.
    pub async fn handle(
        &self,
        origin: Origin,
        peer: Option<&Peer>,
        message: Message,
        channel: &dyn TransportChannel,
    ) {
        match message {
            Message::FileStartAck(m) => self.signal(&m.transfer_id, Signal::StartAcked).await,
            Message::FileAck(m) => {
                let signal = match m.status {
                    AckStatus::Success => Signal::ChunkAcked(m.chunk_index),
                    AckStatus::Error => {
                        tracing::debug!(chunk = m.chunk_index, error = ?m.error, "chunk rejected");
                        Signal::ChunkRejected(m.chunk_index)
                    }
                };
                self.signal(&m.transfer_id, signal).await
            }
            Message::FileReceivedConfirm(m) => self.signal(&m.transfer_id, Signal::Confirmed).await,
            Message::FileStart(m) => self.on_file_start(origin, peer, m, channel).await,
            Message::FileData(m) => self.on_file_data(origin, peer, m, channel).await,
            Message::FileComplete(m) => self.on_file_complete(origin, peer, m, channel).await,
            other => tracing::debug!(kind = other.kind(), "not a transfer message"),
        }
    }

    async fn on_file_start(
        &self,
        origin: Origin,
        peer: Option<&Peer>,
        start: FileStart,
        channel: &dyn TransportChannel,
    ) {
        let decision = self
            .receiver
            .lock()
            .await
            .on_file_start(&start, Instant::now());
        let started = matches!(decision, StartDecision::Started { .. });
        match decision {
            StartDecision::Started { superseded } => {
                if let Some(old) = superseded {
                    self.emit(SessionEvent::TransferFailed {
                        transfer_id: Some(old),
                        notice: TransferError::Aborted("superseded by a new transfer".into())
                            .notification(),
                    });
                }
                tracing::info!(
                    transfer = %start.transfer_id,
                    file = %start.file_name,
                    size = start.file_size,
                    "receive started"
                );
                self.emit(SessionEvent::ReceiveStarted {
                    transfer_id: start.transfer_id.clone(),
                    file_name: start.original_file_name.clone(),
                    file_size: start.file_size,
                });
            }
            StartDecision::Duplicate(reason) => {
                tracing::debug!(transfer = %start.transfer_id, ?reason, "duplicate announcement");
                self.emit(SessionEvent::DuplicateTransferIgnored {
                    transfer_id: start.transfer_id.clone(),
                });
            }
        }
        let ack = Message::FileStartAck(FileStartAck {
            transfer_id: start.transfer_id.clone(),
            timestamp: now_millis(),
        });
        match channel.reply_redundant(&origin, peer, &ack).await {
            Ok(()) => self.receiver.lock().await.acknowledged(&start.transfer_id),
            Err(e) => {
                tracing::warn!(transfer = %start.transfer_id, error = %e, "FILE_START_ACK failed")
            }
        }
        if start.file_size == 0 && started {
            self.complete_inbound(&start.transfer_id, origin, peer, channel)
                .await;
        }
    }

    async fn on_file_data(
        &self,
        origin: Origin,
        peer: Option<&Peer>,
        data: FileData,
        channel: &dyn TransportChannel,
    ) {
        let result = self.receiver.lock().await.on_chunk(&data);
        let (status, error, progress) = match result {
            Ok(progress) => (AckStatus::Success, None, Some(progress)),
            Err(TransferError::UnknownTransfer(id)) => {
                let done = self
                    .receiver
                    .lock()
                    .await
                    .is_recently_completed(&id, Instant::now());
                if done {
                    // Late copy of a chunk from a finished transfer.
                    (AckStatus::Success, None, None)
                } else {
                    tracing::warn!(transfer = %id, chunk = data.chunk_index, "chunk for unknown transfer");
                    (
                        AckStatus::Error,
                        Some(TransferError::UnknownTransfer(id).to_string()),
                        None,
                    )
                }
            }
            Err(e) => {
                tracing::warn!(transfer = %data.transfer_id, chunk = data.chunk_index, error = %e, "chunk rejected");
                (AckStatus::Error, Some(e.to_string()), None)
            }
        };
        let ack = Message::FileAck(FileAck {
            transfer_id: data.transfer_id.clone(),
            chunk_index: data.chunk_index,
            status,
            error,
            timestamp: now_millis(),
        });
        if let Err(e) = channel.reply_redundant(&origin, peer, &ack).await {
            tracing::debug!(chunk = data.chunk_index, error = %e, "FILE_ACK failed");
        }
        let Some(progress) = progress else {
            return;
        };
        if progress.insert == ChunkInsert::Duplicate {
            return;
        }
        self.emit(SessionEvent::Progress {
            transfer_id: data.transfer_id.clone(),
            role: TransferRole::Receiver,
            bytes: progress.received,
            total: progress.total,
        });
        if progress.size_reached() {
            tracing::debug!(transfer = %data.transfer_id, "all bytes received");
            self.complete_inbound(&data.transfer_id, origin, peer, channel)
                .await;
        }
    }

    async fn on_file_complete(
        &self,
        origin: Origin,
        peer: Option<&Peer>,
        complete: FileComplete,
        channel: &dyn TransportChannel,
    ) {
        let readiness = self
            .receiver
            .lock()
            .await
            .on_complete(&complete.transfer_id, complete.checksum);
        match readiness {
            CompleteReadiness::Ready => {
                self.complete_inbound(&complete.transfer_id, origin, peer, channel)
                    .await
            }
            CompleteReadiness::Pending {
                received,
                total,
                missing,
            } => {
                tracing::debug!(
                    transfer = %complete.transfer_id,
                    received,
                    total,
                    missing = missing.len(),
                    "FILE_COMPLETE ahead of chunks"
                );
                // The sender repeats FILE_COMPLETE while it keeps retransmitting,
                // so whatever is beyond this batch is asked for next time.
                for index in missing.into_iter().take(MAX_NACKS_PER_COMPLETE) {
                    let nack = Message::FileAck(FileAck {
                        transfer_id: complete.transfer_id.clone(),
                        chunk_index: index,
                        status: AckStatus::Error,
                        error: Some("chunk missing".to_string()),
                        timestamp: now_millis(),
                    });
                    if let Err(e) = channel.reply(&origin, &nack).await {
                        tracing::debug!(chunk = index, error = %e, "missing-chunk request failed");
                        break;
                    }
                }
            }
            CompleteReadiness::Unknown => {
                let status = self.receiver.lock().await.status(&complete.transfer_id);
                if status == Some(TransferStatus::Completed) {
                    // Our confirmation was lost; say it again.
                    self.confirm(&complete.transfer_id, &complete.original_file_name, origin, peer, channel)
                        .await;
                } else {
                    tracing::debug!(transfer = %complete.transfer_id, ?status, "FILE_COMPLETE not confirmed");
                }
            }
        }
    }

    /// Assemble, verify and persist the active inbound transfer.
    async fn complete_inbound(
        &self,
        id: &TransferId,
        origin: Origin,
        peer: Option<&Peer>,
        channel: &dyn TransportChannel,
    ) {
        let finished = self.receiver.lock().await.finish(id, None, Instant::now());
        match finished {
            Ok(Finish::Verified(file)) => match self.store.save_file(&file.file_name, &file.bytes).await {
                Ok(path) => {
                    tracing::info!(transfer = %id, path = %path.display(), "receive completed");
                    self.confirm(id, &file.file_name, origin, peer, channel).await;
                    self.emit(SessionEvent::ReceiveCompleted {
                        transfer_id: id.clone(),
                        path,
                    });
                }
                Err(e) => {
                    tracing::warn!(transfer = %id, error = %e, "cannot save received file");
                    self.emit(SessionEvent::TransferFailed {
                        transfer_id: Some(id.clone()),
                        notice: Error::Io(e).notification(),
                    });
                }
            },
            Ok(Finish::Corrupt { file, expected }) => {
                let quarantine = format!("{}.corrupt", file.file_name);
                let path = match self.store.save_file(&quarantine, &file.bytes).await {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(transfer = %id, error = %e, "cannot keep damaged file");
                        None
                    }
                };
                tracing::warn!(
                    transfer = %id,
                    expected = %expected,
                    actual = %file.checksum,
                    "file checksum mismatch"
                );
                self.emit(SessionEvent::ReceiveCorrupt {
                    transfer_id: id.clone(),
                    path,
                    expected,
                    actual: file.checksum,
                });
            }
            Err(e) => tracing::debug!(transfer = %id, error = %e, "completion raced"),
        }
    }

    async fn confirm(
        &self,
        id: &TransferId,
        file_name: &str,
        origin: Origin,
        peer: Option<&Peer>,
        channel: &dyn TransportChannel,
    ) {
        let confirm = Message::FileReceivedConfirm(FileReceivedConfirm {
            transfer_id: id.clone(),
            file_name: file_name.to_string(),
            status: "completed".to_string(),
            timestamp: now_millis(),
        });
        if let Err(e) = channel.reply_redundant(&origin, peer, &confirm).await {
            tracing::warn!(transfer = %id, error = %e, "FILE_RECEIVED_CONFIRM failed");
        }
    }

    /// Link lost: pause the outbound send and mark the inbound transfer interrupted.
    /// Returns the interrupted inbound transfer, if any.
    pub async fn interrupt(&self) -> Option<TransferId> {
        if let Some(o) = self.outbound.lock().await.as_mut() {
            o.state.interrupt();
            let _ = o.signals.send(Signal::Interrupted);
        }
        self.receiver.lock().await.interrupt().cloned()
    }

    /// Link back: let a paused send continue.
    pub async fn resume(&self) {
        if let Some(o) = self.outbound.lock().await.as_mut() {
            o.state.resume();
            let _ = o.signals.send(Signal::Resumed);
        }
        self.receiver.lock().await.resume();
    }

    /// Stop whatever is in flight in both directions.
    pub async fn abort(&self, reason: &str) {
        if let Some(o) = self.outbound.lock().await.as_ref() {
            let _ = o.signals.send(Signal::Aborted(reason.to_string()));
        }
        let dropped = self.receiver.lock().await.abort();
        if let Some(id) = dropped {
            tracing::info!(transfer = %id, reason, "receive aborted");
            self.emit(SessionEvent::TransferFailed {
                transfer_id: Some(id),
                notice: TransferError::Aborted(reason.to_string()).notification(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsFileStore;
    use crate::transport::radio::mock::MockRadioLink;
    use crate::transport::{Inbound, InboundSender, RadioChannel, RadioLink};
    use async_trait::async_trait;
    use nearfile_core::{DeviceId, TransportError};
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tokio::time::timeout;

    fn settings() -> EngineSettings {
        EngineSettings {
            chunk_size: 20,
            radio_chunk_size: 20,
            warmup: Duration::from_millis(1),
            start_ack_timeout: Duration::from_millis(600),
            confirm_timeout: Duration::from_secs(2),
            link_grace: Duration::from_millis(500),
            dedup: DedupPolicy::default(),
        }
    }

    fn radio_peer(id: &str) -> Peer {
        Peer {
            id: DeviceId::from(id),
            display_name: id.into(),
            address: None,
            control_port: None,
            data_port: None,
            link: LinkKind::Radio,
            last_seen: Instant::now(),
            connected: true,
        }
    }

    /// What the lossy in-memory link does to traffic passing through it.
    #[derive(Default)]
    struct Faults {
        /// First copy of each of these chunks is lost.
        lost_chunks: HashSet<u32>,
        lose_completes: bool,
        /// Replaces the whole-file checksum in FILE_START and FILE_COMPLETE.
        wrong_checksum: Option<Checksum>,
    }

    /// Datagram-like link that hands messages straight to the far side's inbound queue.
    struct MemoryChannel {
        addr: SocketAddr,
        near: Arc<StdMutex<Option<InboundSender>>>,
        far: Arc<StdMutex<Option<InboundSender>>>,
        faults: StdMutex<Faults>,
        delivered: StdMutex<Vec<Message>>,
    }

    impl MemoryChannel {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let a_in = Arc::new(StdMutex::new(None));
            let b_in = Arc::new(StdMutex::new(None));
            let a = MemoryChannel {
                addr: ([10, 0, 0, 1], 40000).into(),
                near: a_in.clone(),
                far: b_in.clone(),
                faults: StdMutex::new(Faults::default()),
                delivered: StdMutex::new(Vec::new()),
            };
            let b = MemoryChannel {
                addr: ([10, 0, 0, 2], 40000).into(),
                near: b_in,
                far: a_in,
                faults: StdMutex::new(Faults::default()),
                delivered: StdMutex::new(Vec::new()),
            };
            (Arc::new(a), Arc::new(b))
        }

        fn deliver(&self, message: &Message) {
            let mut message = message.clone();
            {
                let mut faults = self.faults.lock().unwrap();
                let wrong = faults.wrong_checksum;
                let lost = match &mut message {
                    Message::FileData(d) => faults.lost_chunks.remove(&d.chunk_index),
                    Message::FileComplete(c) => {
                        if let Some(w) = wrong {
                            c.checksum = w;
                        }
                        faults.lose_completes
                    }
                    Message::FileStart(s) => {
                        if wrong.is_some() {
                            s.checksum = wrong;
                        }
                        false
                    }
                    _ => false,
                };
                if lost {
                    return;
                }
            }
            self.delivered.lock().unwrap().push(message.clone());
            if let Some(tx) = self.far.lock().unwrap().as_ref() {
                let _ = tx.send(Inbound::Message {
                    origin: Origin::Datagram(self.addr),
                    message,
                });
            }
        }

        fn count(&self, pred: impl Fn(&Message) -> bool) -> usize {
            self.delivered.lock().unwrap().iter().filter(|m| pred(m)).count()
        }
    }

    #[async_trait]
    impl TransportChannel for MemoryChannel {
        fn link(&self) -> LinkKind {
            LinkKind::Datagram
        }

        async fn send(&self, _peer: &Peer, message: &Message) -> Result<(), TransportError> {
            self.deliver(message);
            Ok(())
        }

        async fn reply(&self, _origin: &Origin, message: &Message) -> Result<(), TransportError> {
            self.deliver(message);
            Ok(())
        }

        fn on_receive(&self, handler: InboundSender) {
            *self.near.lock().unwrap() = Some(handler);
        }

        async fn close(&self) {}
    }

    struct Side {
        engine: Arc<TransferEngine>,
        channel: Arc<dyn TransportChannel>,
        events: broadcast::Receiver<SessionEvent>,
        dir: tempfile::TempDir,
    }

    fn side_with(channel: Arc<dyn TransportChannel>, settings: EngineSettings) -> Side {
        let dir = tempfile::tempdir().unwrap();
        let (tx, events) = broadcast::channel(4096);
        let engine = Arc::new(TransferEngine::new(
            settings,
            Arc::new(FsFileStore::new(dir.path().join("in"))),
            tx,
        ));
        Side {
            engine,
            channel,
            events,
            dir,
        }
    }

    fn radio_side(link: MockRadioLink) -> Side {
        side_with(
            Arc::new(RadioChannel::new(Arc::new(link), Duration::from_millis(1))),
            settings(),
        )
    }

    /// Route every inbound message on `side` into its engine, one task per message.
    fn pump(side: &Side) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        side.channel.on_receive(tx);
        let engine = side.engine.clone();
        let channel = side.channel.clone();
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                if let Inbound::Message { origin, message } = inbound {
                    let engine = engine.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        engine.handle(origin, None, message, channel.as_ref()).await;
                    });
                }
            }
        });
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(e) if pred(&e) => return e,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .expect("event did not arrive")
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> Message {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Inbound::Message { message, .. })) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn is_complete(m: &Message) -> bool {
        matches!(m, Message::FileComplete(_))
    }

    #[tokio::test]
    async fn forty_five_bytes_over_radio() {
        let (a, b) = MockRadioLink::pair();
        let sender = radio_side(a.clone());
        let mut receiver = radio_side(b);
        pump(&sender);
        pump(&receiver);

        let file: Vec<u8> = (0..45u8).collect();
        let path = write_file(&sender.dir, "scenario.bin", &file);
        let id = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await
            .unwrap();

        let done = wait_for(&mut receiver.events, |e| {
            matches!(e, SessionEvent::ReceiveCompleted { .. })
        })
        .await;
        let SessionEvent::ReceiveCompleted { transfer_id, path } = done else {
            unreachable!()
        };
        assert_eq!(transfer_id, id);
        assert_eq!(std::fs::read(path).unwrap(), file);

        // FILE_INFO + three chunk frames of 20, 20 and 5 bytes.
        let frames = a.written();
        let chunk_lens: Vec<usize> = frames
            .iter()
            .filter(|f| f[5] == nearfile_core::FrameKind::FileData as u8)
            .map(|f| f.len() - nearfile_core::frame::HEADER_LEN - 2)
            .collect();
        assert_eq!(chunk_lens, vec![20, 20, 5]);
        assert!(!sender.engine.is_sending());
        assert_eq!(sender.engine.status(&id).await, Some(TransferStatus::Completed));
        assert_eq!(receiver.engine.status(&id).await, Some(TransferStatus::Completed));
    }

    #[tokio::test]
    async fn second_send_is_refused_while_first_runs() {
        // No far end: the first send waits for a FILE_START_ACK that never comes.
        let link = MockRadioLink::new();
        let lonely = radio_side(link.clone());
        let path = write_file(&lonely.dir, "a.bin", b"hello");
        let engine = lonely.engine.clone();
        let channel = lonely.channel.clone();
        let first_path = path.clone();
        let first = tokio::spawn(async move {
            engine
                .send_file(&first_path, &radio_peer("device_b"), channel)
                .await
        });
        while !lonely.engine.is_sending() {
            tokio::task::yield_now().await;
        }
        let second = lonely
            .engine
            .send_file(&path, &radio_peer("device_b"), lonely.channel.clone())
            .await;
        assert!(matches!(
            second,
            Err(Error::Transfer(TransferError::TransferInProgress))
        ));
        let first = first.await.unwrap();
        assert!(matches!(
            first,
            Err(Error::Transfer(TransferError::StartAckTimeout))
        ));
        // FILE_START went out exactly START_ATTEMPTS times.
        assert_eq!(link.written().len(), START_ATTEMPTS as usize);
        assert!(!lonely.engine.is_sending());
    }

    #[tokio::test]
    async fn exhausted_radio_write_fails_the_transfer() {
        let (a, b) = MockRadioLink::pair();
        let mut sender = radio_side(a.clone());
        let receiver = radio_side(b);
        pump(&sender);
        pump(&receiver);
        let path = write_file(&sender.dir, "a.bin", &[9u8; 45]);

        // Let FILE_INFO through, then fail the first chunk on a link that stays up.
        let breaker = tokio::spawn({
            let link = a.clone();
            async move {
                while link.written().is_empty() {
                    tokio::task::yield_now().await;
                }
                link.fail_next_writes(3);
            }
        });
        let result = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await;
        breaker.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::SendFailed { attempts: 3, .. }))
        ));
        let failed = wait_for(&mut sender.events, |e| {
            matches!(e, SessionEvent::TransferFailed { .. })
        })
        .await;
        let SessionEvent::TransferFailed {
            transfer_id: Some(id),
            ..
        } = failed.clone()
        else {
            panic!("failure without a transfer id: {failed:?}");
        };
        assert_eq!(sender.engine.status(&id).await, Some(TransferStatus::Failed));
        // One FILE_INFO write, three failed attempts on chunk 0, nothing after.
        assert_eq!(a.write_attempts(), 4);
        assert!(!sender.engine.is_sending());
    }

    #[tokio::test]
    async fn send_pauses_across_a_radio_drop_and_finishes() {
        let (a, b) = MockRadioLink::pair();
        let sender = radio_side(a.clone());
        let mut receiver = radio_side(b);
        pump(&sender);
        pump(&receiver);

        let file: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
        let path = write_file(&sender.dir, "big.bin", &file);

        // Stand in for the session: drop mid-stream, report it, reconnect, report that.
        let watcher = tokio::spawn({
            let link = a.clone();
            let engine = sender.engine.clone();
            async move {
                while link.written().len() <= 200 {
                    tokio::task::yield_now().await;
                }
                link.drop_link();
                engine.interrupt().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                link.reconnect().await.unwrap();
                engine.resume().await;
            }
        });

        let id = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await
            .unwrap();
        watcher.await.unwrap();

        let done = wait_for(&mut receiver.events, |e| {
            matches!(e, SessionEvent::ReceiveCompleted { .. })
        })
        .await;
        let SessionEvent::ReceiveCompleted { transfer_id, path } = done else {
            unreachable!()
        };
        assert_eq!(transfer_id, id);
        assert_eq!(std::fs::read(path).unwrap(), file);
        assert_eq!(a.reconnects(), 1);
        assert_eq!(sender.engine.status(&id).await, Some(TransferStatus::Completed));
    }

    #[tokio::test]
    async fn send_gives_up_when_the_link_stays_down() {
        let (a, b) = MockRadioLink::pair();
        let mut sender = radio_side(a.clone());
        let receiver = radio_side(b);
        pump(&sender);
        pump(&receiver);
        let path = write_file(&sender.dir, "a.bin", &[3u8; 2000]);

        let watcher = tokio::spawn({
            let link = a.clone();
            let engine = sender.engine.clone();
            async move {
                while link.written().len() <= 10 {
                    tokio::task::yield_now().await;
                }
                link.drop_link();
                engine.interrupt().await;
            }
        });
        let result = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await;
        watcher.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::Transfer(TransferError::Aborted(_)))
        ));
        let failed = wait_for(&mut sender.events, |e| {
            matches!(e, SessionEvent::TransferFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            SessionEvent::TransferFailed {
                transfer_id: Some(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn more_missing_chunks_than_one_complete_can_name() {
        let (a, b) = MemoryChannel::pair();
        a.faults.lock().unwrap().lost_chunks = (0..40).collect();
        let sender = side_with(a.clone(), settings());
        let mut receiver = side_with(b, settings());
        pump(&sender);
        pump(&receiver);

        // 50 chunks of 20 bytes, the first 40 lost on their first trip.
        let file: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let path = write_file(&sender.dir, "lossy.bin", &file);
        let id = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await
            .unwrap();

        let done = wait_for(&mut receiver.events, |e| {
            matches!(e, SessionEvent::ReceiveCompleted { .. })
        })
        .await;
        let SessionEvent::ReceiveCompleted { transfer_id, path } = done else {
            unreachable!()
        };
        assert_eq!(transfer_id, id);
        assert_eq!(std::fs::read(path).unwrap(), file);
        assert!(a.count(is_complete) >= 2);
    }

    #[tokio::test]
    async fn lost_file_complete_falls_back_to_size() {
        let (a, b) = MemoryChannel::pair();
        a.faults.lock().unwrap().lose_completes = true;
        let sender = side_with(a.clone(), settings());
        let mut receiver = side_with(b, settings());
        pump(&sender);
        pump(&receiver);

        let file: Vec<u8> = (0..45u8).collect();
        let path = write_file(&sender.dir, "f.bin", &file);
        let id = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await
            .unwrap();

        let done = wait_for(&mut receiver.events, |e| {
            matches!(e, SessionEvent::ReceiveCompleted { .. })
        })
        .await;
        let SessionEvent::ReceiveCompleted { transfer_id, path } = done else {
            unreachable!()
        };
        assert_eq!(transfer_id, id);
        assert_eq!(std::fs::read(path).unwrap(), file);
        assert_eq!(a.count(is_complete), 0);
    }

    #[tokio::test]
    async fn whole_file_mismatch_is_kept_aside_and_not_confirmed() {
        let (a, b) = MemoryChannel::pair();
        a.faults.lock().unwrap().wrong_checksum = Some(Checksum::of(b"some other file"));
        let fast = EngineSettings {
            confirm_timeout: Duration::from_millis(400),
            ..settings()
        };
        let mut sender = side_with(a, fast.clone());
        let mut receiver = side_with(b.clone(), fast);
        pump(&sender);
        pump(&receiver);

        let file: Vec<u8> = (0..45u8).collect();
        let path = write_file(&sender.dir, "f.bin", &file);
        let result = sender
            .engine
            .send_file(&path, &radio_peer("device_b"), sender.channel.clone())
            .await;
        assert!(matches!(
            result,
            Err(Error::Transfer(TransferError::ConfirmTimeout))
        ));

        let corrupt = wait_for(&mut receiver.events, |e| {
            matches!(e, SessionEvent::ReceiveCorrupt { .. })
        })
        .await;
        let SessionEvent::ReceiveCorrupt {
            transfer_id,
            path: Some(kept),
            expected,
            actual,
        } = corrupt.clone()
        else {
            panic!("damaged file was not kept: {corrupt:?}");
        };
        assert_eq!(expected, Checksum::of(b"some other file"));
        assert_eq!(actual, Checksum::of(&file));
        assert_eq!(
            kept.file_name().unwrap().to_string_lossy(),
            "f.bin.corrupt"
        );
        assert_eq!(std::fs::read(&kept).unwrap(), file);
        assert_eq!(
            b.count(|m| matches!(m, Message::FileReceivedConfirm(_))),
            0
        );
        assert_eq!(
            receiver.engine.status(&transfer_id).await,
            Some(TransferStatus::Failed)
        );
        assert!(matches!(
            wait_for(&mut sender.events, |e| matches!(e, SessionEvent::TransferFailed { .. })).await,
            SessionEvent::TransferFailed { .. }
        ));
    }

    #[tokio::test]
    async fn repeated_start_is_acknowledged_without_reset() {
        let (a, b) = MockRadioLink::pair();
        let observer = radio_side(a);
        let mut receiver = radio_side(b);
        pump(&receiver);
        let (tx, mut acks) = mpsc::unbounded_channel();
        observer.channel.on_receive(tx);

        let start = Message::FileStart(FileStart {
            transfer_id: TransferId::from("T1"),
            file_name: "f.bin".into(),
            original_file_name: "f.bin".into(),
            file_size: 45,
            chunk_size: 20,
            total_chunks: Some(3),
            checksum: None,
            timestamp: 0,
        });
        let peer = radio_peer("device_b");
        observer.channel.send(&peer, &start).await.unwrap();
        assert!(matches!(next_message(&mut acks).await, Message::FileStartAck(_)));
        observer
            .channel
            .send(
                &peer,
                &Message::FileData(FileData {
                    transfer_id: TransferId::from("T1"),
                    chunk_index: 0,
                    data: vec![1; 20],
                    checksum: None,
                    timestamp: 0,
                }),
            )
            .await
            .unwrap();
        assert!(matches!(
            next_message(&mut acks).await,
            Message::FileAck(FileAck {
                status: AckStatus::Success,
                ..
            })
        ));
        observer.channel.send(&peer, &start).await.unwrap();
        assert!(matches!(next_message(&mut acks).await, Message::FileStartAck(_)));

        let dup = wait_for(&mut receiver.events, |e| {
            matches!(e, SessionEvent::DuplicateTransferIgnored { .. })
        })
        .await;
        assert!(matches!(dup, SessionEvent::DuplicateTransferIgnored { .. }));
        let rx = receiver.engine.receiver.lock().await;
        let active = rx.active().unwrap();
        assert_eq!(active.chunks.received_bytes(), 20);
        assert_eq!(active.status, TransferStatus::Transferring);
    }
}
