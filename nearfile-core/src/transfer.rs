//! Transfer bookkeeping: ids, per-transfer state, and the receive-side state machine.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::checksum::{verify, Checksum};
use crate::chunk::{chunk_count, ChunkInsert, Reassembly};
use crate::dedup::{Admission, DedupPolicy, IdempotencyTable};
use crate::error::TransferError;
use crate::message::{FileData, FileStart};

/// Milliseconds since the Unix epoch; every message carries one.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-attempt transfer id, derived from send time. The de-duplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        TransferId(s.to_string())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out time-derived ids that never repeat within the process, even when
/// two sends land in the same millisecond.
#[derive(Debug, Default)]
pub struct TransferIdGenerator {
    last: AtomicU64,
}

impl TransferIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> TransferId {
        self.next_at(now_millis())
    }

    pub fn next_at(&self, millis: u64) -> TransferId {
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = millis.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return TransferId(candidate.to_string()),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Announced, not yet acknowledged.
    Preparing,
    Transferring,
    /// Link lost mid-transfer; reconnect in progress.
    Interrupted,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_final(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// State of one active transfer, either direction.
#[derive(Debug)]
pub struct TransferState {
    pub id: TransferId,
    pub role: TransferRole,
    pub file_name: String,
    pub original_file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    /// Received chunks. Empty on the sending side.
    pub chunks: Reassembly,
    /// Sender: FILE_START was acknowledged. Receiver: we acknowledged it.
    pub received_ack: bool,
    pub status: TransferStatus,
    pub announced_checksum: Option<Checksum>,
}

impl TransferState {
    pub fn outbound(
        id: TransferId,
        file_name: &str,
        file_size: u64,
        chunk_size: u32,
        checksum: Checksum,
    ) -> Self {
        Self {
            id,
            role: TransferRole::Sender,
            file_name: file_name.to_string(),
            original_file_name: file_name.to_string(),
            file_size,
            chunk_size,
            chunks: Reassembly::new(),
            received_ack: false,
            status: TransferStatus::Preparing,
            announced_checksum: Some(checksum),
        }
    }

    fn inbound(start: &FileStart) -> Self {
        Self {
            id: start.transfer_id.clone(),
            role: TransferRole::Receiver,
            file_name: start.file_name.clone(),
            original_file_name: start.original_file_name.clone(),
            file_size: start.file_size,
            chunk_size: start.chunk_size,
            chunks: Reassembly::new(),
            received_ack: false,
            status: TransferStatus::Preparing,
            announced_checksum: start.checksum,
        }
    }

    /// Name to save under: the original name when the sender provided one.
    pub fn display_name(&self) -> &str {
        if self.original_file_name.is_empty() {
            &self.file_name
        } else {
            &self.original_file_name
        }
    }

    /// The FILE_START handshake finished.
    pub fn acknowledged(&mut self) {
        self.received_ack = true;
        if self.status == TransferStatus::Preparing {
            self.status = TransferStatus::Transferring;
        }
    }

    pub fn interrupt(&mut self) {
        if !self.status.is_final() {
            self.status = TransferStatus::Interrupted;
        }
    }

    pub fn resume(&mut self) {
        if self.status == TransferStatus::Interrupted {
            self.status = if self.received_ack {
                TransferStatus::Transferring
            } else {
                TransferStatus::Preparing
            };
        }
    }

    pub fn end(&mut self, completed: bool) {
        self.status = if completed {
            TransferStatus::Completed
        } else {
            TransferStatus::Failed
        };
    }
}

/// Outcomes of recently ended transfers, newest last.
#[derive(Debug, Default)]
pub struct TransferHistory {
    ended: VecDeque<(TransferId, TransferRole, TransferStatus)>,
}

impl TransferHistory {
    pub const KEPT: usize = 32;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, state: &TransferState) {
        if self.ended.len() == Self::KEPT {
            self.ended.pop_front();
        }
        self.ended
            .push_back((state.id.clone(), state.role, state.status));
    }

    pub fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.ended
            .iter()
            .rev()
            .find(|(ended, _, _)| ended == id)
            .map(|(_, _, status)| *status)
    }
}

/// Decision on an inbound FILE_START.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    /// New transfer initialized. `superseded` names an unfinished inbound transfer it replaced.
    Started { superseded: Option<TransferId> },
    /// Retransmission or repeat; acknowledge but keep state.
    Duplicate(crate::dedup::DuplicateReason),
}

/// Effect of one FILE_DATA on the active inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub index: u32,
    pub insert: ChunkInsert,
    pub received: u64,
    pub total: u64,
}

impl ChunkProgress {
    /// Accumulated bytes reached the announced size.
    pub fn size_reached(&self) -> bool {
        self.received >= self.total
    }
}

/// Whether an explicit completion can be acted on yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteReadiness {
    /// All announced bytes are present.
    Ready,
    /// Chunks still outstanding; completion happens when the last one lands.
    Pending {
        received: u64,
        total: u64,
        missing: Vec<u32>,
    },
    /// No such active transfer.
    Unknown,
}

/// Reassembled file ready to persist.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub checksum: Checksum,
}

/// Outcome of completing an inbound transfer.
#[derive(Debug, Clone)]
pub enum Finish {
    /// Checksum matched (or none was announced).
    Verified(ReceivedFile),
    /// Checksum mismatch: the bytes are returned so the caller can quarantine them.
    Corrupt {
        file: ReceivedFile,
        expected: Checksum,
    },
}

/// Receive side: at most one active inbound transfer plus the idempotency table.
#[derive(Debug, Default)]
pub struct Receiver {
    active: Option<TransferState>,
    table: IdempotencyTable,
    history: TransferHistory,
}

impl Receiver {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            active: None,
            table: IdempotencyTable::new(policy),
            history: TransferHistory::new(),
        }
    }

    pub fn active(&self) -> Option<&TransferState> {
        self.active.as_ref()
    }

    /// Status of the active transfer, or how a recent one ended.
    pub fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        match &self.active {
            Some(a) if &a.id == id => Some(a.status),
            _ => self.history.status(id),
        }
    }

    fn retire(&mut self, mut state: TransferState, completed: bool) -> TransferState {
        state.end(completed);
        self.history.record(&state);
        state
    }

    pub fn is_active(&self, id: &TransferId) -> bool {
        self.active.as_ref().is_some_and(|a| &a.id == id)
    }

    /// Handle FILE_START / FILE_INFO.
    pub fn on_file_start(&mut self, start: &FileStart, now: Instant) -> StartDecision {
        match self
            .table
            .admit(&start.transfer_id, &start.file_name, start.file_size, now)
        {
            Admission::Duplicate(reason) => {
                tracing::debug!(transfer = %start.transfer_id, ?reason, "duplicate FILE_START");
                StartDecision::Duplicate(reason)
            }
            Admission::Accept => {
                let superseded = self.active.take().map(|old| {
                    self.table.forget(&old.id);
                    self.retire(old, false).id
                });
                if let Some(old) = &superseded {
                    tracing::warn!(old = %old, new = %start.transfer_id, "inbound transfer superseded");
                }
                self.active = Some(TransferState::inbound(start));
                StartDecision::Started { superseded }
            }
        }
    }

    /// Our FILE_START_ACK for `id` went out.
    pub fn acknowledged(&mut self, id: &TransferId) {
        if let Some(a) = self.active.as_mut().filter(|a| &a.id == id) {
            a.acknowledged();
        }
    }

    /// Handle FILE_DATA. Chunks for any id other than the active one are rejected.
    pub fn on_chunk(&mut self, data: &FileData) -> Result<ChunkProgress, TransferError> {
        let active = match &mut self.active {
            Some(a) if a.id == data.transfer_id => a,
            _ => return Err(TransferError::UnknownTransfer(data.transfer_id.clone())),
        };
        if let Some(expected) = data.checksum {
            if !verify(&data.data, expected) {
                return Err(TransferError::ChunkChecksumMismatch {
                    index: data.chunk_index,
                });
            }
        }
        if active.status == TransferStatus::Preparing {
            active.status = TransferStatus::Transferring;
        }
        let insert = active.chunks.insert(data.chunk_index, data.data.clone());
        Ok(ChunkProgress {
            index: data.chunk_index,
            insert,
            received: active.chunks.received_bytes(),
            total: active.file_size,
        })
    }

    /// FILE_COMPLETE arrived. Records its checksum and reports whether the
    /// transfer can be finished now; datagrams may overtake the final chunks.
    pub fn on_complete(&mut self, id: &TransferId, checksum: Checksum) -> CompleteReadiness {
        match &mut self.active {
            Some(a) if &a.id == id => {
                a.announced_checksum = Some(checksum);
                let received = a.chunks.received_bytes();
                if received >= a.file_size {
                    CompleteReadiness::Ready
                } else {
                    let count = chunk_count(a.file_size, a.chunk_size).min(u32::MAX as u64) as u32;
                    CompleteReadiness::Pending {
                        received,
                        total: a.file_size,
                        missing: a.chunks.missing(count),
                    }
                }
            }
            _ => CompleteReadiness::Unknown,
        }
    }

    /// Complete the active transfer: assemble by index and verify. `checksum`
    /// overrides the one announced in FILE_START when present.
    pub fn finish(
        &mut self,
        id: &TransferId,
        checksum: Option<Checksum>,
        now: Instant,
    ) -> Result<Finish, TransferError> {
        if !self.is_active(id) {
            return Err(TransferError::UnknownTransfer(id.clone()));
        }
        let Some(state) = self.active.take() else {
            return Err(TransferError::UnknownTransfer(id.clone()));
        };
        let bytes = state.chunks.assemble();
        let actual = Checksum::of(&bytes);
        self.table.complete(id, now);
        let file = ReceivedFile {
            transfer_id: state.id.clone(),
            file_name: state.display_name().to_string(),
            bytes,
            checksum: actual,
        };
        let mismatch = checksum
            .or(state.announced_checksum)
            .filter(|expected| *expected != actual);
        self.retire(state, mismatch.is_none());
        match mismatch {
            Some(expected) => Ok(Finish::Corrupt { file, expected }),
            None => Ok(Finish::Verified(file)),
        }
    }

    pub fn is_recently_completed(&self, id: &TransferId, now: Instant) -> bool {
        self.table.is_recently_completed(id, now)
    }

    /// Link lost while receiving.
    pub fn interrupt(&mut self) -> Option<&TransferId> {
        let active = self.active.as_mut()?;
        active.interrupt();
        Some(&active.id)
    }

    pub fn resume(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.resume();
        }
    }

    /// Drop the active inbound transfer without persisting anything.
    pub fn abort(&mut self) -> Option<TransferId> {
        let old = self.active.take()?;
        self.table.forget(&old.id);
        Some(self.retire(old, false).id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{split_into_chunks, RADIO_CHUNK_SIZE};
    use crate::dedup::DuplicateReason;
    use std::time::Duration;

    fn start(id: &str, name: &str, size: u64, checksum: Option<Checksum>) -> FileStart {
        FileStart {
            transfer_id: TransferId::from(id),
            file_name: name.into(),
            original_file_name: name.into(),
            file_size: size,
            chunk_size: RADIO_CHUNK_SIZE,
            total_chunks: None,
            checksum,
            timestamp: 0,
        }
    }

    fn chunk(id: &str, index: u32, data: &[u8]) -> FileData {
        FileData {
            transfer_id: TransferId::from(id),
            chunk_index: index,
            data: data.to_vec(),
            checksum: Some(Checksum::of(data)),
            timestamp: 0,
        }
    }

    #[test]
    fn generator_never_repeats() {
        let g = TransferIdGenerator::new();
        let a = g.next_at(1000);
        let b = g.next_at(1000);
        let c = g.next_at(999);
        assert_eq!(a.as_str(), "1000");
        assert_eq!(b.as_str(), "1001");
        assert_eq!(c.as_str(), "1002");
        assert_eq!(g.next_at(5000).as_str(), "5000");
    }

    #[test]
    fn forty_five_bytes_out_of_order() {
        let file: Vec<u8> = (0..45u8).collect();
        let sum = Checksum::of(&file);
        let mut rx = Receiver::default();
        let now = Instant::now();
        assert_eq!(
            rx.on_file_start(&start("T1", "f.bin", 45, Some(sum)), now),
            StartDecision::Started { superseded: None }
        );
        let spans = split_into_chunks(45, RADIO_CHUNK_SIZE);
        let mut last = None;
        for i in [2usize, 0, 1] {
            let span = spans[i];
            last = Some(rx.on_chunk(&chunk("T1", span.index, span.slice(&file))).unwrap());
        }
        assert!(last.unwrap().size_reached());
        assert_eq!(
            rx.status(&TransferId::from("T1")),
            Some(TransferStatus::Transferring)
        );
        match rx.finish(&TransferId::from("T1"), None, now).unwrap() {
            Finish::Verified(f) => {
                assert_eq!(f.bytes, file);
                assert_eq!(f.checksum, sum);
            }
            Finish::Corrupt { .. } => panic!("checksum should match"),
        }
        assert!(rx.active().is_none());
        assert_eq!(
            rx.status(&TransferId::from("T1")),
            Some(TransferStatus::Completed)
        );
    }

    #[test]
    fn sender_state_walks_the_lifecycle() {
        let mut state = TransferState::outbound(
            TransferId::from("S1"),
            "f.bin",
            45,
            RADIO_CHUNK_SIZE,
            Checksum::of(b"x"),
        );
        assert_eq!(state.role, TransferRole::Sender);
        assert_eq!(state.status, TransferStatus::Preparing);
        state.interrupt();
        state.resume();
        assert_eq!(state.status, TransferStatus::Preparing);
        state.acknowledged();
        assert!(state.received_ack);
        assert_eq!(state.status, TransferStatus::Transferring);
        state.interrupt();
        assert_eq!(state.status, TransferStatus::Interrupted);
        state.resume();
        assert_eq!(state.status, TransferStatus::Transferring);
        state.end(false);
        state.interrupt();
        assert_eq!(state.status, TransferStatus::Failed);

        let mut history = TransferHistory::new();
        history.record(&state);
        assert_eq!(
            history.status(&TransferId::from("S1")),
            Some(TransferStatus::Failed)
        );
        assert_eq!(history.status(&TransferId::from("S2")), None);
    }

    #[test]
    fn history_keeps_only_recent_outcomes() {
        let mut history = TransferHistory::new();
        for i in 0..=TransferHistory::KEPT {
            let mut state = TransferState::outbound(
                TransferId::from(i.to_string().as_str()),
                "f",
                1,
                1,
                Checksum::default(),
            );
            state.end(true);
            history.record(&state);
        }
        assert_eq!(history.status(&TransferId::from("0")), None);
        assert_eq!(
            history.status(&TransferId::from("1")),
            Some(TransferStatus::Completed)
        );
    }

    #[test]
    fn repeated_start_does_not_reset_progress() {
        let mut rx = Receiver::default();
        let now = Instant::now();
        rx.on_file_start(&start("T1", "f.bin", 45, None), now);
        rx.on_chunk(&chunk("T1", 0, &[7; 20])).unwrap();
        let again = rx.on_file_start(&start("T1", "f.bin", 45, None), now + Duration::from_secs(1));
        assert_eq!(again, StartDecision::Duplicate(DuplicateReason::Active));
        assert_eq!(rx.active().unwrap().chunks.received_bytes(), 20);
    }

    #[test]
    fn completed_transfer_is_not_restarted() {
        let mut rx = Receiver::default();
        let now = Instant::now();
        rx.on_file_start(&start("T1", "f.bin", 1, None), now);
        rx.on_chunk(&chunk("T1", 0, &[1])).unwrap();
        rx.finish(&TransferId::from("T1"), None, now).unwrap();
        assert!(rx.is_recently_completed(&TransferId::from("T1"), now));
        assert_eq!(
            rx.on_file_start(&start("T1", "f.bin", 1, None), now + Duration::from_secs(5)),
            StartDecision::Duplicate(DuplicateReason::RecentlyCompleted)
        );
        assert!(rx.active().is_none());
    }

    #[test]
    fn chunk_for_other_transfer_is_rejected() {
        let mut rx = Receiver::default();
        rx.on_file_start(&start("T1", "f.bin", 45, None), Instant::now());
        let err = rx.on_chunk(&chunk("T9", 0, &[1; 20])).unwrap_err();
        assert!(matches!(err, TransferError::UnknownTransfer(_)));
        assert_eq!(rx.active().unwrap().chunks.received_bytes(), 0);
    }

    #[test]
    fn damaged_chunk_is_not_stored() {
        let mut rx = Receiver::default();
        rx.on_file_start(&start("T1", "f.bin", 45, None), Instant::now());
        let mut bad = chunk("T1", 0, &[1; 20]);
        bad.data[0] = 2;
        assert!(matches!(
            rx.on_chunk(&bad),
            Err(TransferError::ChunkChecksumMismatch { index: 0 })
        ));
        assert!(!rx.active().unwrap().chunks.contains(0));
    }

    #[test]
    fn whole_file_mismatch_is_reported_with_bytes() {
        let mut rx = Receiver::default();
        let now = Instant::now();
        rx.on_file_start(&start("T1", "f.bin", 3, None), now);
        rx.on_chunk(&chunk("T1", 0, b"abc")).unwrap();
        let wrong = Checksum::of(b"abd");
        match rx.finish(&TransferId::from("T1"), Some(wrong), now).unwrap() {
            Finish::Corrupt { file, expected } => {
                assert_eq!(expected, wrong);
                assert_eq!(file.bytes, b"abc");
            }
            Finish::Verified(_) => panic!("mismatch must be surfaced"),
        }
        assert_eq!(
            rx.status(&TransferId::from("T1")),
            Some(TransferStatus::Failed)
        );
    }

    #[test]
    fn new_transfer_supersedes_stale_one() {
        let mut rx = Receiver::default();
        let now = Instant::now();
        rx.on_file_start(&start("T1", "a.bin", 10, None), now);
        let d = rx.on_file_start(&start("T2", "b.bin", 10, None), now);
        assert_eq!(
            d,
            StartDecision::Started {
                superseded: Some(TransferId::from("T1"))
            }
        );
        assert!(rx.is_active(&TransferId::from("T2")));
        assert_eq!(
            rx.status(&TransferId::from("T1")),
            Some(TransferStatus::Failed)
        );
    }

    #[test]
    fn early_complete_waits_for_missing_chunks() {
        let file = b"hello world, forty-five bytes of sample data!".to_vec();
        let sum = Checksum::of(&file);
        let mut rx = Receiver::default();
        let now = Instant::now();
        rx.on_file_start(&start("T1", "f.bin", file.len() as u64, None), now);
        rx.on_chunk(&chunk("T1", 0, &file[..20])).unwrap();
        assert_eq!(
            rx.on_complete(&TransferId::from("T1"), sum),
            CompleteReadiness::Pending {
                received: 20,
                total: file.len() as u64,
                missing: vec![1, 2],
            }
        );
        rx.on_chunk(&chunk("T1", 1, &file[20..40])).unwrap();
        let last = rx.on_chunk(&chunk("T1", 2, &file[40..])).unwrap();
        assert!(last.size_reached());
        // The checksum recorded from FILE_COMPLETE is used.
        assert!(matches!(
            rx.finish(&TransferId::from("T1"), None, now).unwrap(),
            Finish::Verified(_)
        ));
        assert_eq!(
            rx.on_complete(&TransferId::from("T1"), sum),
            CompleteReadiness::Unknown
        );
    }

    #[test]
    fn abort_clears_state_and_allows_restart() {
        let mut rx = Receiver::default();
        let now = Instant::now();
        rx.on_file_start(&start("T1", "a.bin", 10, None), now);
        rx.acknowledged(&TransferId::from("T1"));
        assert_eq!(rx.active().unwrap().status, TransferStatus::Transferring);
        assert_eq!(rx.interrupt().cloned(), Some(TransferId::from("T1")));
        assert_eq!(rx.active().unwrap().status, TransferStatus::Interrupted);
        rx.resume();
        assert_eq!(rx.active().unwrap().status, TransferStatus::Transferring);
        rx.interrupt();
        assert_eq!(rx.abort(), Some(TransferId::from("T1")));
        assert_eq!(
            rx.status(&TransferId::from("T1")),
            Some(TransferStatus::Failed)
        );
        assert_eq!(
            rx.on_file_start(&start("T1", "a.bin", 10, None), now),
            StartDecision::Started { superseded: None }
        );
    }
}
