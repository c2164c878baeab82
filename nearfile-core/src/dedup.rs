//! Idempotency table for inbound transfer announcements.
//!
//! One rule decides whether a FILE_START is new or a retransmission: an entry
//! keyed by transfer id, with an expiry, that also remembers the file name and
//! size it announced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::transfer::TransferId;

/// Default window in which a completed transfer id is still suppressed.
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(30);

/// Default window in which an identical name+size under a new id is suppressed.
pub const DEFAULT_SAME_FILE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct DedupPolicy {
    pub completed_ttl: Duration,
    pub same_file_window: Duration,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            completed_ttl: DEFAULT_COMPLETED_TTL,
            same_file_window: DEFAULT_SAME_FILE_WINDOW,
        }
    }
}

/// Result of offering an announcement to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Start a new inbound transfer.
    Accept,
    /// Acknowledge again but leave state alone.
    Duplicate(DuplicateReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateReason {
    /// Same id is being received right now.
    Active,
    /// Same id completed within the completed-TTL.
    RecentlyCompleted,
    /// A different id announced the same name and size within the same-file window.
    SameFile(TransferId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Active,
    Completed,
}

#[derive(Debug, Clone)]
struct Entry {
    state: EntryState,
    file_name: String,
    file_size: u64,
    touched_at: Instant,
}

#[derive(Debug, Default)]
pub struct IdempotencyTable {
    policy: DedupPolicy,
    entries: HashMap<TransferId, Entry>,
}

impl IdempotencyTable {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Classify an announcement. On `Accept` the id is recorded as active.
    pub fn admit(
        &mut self,
        id: &TransferId,
        file_name: &str,
        file_size: u64,
        now: Instant,
    ) -> Admission {
        self.expire(now);
        if let Some(entry) = self.entries.get(id) {
            return Admission::Duplicate(match entry.state {
                EntryState::Active => DuplicateReason::Active,
                EntryState::Completed => DuplicateReason::RecentlyCompleted,
            });
        }
        let same_file = self.entries.iter().find(|(_, e)| {
            e.file_name == file_name
                && e.file_size == file_size
                && now.saturating_duration_since(e.touched_at) < self.policy.same_file_window
        });
        if let Some((other, _)) = same_file {
            return Admission::Duplicate(DuplicateReason::SameFile(other.clone()));
        }
        self.entries.insert(
            id.clone(),
            Entry {
                state: EntryState::Active,
                file_name: file_name.to_string(),
                file_size,
                touched_at: now,
            },
        );
        Admission::Accept
    }

    /// Mark an id completed; it stays suppressed for the completed-TTL.
    pub fn complete(&mut self, id: &TransferId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.state = EntryState::Completed;
            entry.touched_at = now;
        }
    }

    /// Drop an id entirely (aborted transfer); a later announcement starts fresh.
    pub fn forget(&mut self, id: &TransferId) {
        self.entries.remove(id);
    }

    pub fn is_recently_completed(&self, id: &TransferId, now: Instant) -> bool {
        self.entries.get(id).is_some_and(|e| {
            e.state == EntryState::Completed
                && now.saturating_duration_since(e.touched_at) < self.policy.completed_ttl
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        let keep = self.policy.completed_ttl.max(self.policy.same_file_window);
        self.entries.retain(|_, e| {
            e.state == EntryState::Active || now.saturating_duration_since(e.touched_at) < keep
        });
    }
}
