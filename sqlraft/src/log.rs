//! In-memory cache of the suffix of the replicated log.
//!
//! The cache is a ring of entries starting right after the last compacted prefix. It answers
//! term lookups without touching storage, tracks the lifecycle of every live entry, and hands
//! out shared views of entries for I/O submission. Entries appended together may share one
//! backing allocation; a payload's storage is released when the last view of it drops.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::RaftError;
use crate::raft::Entry;
use crate::AppData;
use crate::LogId;

/// The lifecycle of a cached log entry.
///
/// `Created → Committed → Applied` is the normal path. `Truncated` marks an uncommitted entry
/// removed because it conflicted with the leader's log, `Replaced` marks an entry superseded by
/// an installed snapshot, and `Snapshotted` marks an applied entry compacted into a local
/// snapshot. The three are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Created,
    Committed,
    Applied,
    Truncated,
    Replaced,
    Snapshotted,
}

impl EntryState {
    fn can_move_to(self, next: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, next),
            (Created, Committed)
                | (Created, Truncated)
                | (Created, Replaced)
                | (Committed, Applied)
                | (Committed, Replaced)
                | (Applied, Snapshotted)
                | (Applied, Replaced)
        )
    }
}

struct Slot<D: AppData> {
    entry: Arc<Entry<D>>,
    state: EntryState,
}

impl<D: AppData> Slot<D> {
    fn transition(&mut self, next: EntryState) {
        debug_assert!(
            self.state.can_move_to(next),
            "invalid entry state transition {:?} -> {:?} at index {}",
            self.state,
            next,
            self.entry.log_id.index
        );
        self.state = next;
    }
}

/// The in-memory log cache.
pub struct LogCache<D: AppData> {
    slots: VecDeque<Slot<D>>,
    /// The index of the entry preceding the first cached slot.
    offset: u64,
    /// The id of the last entry, cached or not.
    last: LogId,
    /// The position covered by the most recent snapshot, `0-0` if none.
    snapshot: LogId,
}

impl<D: AppData> LogCache<D> {
    /// Create a cache for a log whose last entry and snapshot position are known, typically from
    /// `RaftStorage::get_initial_state`. The cache starts empty; entries are filled in as they
    /// are appended.
    pub fn new(last: LogId, snapshot: LogId) -> Self {
        Self {
            slots: VecDeque::new(),
            offset: last.index,
            last,
            snapshot,
        }
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The index of the first cached entry, if any.
    pub fn first_index(&self) -> Option<u64> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.offset + 1)
        }
    }

    /// The id of the last entry of the log.
    pub fn last_log_id(&self) -> LogId {
        self.last
    }

    /// The position covered by the most recent snapshot.
    pub fn snapshot_id(&self) -> LogId {
        self.snapshot
    }

    /// Append an entry. Indices must be contiguous.
    pub fn append(&mut self, entry: Arc<Entry<D>>) {
        debug_assert_eq!(entry.log_id.index, self.last.index + 1, "non-contiguous append");
        self.last = entry.log_id;
        self.slots.push_back(Slot {
            entry,
            state: EntryState::Created,
        });
    }

    /// Get a shared view of the entry at the given index, if cached.
    pub fn get(&self, index: u64) -> Option<Arc<Entry<D>>> {
        if index <= self.offset {
            return None;
        }
        self.slots.get((index - self.offset - 1) as usize).map(|s| s.entry.clone())
    }

    /// The lifecycle state of the entry at the given index, if cached.
    pub fn state_of(&self, index: u64) -> Option<EntryState> {
        if index <= self.offset {
            return None;
        }
        self.slots.get((index - self.offset - 1) as usize).map(|s| s.state)
    }

    /// The term of the entry at the given index.
    ///
    /// Index 0 answers term 0, and the snapshot's last index answers the snapshot's last term
    /// even after the entry itself has been compacted away. Returns `None` for indices the
    /// cache knows nothing about.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(slot) = index
            .checked_sub(self.offset + 1)
            .and_then(|i| self.slots.get(i as usize))
        {
            // Snapshot coherence: a still-present entry at the snapshot's last index must
            // carry the snapshot's last term.
            debug_assert!(index != self.snapshot.index || slot.entry.log_id.term == self.snapshot.term);
            return Some(slot.entry.log_id.term);
        }
        if index == self.snapshot.index {
            return Some(self.snapshot.term);
        }
        None
    }

    /// Acquire shared views of up to `max` entries starting at `from`, for handing to I/O.
    ///
    /// The views keep the entries' payloads alive independently of the cache: truncating or
    /// compacting the cache while views are out does not free payload storage early.
    pub fn acquire(&self, from: u64, max: usize) -> Vec<Arc<Entry<D>>> {
        let mut out = Vec::new();
        if from <= self.offset {
            return out;
        }
        let start = (from - self.offset - 1) as usize;
        for slot in self.slots.iter().skip(start).take(max) {
            out.push(slot.entry.clone());
        }
        out
    }

    /// Mark entries up to and including `upto` as committed.
    pub fn mark_committed(&mut self, upto: u64) {
        for slot in self.slots.iter_mut() {
            if slot.entry.log_id.index > upto {
                break;
            }
            if slot.state == EntryState::Created {
                slot.transition(EntryState::Committed);
            }
        }
    }

    /// Mark the entry at the given index as applied.
    pub fn mark_applied(&mut self, index: u64) {
        if index <= self.offset {
            return;
        }
        if let Some(slot) = self.slots.get_mut((index - self.offset - 1) as usize) {
            if slot.state == EntryState::Created {
                slot.transition(EntryState::Committed);
            }
            slot.transition(EntryState::Applied);
        }
    }

    /// Remove all entries from `from` onwards, after a conflict with the leader's log.
    ///
    /// Fails with a log inconsistency if any removed entry was already committed: a committed
    /// entry must never be rewritten.
    pub fn truncate(&mut self, from: u64) -> Result<(), RaftError> {
        if from <= self.offset {
            return Err(RaftError::LogInconsistency(format!(
                "cannot truncate from {}, entries up to {} are compacted",
                from, self.offset
            )));
        }
        let start = (from - self.offset - 1) as usize;
        for slot in self.slots.iter().skip(start) {
            match slot.state {
                EntryState::Created => {}
                state => {
                    return Err(RaftError::LogInconsistency(format!(
                        "cannot truncate {:?} entry at index {}",
                        state, slot.entry.log_id.index
                    )));
                }
            }
        }
        while self.slots.len() > start {
            let mut slot = self.slots.pop_back().expect("len checked");
            slot.transition(EntryState::Truncated);
        }
        self.last = match self.slots.back() {
            Some(slot) => slot.entry.log_id,
            None => {
                if self.offset == self.snapshot.index {
                    self.snapshot
                } else {
                    LogId::new(0, self.offset)
                }
            }
        };
        Ok(())
    }

    /// Record a freshly taken snapshot and trim the cache to the trailing window.
    ///
    /// Entries at or before `snapshot.index - trailing` are compacted away; more recent entries
    /// are retained so that lagging followers can still be served from the log.
    pub fn snapshot_taken(&mut self, snapshot: LogId, trailing: u64) {
        debug_assert!(snapshot.index >= self.snapshot.index);
        self.snapshot = snapshot;
        let cutoff = snapshot.index.saturating_sub(trailing);
        while let Some(slot) = self.slots.front() {
            if slot.entry.log_id.index > cutoff {
                break;
            }
            let mut slot = self.slots.pop_front().expect("front checked");
            slot.transition(EntryState::Snapshotted);
            self.offset = slot.entry.log_id.index;
        }
    }

    /// Replace the whole log with the position of an installed snapshot.
    pub fn restore(&mut self, snapshot: LogId) {
        while let Some(mut slot) = self.slots.pop_back() {
            slot.transition(EntryState::Replaced);
        }
        self.offset = snapshot.index;
        self.last = snapshot;
        self.snapshot = snapshot;
    }
}
