//! Roster state and the per-room store that owns it.
//!
//! ## Architecture
//!
//! ```text
//! Session task (single writer)
//!       │ apply_event(envelope)
//!       ▼
//! RosterStore ── RwLock<Versioned { version, Arc<Roster> }>
//!       │                         │
//!       │ reducer::reduce()       │ view() / snapshot()
//!       ▼                         ▼
//!   RosterDelta              Projection, panel readers
//! ```
//!
//! Readers clone the `Arc` and never see a half-applied event. The writer
//! mutates through `Arc::make_mut`, so a reader still holding an older view
//! keeps it untouched (copy-on-write) while an unshared roster is updated in
//! place.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::event::{EventEnvelope, RaceEvent};
use crate::participant::ParticipantRecord;
use crate::reducer;

/// Active and finished participants. The two key sets are always disjoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    pub(crate) active: BTreeMap<String, ParticipantRecord>,
    pub(crate) finished: BTreeMap<String, ParticipantRecord>,
    /// Finishes observed so far; feeds `finish_rank`.
    pub(crate) finish_count: u32,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &BTreeMap<String, ParticipantRecord> {
        &self.active
    }

    pub fn finished(&self) -> &BTreeMap<String, ParticipantRecord> {
        &self.finished
    }

    /// Look up an id in either set.
    pub fn get(&self, id: &str) -> Option<&ParticipantRecord> {
        self.active.get(id).or_else(|| self.finished.get(id))
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn is_finished(&self, id: &str) -> bool {
        self.finished.contains_key(id)
    }

    /// Active plus finished.
    pub fn len(&self) -> usize {
        self.active.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.finished.is_empty()
    }

    /// Participants that have not reported a position yet.
    pub fn pending_count(&self) -> usize {
        self.records().filter(|r| !r.has_position()).count()
    }

    /// All records, active first, each set in id order.
    pub fn records(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.active.values().chain(self.finished.values())
    }

    /// Whether the active/finished key sets are disjoint.
    pub fn is_disjoint(&self) -> bool {
        let (small, large) = if self.active.len() <= self.finished.len() {
            (&self.active, &self.finished)
        } else {
            (&self.finished, &self.active)
        };
        small.keys().all(|id| !large.contains_key(id))
    }
}

/// What a single event changed.
///
/// Ids are listed at most once per field. `replaced` marks a wholesale
/// replacement of the active set, after which consumers should rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterDelta {
    /// Active records inserted or modified.
    pub upserted: Vec<String>,
    /// Records moved from active to finished.
    pub finished: Vec<String>,
    /// Records removed without finishing.
    pub removed: Vec<String>,
    pub replaced: bool,
}

impl RosterDelta {
    pub fn is_empty(&self) -> bool {
        !self.replaced
            && self.upserted.is_empty()
            && self.finished.is_empty()
            && self.removed.is_empty()
    }

    /// Every id this delta mentions.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.upserted
            .iter()
            .chain(&self.finished)
            .chain(&self.removed)
            .map(String::as_str)
    }

    /// Fold a later delta into this one.
    pub fn merge(&mut self, later: RosterDelta) {
        fn push_unique(into: &mut Vec<String>, ids: Vec<String>) {
            for id in ids {
                if !into.contains(&id) {
                    into.push(id);
                }
            }
        }
        self.replaced |= later.replaced;
        push_unique(&mut self.upserted, later.upserted);
        push_unique(&mut self.finished, later.finished);
        push_unique(&mut self.removed, later.removed);
    }
}

/// A consistent, owned copy of the roster at one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterSnapshot {
    pub version: u64,
    pub active: Vec<ParticipantRecord>,
    pub finished: Vec<ParticipantRecord>,
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub events_applied: u64,
    /// Events that changed nothing (duplicates, stale updates).
    pub events_absorbed: u64,
    /// Snapshot records reported finished that were never seen finishing
    /// locally, so they are missing from the finished set.
    pub finishes_missed: u64,
    pub version: u64,
}

struct Versioned {
    version: u64,
    roster: Arc<Roster>,
}

/// Authoritative roster for one room.
pub struct RosterStore {
    room_id: String,
    current: RwLock<Versioned>,
    events_applied: AtomicU64,
    events_absorbed: AtomicU64,
    finishes_missed: AtomicU64,
}

impl RosterStore {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            current: RwLock::new(Versioned {
                version: 0,
                roster: Arc::new(Roster::default()),
            }),
            events_applied: AtomicU64::new(0),
            events_absorbed: AtomicU64::new(0),
            finishes_missed: AtomicU64::new(0),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    // A panicking reader cannot leave the roster half-written (writes are a
    // single assignment), so a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, Versioned> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Versioned> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply one event. The returned delta is empty for no-op events.
    pub fn apply_event(&self, envelope: EventEnvelope) -> RosterDelta {
        let kind = envelope.event.kind();
        let mut guard = self.write();
        if let RaceEvent::RoomSnapshot(records) = &envelope.event {
            let missed: Vec<&str> = records
                .iter()
                .filter(|r| r.state.finished && !guard.roster.is_finished(r.id()))
                .map(ParticipantRecord::id)
                .collect();
            if !missed.is_empty() {
                log::info!(
                    "[{}] snapshot reports {} finish(es) not seen live: {missed:?}",
                    self.room_id,
                    missed.len()
                );
                self.finishes_missed
                    .fetch_add(missed.len() as u64, Ordering::Relaxed);
            }
        }
        let roster = Arc::make_mut(&mut guard.roster);
        let (next, delta) = reducer::reduce(std::mem::take(roster), envelope);
        *roster = next;

        self.events_applied.fetch_add(1, Ordering::Relaxed);
        if delta.is_empty() {
            self.events_absorbed.fetch_add(1, Ordering::Relaxed);
            log::trace!("[{}] {kind} absorbed as no-op", self.room_id);
        } else {
            guard.version += 1;
        }
        delta
    }

    /// Cheap read handle on the current roster.
    pub fn view(&self) -> Arc<Roster> {
        Arc::clone(&self.read().roster)
    }

    /// Owned copy of both sets, taken atomically.
    pub fn snapshot(&self) -> RosterSnapshot {
        let guard = self.read();
        RosterSnapshot {
            version: guard.version,
            active: guard.roster.active.values().cloned().collect(),
            finished: guard.roster.finished.values().cloned().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Clear everything (session teardown). Returns a delta removing every id.
    pub fn reset(&self) -> RosterDelta {
        let mut guard = self.write();
        let previous = std::mem::replace(&mut guard.roster, Arc::new(Roster::default()));
        guard.version += 1;
        log::debug!("[{}] roster reset ({} records dropped)", self.room_id, previous.len());
        RosterDelta {
            removed: previous
                .active
                .keys()
                .chain(previous.finished.keys())
                .cloned()
                .collect(),
            replaced: true,
            ..RosterDelta::default()
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_absorbed: self.events_absorbed.load(Ordering::Relaxed),
            finishes_missed: self.finishes_missed.load(Ordering::Relaxed),
            version: self.version(),
        }
    }
}
