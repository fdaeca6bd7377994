//! Pure state transition: `(Roster, EventEnvelope) -> (Roster, RosterDelta)`.
//!
//! Events are applied exactly in the order given. Position is
//! last-applied-wins; `finish` and `leave` are idempotent and monotone, so
//! duplicated or reordered deliveries can at worst show a stale position
//! until the next update.
//!
//! | Event            | Effect                                               |
//! |------------------|------------------------------------------------------|
//! | `roomSnapshot`   | replace `active` wholesale, `finished` untouched     |
//! | `join`           | insert into `active`, or fill a placeholder identity |
//! | `locationUpdate` | update in place, synthesize if unknown               |
//! | `finish`         | move `active` → `finished`                           |
//! | `leave`          | remove from `active`                                 |
//!
//! Anything addressing a finished id (other than a no-op) is ignored.

use std::collections::BTreeMap;

use crate::event::{EventEnvelope, RaceEvent};
use crate::participant::{Identity, Millis, ParticipantRecord, Position};
use crate::roster::{Roster, RosterDelta};

/// Apply one event.
pub fn reduce(roster: Roster, envelope: EventEnvelope) -> (Roster, RosterDelta) {
    let EventEnvelope { received_at, event } = envelope;
    let mut roster = roster;
    let delta = match event {
        RaceEvent::RoomSnapshot(records) => apply_snapshot(&mut roster, records),
        RaceEvent::Join(identity) => apply_join(&mut roster, identity),
        RaceEvent::LocationUpdate {
            id,
            position,
            speed,
            distance,
        } => apply_location(&mut roster, id, position, speed, distance, received_at),
        RaceEvent::Finish { id, name } => apply_finish(&mut roster, id, name, received_at),
        RaceEvent::Leave { id } => apply_leave(&mut roster, id),
    };
    debug_assert!(roster.is_disjoint());
    (roster, delta)
}

fn apply_snapshot(roster: &mut Roster, records: Vec<ParticipantRecord>) -> RosterDelta {
    let mut next = BTreeMap::new();
    for mut record in records {
        // A finished id stays terminal even if the server still lists it.
        if roster.finished.contains_key(record.id()) {
            log::debug!("Snapshot lists finished participant {}, skipping", record.id());
            continue;
        }
        // Finished while we were away: `finished` is only fed by live events.
        if record.state.finished {
            continue;
        }
        record.state.finished_at = None;
        record.state.finish_rank = None;
        next.insert(record.identity.id.clone(), record);
    }

    let removed = roster
        .active
        .keys()
        .filter(|id| !next.contains_key(*id))
        .cloned()
        .collect();
    let upserted = next.keys().cloned().collect();
    roster.active = next;

    RosterDelta {
        upserted,
        removed,
        replaced: true,
        ..RosterDelta::default()
    }
}

fn apply_join(roster: &mut Roster, identity: Identity) -> RosterDelta {
    if roster.finished.contains_key(&identity.id) {
        return RosterDelta::default();
    }

    let id = identity.id.clone();
    match roster.active.get_mut(&id) {
        // Late join over a synthesized record: take the announced identity.
        Some(existing) if existing.identity.is_placeholder() => {
            if existing.identity == identity {
                return RosterDelta::default();
            }
            existing.identity = identity;
        }
        // Duplicate join: identity is fixed once established, only a missing
        // bib is filled in.
        Some(existing) => match (existing.identity.bib, identity.bib) {
            (None, Some(bib)) => existing.identity.bib = Some(bib),
            _ => return RosterDelta::default(),
        },
        None => {
            roster.active.insert(id.clone(), ParticipantRecord::new(identity));
        }
    }

    RosterDelta {
        upserted: vec![id],
        ..RosterDelta::default()
    }
}

fn apply_location(
    roster: &mut Roster,
    id: String,
    position: Position,
    speed: Option<f64>,
    distance: Option<f64>,
    received_at: Millis,
) -> RosterDelta {
    if roster.finished.contains_key(&id) {
        return RosterDelta::default();
    }

    let record = roster
        .active
        .entry(id.clone())
        .or_insert_with(|| ParticipantRecord::new(Identity::placeholder(id.clone())));
    let state = &mut record.state;
    state.position = Some(position);
    if speed.is_some() {
        state.speed = speed;
    }
    if distance.is_some() {
        state.distance = distance;
    }
    state.last_update = Some(received_at);

    RosterDelta {
        upserted: vec![id],
        ..RosterDelta::default()
    }
}

fn apply_finish(
    roster: &mut Roster,
    id: String,
    name: Option<String>,
    received_at: Millis,
) -> RosterDelta {
    let Some(mut record) = roster.active.remove(&id) else {
        return RosterDelta::default();
    };

    roster.finish_count += 1;
    if let Some(name) = name {
        record.identity.name = name;
    }
    record.state.finished = true;
    record.state.finished_at = Some(received_at);
    record.state.finish_rank = Some(roster.finish_count);
    roster.finished.insert(id.clone(), record);

    RosterDelta {
        finished: vec![id],
        ..RosterDelta::default()
    }
}

fn apply_leave(roster: &mut Roster, id: String) -> RosterDelta {
    if roster.active.remove(&id).is_none() {
        return RosterDelta::default();
    }
    RosterDelta {
        removed: vec![id],
        ..RosterDelta::default()
    }
}
