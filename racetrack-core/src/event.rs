//! Normalized inbound race events and the lenient raw payloads they are
//! built from.
//!
//! Raw payloads accept whatever the stream hands over (ids as strings or
//! numbers, coordinates as numbers or numeric strings). Conversion into a
//! [`RaceEvent`] either yields a well-formed event or an [`EventError`];
//! malformed input never reaches the reducer.

use serde::Deserialize;
use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;

use crate::participant::{Identity, Millis, ParticipantRecord, ParticipantState, Position, Role};

/// Reasons a raw payload is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Missing participant id")]
    MissingId,
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("Coordinate out of range: lat={lat}, lng={lng}")]
    OutOfRange { lat: f64, lng: f64 },
}

/// A well-formed event, ready for the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum RaceEvent {
    /// Full replacement of the active roster.
    RoomSnapshot(Vec<ParticipantRecord>),
    Join(Identity),
    LocationUpdate {
        id: String,
        position: Position,
        speed: Option<f64>,
        distance: Option<f64>,
    },
    Finish {
        id: String,
        name: Option<String>,
    },
    Leave {
        id: String,
    },
}

impl RaceEvent {
    pub fn location(id: impl Into<String>, lat: f64, lng: f64) -> Self {
        RaceEvent::LocationUpdate {
            id: id.into(),
            position: Position::new(lat, lng),
            speed: None,
            distance: None,
        }
    }

    pub fn finish(id: impl Into<String>) -> Self {
        RaceEvent::Finish {
            id: id.into(),
            name: None,
        }
    }

    pub fn leave(id: impl Into<String>) -> Self {
        RaceEvent::Leave { id: id.into() }
    }

    /// Event name as it appears on the stream, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaceEvent::RoomSnapshot(_) => "roomSnapshot",
            RaceEvent::Join(_) => "join",
            RaceEvent::LocationUpdate { .. } => "locationUpdate",
            RaceEvent::Finish { .. } => "finish",
            RaceEvent::Leave { .. } => "leave",
        }
    }

    /// The single participant this event addresses, if any.
    pub fn participant_id(&self) -> Option<&str> {
        match self {
            RaceEvent::RoomSnapshot(_) => None,
            RaceEvent::Join(identity) => Some(&identity.id),
            RaceEvent::LocationUpdate { id, .. }
            | RaceEvent::Finish { id, .. }
            | RaceEvent::Leave { id } => Some(id),
        }
    }
}

/// An event stamped with its local receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub received_at: Millis,
    pub event: RaceEvent,
}

impl EventEnvelope {
    /// Stamp an event with the current wall clock.
    pub fn new(event: RaceEvent) -> Self {
        Self::at(event, now_millis())
    }

    pub fn at(event: RaceEvent, received_at: Millis) -> Self {
        Self { received_at, event }
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or_default()
}

// ───────────────────────────────────────────────────────────────────
// Raw payloads
// ───────────────────────────────────────────────────────────────────

/// A participant as carried by `join` and `roomSnapshot` payloads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawParticipant {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub bib: Option<Value>,
    #[serde(default)]
    pub lat: Option<Value>,
    #[serde(default)]
    pub lng: Option<Value>,
    #[serde(default)]
    pub speed: Option<Value>,
    #[serde(default)]
    pub distance: Option<Value>,
    #[serde(default)]
    pub finished: Option<bool>,
    #[serde(default)]
    pub last_update: Option<Millis>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLocation {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub lat: Option<Value>,
    #[serde(default)]
    pub lng: Option<Value>,
    #[serde(default)]
    pub speed: Option<Value>,
    #[serde(default)]
    pub distance: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFinish {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLeave {
    #[serde(default)]
    pub id: Option<Value>,
}

fn parse_id(value: Option<&Value>) -> Result<String, EventError> {
    let id = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(EventError::MissingId),
    };
    if id.is_empty() {
        return Err(EventError::MissingId);
    }
    Ok(id)
}

fn parse_number(field: &'static str, value: &Value) -> Result<f64, EventError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(EventError::InvalidValue {
            field,
            value: value.to_string(),
        }),
    }
}

/// Optional telemetry: absent or `null` is fine, garbage is not.
fn parse_optional_number(field: &'static str, value: Option<&Value>) -> Result<Option<f64>, EventError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_number(field, v).map(Some),
    }
}

fn parse_position(lat: Option<&Value>, lng: Option<&Value>) -> Result<Position, EventError> {
    let lat = parse_number("lat", lat.ok_or(EventError::MissingField("lat"))?)?;
    let lng = parse_number("lng", lng.ok_or(EventError::MissingField("lng"))?)?;
    let position = Position::new(lat, lng);
    if !position.is_valid() {
        return Err(EventError::OutOfRange { lat, lng });
    }
    Ok(position)
}

fn parse_bib(value: Option<&Value>) -> Result<Option<u32>, EventError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => {
            let parsed = match v {
                Value::Number(n) => n.as_u64().and_then(|b| u32::try_from(b).ok()),
                Value::String(s) => s.trim().parse::<u32>().ok(),
                _ => None,
            };
            parsed.map(Some).ok_or_else(|| EventError::InvalidValue {
                field: "bib",
                value: v.to_string(),
            })
        }
    }
}

impl TryFrom<&RawParticipant> for Identity {
    type Error = EventError;

    fn try_from(raw: &RawParticipant) -> Result<Self, Self::Error> {
        let id = parse_id(raw.id.as_ref())?;
        let name = raw
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(crate::participant::PLACEHOLDER_NAME)
            .to_string();
        let role = match raw.role.as_deref() {
            Some(label) => Role::from_label(label).unwrap_or_else(|| {
                log::debug!("Unknown role '{label}' for {id}, treating as racer");
                Role::Racer
            }),
            None => Role::Racer,
        };
        Ok(Identity {
            id,
            name,
            role,
            bib: parse_bib(raw.bib.as_ref())?,
        })
    }
}

impl TryFrom<&RawParticipant> for ParticipantRecord {
    type Error = EventError;

    /// Snapshot records may carry state; a position needs both coordinates.
    fn try_from(raw: &RawParticipant) -> Result<Self, Self::Error> {
        let identity = Identity::try_from(raw)?;
        let position = match (raw.lat.as_ref(), raw.lng.as_ref()) {
            (None | Some(Value::Null), None | Some(Value::Null)) => None,
            (lat, lng) => Some(parse_position(lat, lng)?),
        };
        Ok(ParticipantRecord {
            identity,
            state: ParticipantState {
                position,
                finished: raw.finished.unwrap_or(false),
                speed: parse_optional_number("speed", raw.speed.as_ref())?,
                distance: parse_optional_number("distance", raw.distance.as_ref())?,
                last_update: raw.last_update,
                finished_at: None,
                finish_rank: None,
            },
        })
    }
}

impl RaceEvent {
    /// Build a snapshot, skipping (and reporting) malformed records.
    pub fn snapshot_from_raw(raw: &[RawParticipant]) -> (RaceEvent, Vec<EventError>) {
        let mut records = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();
        for participant in raw {
            match ParticipantRecord::try_from(participant) {
                Ok(record) => records.push(record),
                Err(e) => rejected.push(e),
            }
        }
        (RaceEvent::RoomSnapshot(records), rejected)
    }

    pub fn join_from_raw(raw: &RawParticipant) -> Result<RaceEvent, EventError> {
        Identity::try_from(raw).map(RaceEvent::Join)
    }

    pub fn location_from_raw(raw: &RawLocation) -> Result<RaceEvent, EventError> {
        Ok(RaceEvent::LocationUpdate {
            id: parse_id(raw.id.as_ref())?,
            position: parse_position(raw.lat.as_ref(), raw.lng.as_ref())?,
            speed: parse_optional_number("speed", raw.speed.as_ref())?,
            distance: parse_optional_number("distance", raw.distance.as_ref())?,
        })
    }

    pub fn finish_from_raw(raw: &RawFinish) -> Result<RaceEvent, EventError> {
        Ok(RaceEvent::Finish {
            id: parse_id(raw.id.as_ref())?,
            name: raw
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        })
    }

    pub fn leave_from_raw(raw: &RawLeave) -> Result<RaceEvent, EventError> {
        Ok(RaceEvent::Leave {
            id: parse_id(raw.id.as_ref())?,
        })
    }
}
