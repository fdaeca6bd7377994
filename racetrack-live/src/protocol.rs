//! JSON text-frame protocol spoken by the websocket transport.
//!
//! Inbound frames:
//! ```text
//! {"event": "roomSnapshot",   "data": [ {id, name, role, bib?, lat?, lng?, …}, … ]}
//! {"event": "join",           "data": {id, name, role, bib?}}
//! {"event": "locationUpdate", "data": {id, lat, lng, speed?, distance?}}
//! {"event": "finish",         "data": {id, name?}}
//! {"event": "leave",          "data": {id}}
//! {"event": "joinRejected",   "data": {reason}}
//! {"event": "raceStarted"} | {"event": "raceStopped"}
//! ```
//!
//! Outbound frames carry a `command` tag instead:
//! `joinRoom`, `leaveRoom`, `startRace`, `stopRace`.

use racetrack_core::event::{RawFinish, RawLeave, RawLocation, RawParticipant};
use racetrack_core::{EventError, Identity, RaceEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Invalid event payload: {0}")]
    Event(#[from] EventError),
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Race(RaceEvent),
    JoinRejected { reason: String },
    RaceStarted,
    RaceStopped,
}

/// An inbound message plus the number of snapshot records that were
/// malformed and left out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub message: Inbound,
    pub discarded: usize,
}

impl InboundFrame {
    fn whole(message: Inbound) -> Self {
        Self {
            message,
            discarded: 0,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize, Default)]
struct RawRejection {
    #[serde(default)]
    reason: Option<String>,
}

/// Parse one text frame.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, ProtocolError> {
    let Envelope { event, data } = serde_json::from_str(text)?;
    let frame = match event.as_str() {
        "roomSnapshot" => {
            let records: Vec<RawParticipant> = match data {
                Value::Null => Vec::new(),
                other => serde_json::from_value(other)?,
            };
            let (event, rejected) = RaceEvent::snapshot_from_raw(&records);
            for e in &rejected {
                log::debug!("Dropping malformed snapshot record: {e}");
            }
            InboundFrame {
                message: Inbound::Race(event),
                discarded: rejected.len(),
            }
        }
        "join" => {
            let raw: RawParticipant = serde_json::from_value(data)?;
            InboundFrame::whole(Inbound::Race(RaceEvent::join_from_raw(&raw)?))
        }
        "locationUpdate" => {
            let raw: RawLocation = serde_json::from_value(data)?;
            InboundFrame::whole(Inbound::Race(RaceEvent::location_from_raw(&raw)?))
        }
        "finish" => {
            let raw: RawFinish = serde_json::from_value(data)?;
            InboundFrame::whole(Inbound::Race(RaceEvent::finish_from_raw(&raw)?))
        }
        "leave" => {
            let raw: RawLeave = serde_json::from_value(data)?;
            InboundFrame::whole(Inbound::Race(RaceEvent::leave_from_raw(&raw)?))
        }
        "joinRejected" => {
            let raw: RawRejection = match data {
                Value::Null => RawRejection::default(),
                other => serde_json::from_value(other)?,
            };
            InboundFrame::whole(Inbound::JoinRejected {
                reason: raw.reason.unwrap_or_else(|| "join rejected".to_string()),
            })
        }
        "raceStarted" => InboundFrame::whole(Inbound::RaceStarted),
        "raceStopped" => InboundFrame::whole(Inbound::RaceStopped),
        other => return Err(ProtocolError::UnknownEvent(other.to_string())),
    };
    Ok(frame)
}

/// Outbound commands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    JoinRoom { room_id: String, identity: Identity },
    LeaveRoom { room_id: String },
    StartRace { room_id: String },
    StopRace { room_id: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::JoinRoom { .. } => "joinRoom",
            Command::LeaveRoom { .. } => "leaveRoom",
            Command::StartRace { .. } => "startRace",
            Command::StopRace { .. } => "stopRace",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use racetrack_core::Role;
    use serde_json::json;

    #[test]
    fn test_decode_location_update() {
        let frame = decode_inbound(r#"{"event":"locationUpdate","data":{"id":"u1","lat":7.1,"lng":125.62}}"#)
            .unwrap();
        assert_eq!(frame.message, Inbound::Race(RaceEvent::location("u1", 7.1, 125.62)));
        assert_eq!(frame.discarded, 0);
    }

    #[test]
    fn test_decode_snapshot_counts_discarded() {
        let text = json!({
            "event": "roomSnapshot",
            "data": [{"id": "u1", "name": "Ann"}, {"name": "nobody"}, {"id": "u3"}]
        })
        .to_string();
        let frame = decode_inbound(&text).unwrap();
        assert_eq!(frame.discarded, 1);
        match frame.message {
            Inbound::Race(RaceEvent::RoomSnapshot(records)) => assert_eq!(records.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_control_signals() {
        assert_eq!(
            decode_inbound(r#"{"event":"raceStarted"}"#).unwrap().message,
            Inbound::RaceStarted
        );
        assert_eq!(
            decode_inbound(r#"{"event":"joinRejected","data":{"reason":"bad token"}}"#)
                .unwrap()
                .message,
            Inbound::JoinRejected { reason: "bad token".into() }
        );
        assert_eq!(
            decode_inbound(r#"{"event":"joinRejected"}"#).unwrap().message,
            Inbound::JoinRejected { reason: "join rejected".into() }
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode_inbound("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode_inbound(r#"{"event":"teleport","data":{}}"#),
            Err(ProtocolError::UnknownEvent(name)) if name == "teleport"
        ));
        assert!(matches!(
            decode_inbound(r#"{"event":"finish","data":{}}"#),
            Err(ProtocolError::Event(EventError::MissingId))
        ));
        assert!(matches!(
            decode_inbound(r#"{"event":"locationUpdate","data":{"id":"u1","lat":"x","lng":1}}"#),
            Err(ProtocolError::Event(_))
        ));
        assert!(decode_inbound(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_encode_join_room() {
        let cmd = Command::JoinRoom {
            room_id: "race-7".into(),
            identity: Identity::new("me", "Observer", Role::Guest),
        };
        let value: Value = serde_json::from_str(&cmd.encode().unwrap()).unwrap();
        assert_eq!(value["command"], "joinRoom");
        assert_eq!(value["data"]["roomId"], "race-7");
        assert_eq!(value["data"]["identity"]["role"], "guest");
        assert_eq!(cmd.name(), "joinRoom");
    }

    #[test]
    fn test_encode_leave_room() {
        let cmd = Command::LeaveRoom { room_id: "race-7".into() };
        let value: Value = serde_json::from_str(&cmd.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"command": "leaveRoom", "data": {"roomId": "race-7"}}));
    }
}
