//! Participant identity, mutable race state and the combined record.
//!
//! Identity is fixed once a record exists (apart from merges carried by a
//! later `join`); state is written only by the reducer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name given to participants first seen through a location update.
pub const PLACEHOLDER_NAME: &str = "User";

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Participant role within a race room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Racer,
    Guest,
}

impl Role {
    /// Parse a role label, case-insensitively.
    ///
    /// Returns `None` for labels outside `admin`/`racer`/`guest`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "racer" => Some(Role::Racer),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Racer => "racer",
            Role::Guest => "guest",
        }
    }
}

/// Who a participant is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bib: Option<u32>,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            bib: None,
        }
    }

    /// Identity for the local observer, with a freshly generated id.
    pub fn local(name: impl Into<String>, role: Role) -> Self {
        Self::new(Uuid::new_v4().to_string(), name, role)
    }

    /// Minimal identity synthesized when a location update precedes the join.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self::new(id, PLACEHOLDER_NAME, Role::Racer)
    }

    /// Whether this is still the identity synthesized by [`Identity::placeholder`].
    pub fn is_placeholder(&self) -> bool {
        self.name == PLACEHOLDER_NAME && self.role == Role::default() && self.bib.is_none()
    }

    pub fn with_bib(mut self, bib: u32) -> Self {
        self.bib = Some(bib);
        self
    }
}

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether both components are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// `[lng, lat]`, the axis order map renderers expect.
    pub fn lng_lat(&self) -> [f64; 2] {
        [self.lng, self.lat]
    }
}

/// Mutable per-participant race state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Monotonic: never returns to `false` once set.
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Millis>,
    /// Order in which the finish was observed in this session, starting at 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_rank: Option<u32>,
}

/// Identity plus state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(flatten)]
    pub state: ParticipantState,
}

impl ParticipantRecord {
    /// A record with empty state.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            state: ParticipantState::default(),
        }
    }

    pub fn with_position(mut self, lat: f64, lng: f64) -> Self {
        self.state.position = Some(Position::new(lat, lng));
        self
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn has_position(&self) -> bool {
        self.state.position.is_some()
    }
}
