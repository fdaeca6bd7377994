//! # racetrack-core: Live roster reconciliation for races in progress
//!
//! Turns an unordered, duplicated, gappy stream of participant lifecycle and
//! location events into a consistent roster and render-ready views.
//!
//! ## Architecture
//!
//! ```text
//!  EventEnvelope ──► reducer::reduce() ──► RosterStore (Arc<Roster>, versioned)
//!                          │                      │
//!                          ▼                      ▼ view()
//!                     RosterDelta ──────► IncrementalProjection ──► RenderModel
//!                                                 │
//!                                           RouteGeometry (shared, immutable)
//! ```
//!
//! ## Modules
//!
//! - [`participant`]: identity, state and record types
//! - [`event`]: normalized events and lenient raw payload parsing
//! - [`reducer`]: pure `(Roster, Event) -> (Roster, Delta)` transition
//! - [`roster`]: roster, deltas and the per-room store
//! - [`projection`]: map features and results panel
//! - [`route`]: static course geometry
//!
//! No I/O happens in this crate; the live session lives in `racetrack-live`.

pub mod participant;
pub mod event;
pub mod reducer;
pub mod roster;
pub mod projection;
pub mod route;

// Re-exports for convenience
pub use participant::{Identity, Millis, ParticipantRecord, ParticipantState, Position, Role};
pub use event::{
    EventEnvelope, EventError, RaceEvent, RawFinish, RawLeave, RawLocation, RawParticipant,
};
pub use roster::{Roster, RosterDelta, RosterSnapshot, RosterStore, StoreStats};
pub use projection::{
    derive_features, IncrementalProjection, PanelRow, PanelView, PointFeature, RenderModel,
};
pub use route::{Bounds, RouteError, RouteGeometry};
