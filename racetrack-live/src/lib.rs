//! # racetrack-live: Live connection to a race room
//!
//! Keeps a [`racetrack_core::RosterStore`] in step with a race server over a
//! websocket, surviving drops, silent stalls and out-of-order delivery.
//!
//! ## Architecture
//!
//! ```text
//!   Server ◄──── ws (JSON text frames) ────► WsTransport
//!                                                │
//!                                         RaceSession task
//!                      joinRoom / leaveRoom ◄────┤────► decode_inbound()
//!                                                │            │
//!                                                │            ▼
//!                                                │      RosterStore::apply_event()
//!                                                ▼
//!                                   SessionEvent channel ──► RaceTracker projector
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use racetrack_core::{Identity, Role, RouteGeometry};
//! use racetrack_live::{RaceTracker, SessionConfig, WsConnector};
//!
//! # async fn demo() {
//! let config = SessionConfig::new("ws://127.0.0.1:9090", "city-10k");
//! let connector = WsConnector::new(config.server_url.clone());
//! let tracker = RaceTracker::start(
//!     config,
//!     Identity::local("Spectator", Role::Guest),
//!     connector,
//!     RouteGeometry::empty(),
//! );
//! let panel = tracker.panel();
//! println!("{} running, {} finished", panel.active.len(), panel.finished.len());
//! tracker.leave();
//! # }
//! ```

pub mod config;
pub mod protocol;
pub mod session;
pub mod tracker;
pub mod transport;

// Re-exports for convenience
pub use config::{Backoff, BackoffConfig, ConfigError, SessionConfig};
pub use protocol::{decode_inbound, Command, Inbound, InboundFrame, ProtocolError};
pub use session::{
    RaceSession, SessionError, SessionEvent, SessionHandle, SessionState, SessionStats,
};
pub use tracker::{RaceStatus, RaceTracker};
pub use transport::{Connector, Transport, TransportError, WsConnector, WsTransport};
