//! Racetrack Viewer: headless spectator for a live race.
//!
//! Joins a room as a guest and logs the results panel whenever the roster
//! changes. Ctrl-C leaves the room.
//!
//! ```text
//! racetrack-viewer [config.json] [route.geojson]
//! ```
//!
//! Without a config file the defaults apply, overridable through
//! `RACETRACK_SERVER`, `RACETRACK_ROOM` and `RACETRACK_NAME`.

use log::{error, info, warn};
use std::error::Error;

use racetrack_core::{Identity, PanelView, Role, RouteGeometry};
use racetrack_live::{RaceTracker, SessionConfig, SessionError, WsConnector};

fn load_config(path: Option<&String>) -> Result<SessionConfig, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Ok(server) = std::env::var("RACETRACK_SERVER") {
        config.server_url = server;
    }
    if let Ok(room) = std::env::var("RACETRACK_ROOM") {
        config.room_id = room;
    }
    config.validate()?;
    Ok(config)
}

fn load_route(path: Option<&String>) -> RouteGeometry {
    match path.map(|p| RouteGeometry::load(p)) {
        Some(Ok(route)) => {
            info!("Loaded route with {} points", route.len());
            route
        }
        Some(Err(e)) => {
            warn!("Route unavailable, continuing without it: {e}");
            RouteGeometry::empty()
        }
        None => RouteGeometry::empty(),
    }
}

fn log_panel(panel: &PanelView) {
    info!(
        "{} running, {} finished, {} awaiting first fix",
        panel.active.len(),
        panel.finished.len(),
        panel.pending
    );
    for row in &panel.finished {
        info!(
            "  #{} {} (bib {})",
            row.finish_rank.unwrap_or_default(),
            row.name,
            row.bib.map_or_else(|| "-".to_string(), |b| b.to_string())
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(args.first())?;
    let route = load_route(args.get(1));
    let name = std::env::var("RACETRACK_NAME").unwrap_or_else(|_| "Spectator".to_string());

    info!("Starting Racetrack Viewer for room '{}' at {}", config.room_id, config.server_url);

    let connector = WsConnector::new(config.server_url.clone());
    let tracker = RaceTracker::start(config, Identity::local(name, Role::Guest), connector, route);
    let mut render = tracker.render_model();
    let mut state = tracker.session().watch_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving room");
                tracker.leave();
                break;
            }
            changed = render.changed() => {
                if changed.is_err() {
                    break;
                }
                log_panel(&tracker.panel());
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    break;
                }
                info!("Session {:?}", *state.borrow());
            }
        }
    }

    match tracker.closed().await {
        Ok(()) => {
            info!("Left room");
            Ok(())
        }
        Err(e @ SessionError::Unauthorized(_)) => {
            error!("Not allowed to watch this race: {e}");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
