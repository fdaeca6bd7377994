//! Race tracker: one room's store, session and render model together.
//!
//! ```text
//! Connector ──► RaceSession ──► RosterStore
//!                    │ SessionEvent
//!                    ▼
//!            projector task ──► IncrementalProjection ──► watch<Arc<RenderModel>>
//! ```
//!
//! The render model is republished after every roster change; the results
//! panel is derived on demand from the store's current view.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use racetrack_core::{Identity, IncrementalProjection, PanelView, RenderModel, RosterStore, RouteGeometry};

use crate::config::SessionConfig;
use crate::session::{RaceSession, SessionError, SessionEvent, SessionHandle, SessionState};
use crate::transport::Connector;

/// Last start/stop signal seen for the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaceStatus {
    #[default]
    Unknown,
    Started,
    Stopped,
}

pub struct RaceTracker {
    session: SessionHandle,
    render: watch::Receiver<Arc<RenderModel>>,
    status: watch::Receiver<RaceStatus>,
    projector: JoinHandle<()>,
}

impl RaceTracker {
    /// Join `config.room_id` and start projecting onto `route`.
    pub fn start<C: Connector + 'static>(
        config: SessionConfig,
        identity: Identity,
        connector: C,
        route: RouteGeometry,
    ) -> Self {
        let store = Arc::new(RosterStore::new(config.room_id.clone()));
        let route = Arc::new(route);
        let (session, events) = RaceSession::spawn(config, identity, connector, Arc::clone(&store));

        let (render_tx, render) = watch::channel(Arc::new(RenderModel::empty(Arc::clone(&route))));
        let (status_tx, status) = watch::channel(RaceStatus::Unknown);
        let projector = tokio::spawn(project(events, store, route, render_tx, status_tx));

        Self {
            session,
            render,
            status,
            projector,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Subscribe to render model updates.
    pub fn render_model(&self) -> watch::Receiver<Arc<RenderModel>> {
        self.render.clone()
    }

    pub fn current_model(&self) -> Arc<RenderModel> {
        Arc::clone(&self.render.borrow())
    }

    pub fn panel(&self) -> PanelView {
        PanelView::from_roster(&self.session.store().view())
    }

    pub fn race_status(&self) -> RaceStatus {
        *self.status.borrow()
    }

    pub fn leave(&self) {
        self.session.leave();
    }

    /// Wait for the session to end and the last update to be published.
    pub async fn closed(self) -> Result<(), SessionError> {
        let result = self.session.closed().await;
        if let Err(e) = self.projector.await {
            log::error!("Projector task failed: {e}");
        }
        result
    }
}

async fn project(
    mut events: mpsc::Receiver<SessionEvent>,
    store: Arc<RosterStore>,
    route: Arc<RouteGeometry>,
    render_tx: watch::Sender<Arc<RenderModel>>,
    status_tx: watch::Sender<RaceStatus>,
) {
    let mut projection = IncrementalProjection::new(route);
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::RosterChanged(delta) => {
                projection.apply(&store.view(), &delta);
                render_tx.send_replace(Arc::new(projection.model()));
            }
            SessionEvent::RaceStarted => {
                status_tx.send_replace(RaceStatus::Started);
            }
            SessionEvent::RaceStopped => {
                status_tx.send_replace(RaceStatus::Stopped);
            }
            SessionEvent::Resynced { active, replayed } => {
                log::debug!(
                    "[{}] resynced with {active} active ({replayed} replayed)",
                    store.room_id()
                );
            }
            SessionEvent::StateChanged(state) => {
                log::debug!("[{}] session {state:?}", store.room_id());
            }
            SessionEvent::Rejected { .. } => {}
        }
    }
}
