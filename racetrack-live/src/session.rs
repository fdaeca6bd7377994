//! Connection session: owns the stream lifecycle for one room and feeds
//! inbound events to the roster store in receipt order.
//!
//! State machine:
//!
//! ```text
//! Disconnected ─► Connecting ─► Joined ─┬─► Left
//!                     │           ▲     │
//!                     ▼           │     ▼
//!                 Reconnecting ───┘   Rejected
//! ```
//!
//! - On `Joined` a `joinRoom` command is sent. Events arriving before the
//!   `roomSnapshot` reply are buffered and replayed after it, so the
//!   snapshot cannot stomp positions that arrived early.
//! - A lost or silent connection moves to `Reconnecting`; events during the
//!   gap are lost and the next snapshot restores the roster.
//! - `leave()` flips the state to `Left` at once. The task then makes a
//!   best-effort `leaveRoom` send, closes the transport and clears the roster,
//!   cancelling any connect attempt or backoff sleep in flight.
//! - Authorization rejection is the only fatal outcome.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use racetrack_core::{EventEnvelope, Identity, RaceEvent, Role, RosterDelta, RosterStore};

use crate::config::{Backoff, SessionConfig};
use crate::protocol::{decode_inbound, Command, Inbound};
use crate::transport::{Connector, Transport, TransportError};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joined,
    Reconnecting,
    Left,
    Rejected,
}

impl SessionState {
    /// `Left` and `Rejected` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Left | SessionState::Rejected)
    }
}

/// Errors surfaced to the session owner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Join rejected: {0}")]
    Unauthorized(String),
    #[error("{0} requires the admin role")]
    NotPermitted(&'static str),
    #[error("Not joined, {0} was not sent")]
    Suspended(&'static str),
    #[error("Session closed")]
    Closed,
}

/// Events emitted by the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The roster changed; the store already reflects it.
    RosterChanged(RosterDelta),
    /// A room snapshot was applied.
    Resynced { active: usize, replayed: usize },
    RaceStarted,
    RaceStopped,
    Rejected { reason: String },
}

/// Session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    /// Undecodable frames and malformed snapshot records.
    pub malformed_dropped: u64,
    pub events_applied: u64,
    /// Events held back until a snapshot and then applied.
    pub events_replayed: u64,
    /// Pre-snapshot events discarded because the buffer was full.
    pub buffer_overflow: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct AtomicSessionStats {
    frames_received: AtomicU64,
    malformed_dropped: AtomicU64,
    events_applied: AtomicU64,
    events_replayed: AtomicU64,
    buffer_overflow: AtomicU64,
    reconnects: AtomicU64,
}

impl AtomicSessionStats {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            buffer_overflow: self.buffer_overflow.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

enum Control {
    Send(Command),
    Leave,
}

/// Owner-side handle for a running session.
///
/// Dropping the handle has the same effect as [`SessionHandle::leave`].
pub struct SessionHandle {
    room_id: String,
    identity: Identity,
    control: mpsc::UnboundedSender<Control>,
    state: Arc<watch::Sender<SessionState>>,
    store: Arc<RosterStore>,
    stats: Arc<AtomicSessionStats>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl SessionHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether the view may currently be stale.
    pub fn is_reconnecting(&self) -> bool {
        self.state() == SessionState::Reconnecting
    }

    pub fn store(&self) -> &Arc<RosterStore> {
        &self.store
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    /// Leave the room. Returns immediately; the state is `Left` on return.
    pub fn leave(&self) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = SessionState::Left;
            true
        });
        if changed {
            log::info!("[{}] leaving room", self.room_id);
        }
        let _ = self.control.send(Control::Leave);
    }

    /// Ask the server to start the race. Admin only.
    pub fn start_race(&self) -> Result<(), SessionError> {
        self.race_command(Command::StartRace {
            room_id: self.room_id.clone(),
        })
    }

    /// Ask the server to stop the race. Admin only.
    pub fn stop_race(&self) -> Result<(), SessionError> {
        self.race_command(Command::StopRace {
            room_id: self.room_id.clone(),
        })
    }

    fn race_command(&self, command: Command) -> Result<(), SessionError> {
        if self.identity.role != Role::Admin {
            return Err(SessionError::NotPermitted(command.name()));
        }
        match self.state() {
            SessionState::Joined => {}
            state if state.is_terminal() => return Err(SessionError::Closed),
            _ => return Err(SessionError::Suspended(command.name())),
        }
        self.control
            .send(Control::Send(command))
            .map_err(|_| SessionError::Closed)
    }

    /// Wait for the session task to end.
    pub async fn closed(self) -> Result<(), SessionError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("[{}] session task failed: {e}", self.room_id);
                Err(SessionError::Closed)
            }
        }
    }
}

enum Served {
    Lost,
    Left,
    Rejected(String),
}

/// The session task. Created through [`RaceSession::spawn`].
pub struct RaceSession<C: Connector> {
    config: SessionConfig,
    identity: Identity,
    connector: C,
    store: Arc<RosterStore>,
    stats: Arc<AtomicSessionStats>,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    backoff: Backoff,
}

impl<C: Connector + 'static> RaceSession<C> {
    /// Start a session task for `config.room_id`.
    ///
    /// The returned receiver must be drained (or dropped): the task waits
    /// for room in the channel before applying the next frame.
    pub fn spawn(
        config: SessionConfig,
        identity: Identity,
        connector: C,
        store: Arc<RosterStore>,
    ) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        if store.room_id() != config.room_id {
            log::warn!(
                "Store for room '{}' attached to session for room '{}'",
                store.room_id(),
                config.room_id
            );
        }

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let state = Arc::new(state_tx);
        let stats = Arc::new(AtomicSessionStats::default());

        let session = RaceSession {
            backoff: Backoff::new(config.reconnect.clone()),
            config: config.clone(),
            identity: identity.clone(),
            connector,
            store: Arc::clone(&store),
            stats: Arc::clone(&stats),
            state: Arc::clone(&state),
            events: event_tx,
            control: control_rx,
        };
        let task = tokio::spawn(session.run());

        let handle = SessionHandle {
            room_id: config.room_id,
            identity,
            control: control_tx,
            state,
            store,
            stats,
            task,
        };
        (handle, event_rx)
    }

    async fn run(mut self) -> Result<(), SessionError> {
        let mut next = SessionState::Connecting;
        loop {
            self.set_state(next).await;

            let attempt = connect_with_timeout(
                &self.connector,
                &self.config.room_id,
                self.config.connect_timeout(),
            );
            let Some(outcome) = until_leave(&mut self.control, attempt).await else {
                self.teardown(None).await;
                return Ok(());
            };

            match outcome {
                Ok(transport) => match self.serve(transport).await {
                    Served::Left => return Ok(()),
                    Served::Rejected(reason) => return Err(self.reject(reason).await),
                    Served::Lost => {}
                },
                Err(TransportError::Unauthorized(reason)) => {
                    return Err(self.reject(reason).await);
                }
                Err(e) => log::warn!("[{}] connect failed: {e}", self.config.room_id),
            }

            next = SessionState::Reconnecting;
            self.set_state(next).await;
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);

            let delay = self.backoff.next_delay();
            log::info!(
                "[{}] reconnecting in {delay:?} (attempt {})",
                self.config.room_id,
                self.backoff.attempts()
            );
            if until_leave(&mut self.control, sleep(delay)).await.is_none() {
                self.teardown(None).await;
                return Ok(());
            }
        }
    }

    /// Run one joined connection until it is lost, left or rejected.
    async fn serve(&mut self, mut transport: C::Transport) -> Served {
        let join = Command::JoinRoom {
            room_id: self.config.room_id.clone(),
            identity: self.identity.clone(),
        };
        if let Err(e) = send_command(&mut transport, &join).await {
            log::warn!("[{}] joinRoom failed: {e}", self.config.room_id);
            let _ = transport.close().await;
            return Served::Lost;
        }
        self.set_state(SessionState::Joined).await;
        self.backoff.reset();

        // `Some` until the room snapshot has been applied.
        let mut awaiting_snapshot: Option<VecDeque<EventEnvelope>> = Some(VecDeque::new());
        let liveness = self.config.liveness_timeout();
        let mut deadline = liveness.map(|d| Instant::now() + d);

        loop {
            let idle = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                control = self.control.recv() => match control {
                    Some(Control::Send(command)) => {
                        if let Err(e) = send_command(&mut transport, &command).await {
                            log::warn!("[{}] {} failed: {e}", self.config.room_id, command.name());
                            let _ = transport.close().await;
                            return Served::Lost;
                        }
                    }
                    Some(Control::Leave) | None => {
                        self.teardown(Some(transport)).await;
                        return Served::Left;
                    }
                },

                frame = transport.recv() => match frame {
                    Some(Ok(text)) => {
                        deadline = liveness.map(|d| Instant::now() + d);
                        if let Some(reason) = self.handle_frame(&text, &mut awaiting_snapshot).await {
                            let _ = transport.close().await;
                            return Served::Rejected(reason);
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("[{}] transport error: {e}", self.config.room_id);
                        let _ = transport.close().await;
                        return Served::Lost;
                    }
                    None => {
                        log::info!("[{}] connection closed by server", self.config.room_id);
                        return Served::Lost;
                    }
                },

                _ = idle => {
                    log::warn!(
                        "[{}] no events for {:?}, reconnecting",
                        self.config.room_id,
                        liveness.unwrap_or_default()
                    );
                    let _ = transport.close().await;
                    return Served::Lost;
                }
            }
        }
    }

    /// Decode and apply one frame. Returns the reason on join rejection.
    async fn handle_frame(
        &mut self,
        text: &str,
        awaiting_snapshot: &mut Option<VecDeque<EventEnvelope>>,
    ) -> Option<String> {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = match decode_inbound(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[{}] dropping frame: {e}", self.config.room_id);
                return None;
            }
        };
        if frame.discarded > 0 {
            self.stats
                .malformed_dropped
                .fetch_add(frame.discarded as u64, Ordering::Relaxed);
        }

        match frame.message {
            Inbound::Race(event @ RaceEvent::RoomSnapshot(_)) => {
                let mut delta = self.apply(EventEnvelope::new(event));
                let buffered = awaiting_snapshot.take().unwrap_or_default();
                let replayed = buffered.len();
                for envelope in buffered {
                    delta.merge(self.apply(envelope));
                }
                self.stats
                    .events_replayed
                    .fetch_add(replayed as u64, Ordering::Relaxed);

                let active = self.store.view().active().len();
                log::info!(
                    "[{}] roster synced: {active} active, {replayed} replayed",
                    self.config.room_id
                );
                self.emit(SessionEvent::Resynced { active, replayed }).await;
                if !delta.is_empty() {
                    self.emit(SessionEvent::RosterChanged(delta)).await;
                }
            }
            Inbound::Race(event) => {
                let envelope = EventEnvelope::new(event);
                if let Some(buffer) = awaiting_snapshot.as_mut() {
                    if buffer.len() >= self.config.snapshot_buffer_capacity {
                        buffer.pop_front();
                        self.stats.buffer_overflow.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "[{}] snapshot buffer full, dropping oldest event",
                            self.config.room_id
                        );
                    }
                    buffer.push_back(envelope);
                    return None;
                }
                let delta = self.apply(envelope);
                if !delta.is_empty() {
                    self.emit(SessionEvent::RosterChanged(delta)).await;
                }
            }
            Inbound::JoinRejected { reason } => return Some(reason),
            Inbound::RaceStarted => self.emit(SessionEvent::RaceStarted).await,
            Inbound::RaceStopped => self.emit(SessionEvent::RaceStopped).await,
        }
        None
    }

    fn apply(&self, envelope: EventEnvelope) -> RosterDelta {
        self.stats.events_applied.fetch_add(1, Ordering::Relaxed);
        self.store.apply_event(envelope)
    }

    async fn emit(&self, event: SessionEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event).await;
    }

    /// Move to `next` unless already there or already terminal.
    async fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::debug!("[{}] state -> {next:?}", self.config.room_id);
            self.emit(SessionEvent::StateChanged(next)).await;
        }
    }

    /// Best-effort `leaveRoom`, close, clear the roster.
    async fn teardown(&mut self, transport: Option<C::Transport>) {
        if let Some(mut transport) = transport {
            let leave = Command::LeaveRoom {
                room_id: self.config.room_id.clone(),
            };
            let goodbye = async {
                if let Err(e) = send_command(&mut transport, &leave).await {
                    log::debug!("[{}] leaveRoom not sent: {e}", self.config.room_id);
                }
                let _ = transport.close().await;
            };
            if tokio::time::timeout(self.config.leave_timeout(), goodbye).await.is_err() {
                log::debug!("[{}] leave did not complete in time", self.config.room_id);
            }
        }

        let delta = self.store.reset();
        self.state.send_if_modified(|current| {
            if *current == SessionState::Rejected || *current == SessionState::Left {
                return false;
            }
            *current = SessionState::Left;
            true
        });
        log::info!("[{}] left room", self.config.room_id);
        if !delta.removed.is_empty() {
            self.emit(SessionEvent::RosterChanged(delta)).await;
        }
        self.emit(SessionEvent::StateChanged(SessionState::Left)).await;
    }

    async fn reject(&mut self, reason: String) -> SessionError {
        log::error!("[{}] join rejected: {reason}", self.config.room_id);
        self.state.send_if_modified(|current| {
            if *current == SessionState::Left || *current == SessionState::Rejected {
                return false;
            }
            *current = SessionState::Rejected;
            true
        });
        let delta = self.store.reset();
        if !delta.removed.is_empty() {
            self.emit(SessionEvent::RosterChanged(delta)).await;
        }
        self.emit(SessionEvent::Rejected {
            reason: reason.clone(),
        })
        .await;
        self.emit(SessionEvent::StateChanged(SessionState::Rejected)).await;
        SessionError::Unauthorized(reason)
    }
}

async fn connect_with_timeout<C: Connector>(
    connector: &C,
    room_id: &str,
    timeout: Duration,
) -> Result<C::Transport, TransportError> {
    match tokio::time::timeout(timeout, connector.connect(room_id)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Drive `fut` to completion unless a leave arrives first.
///
/// Commands received meanwhile are dropped: outbound emission is suspended
/// while not joined.
async fn until_leave<F: Future>(
    control: &mut mpsc::UnboundedReceiver<Control>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            message = control.recv() => match message {
                Some(Control::Send(command)) => {
                    log::debug!("Dropping {} while not joined", command.name());
                }
                Some(Control::Leave) | None => return None,
            },
            output = &mut fut => return Some(output),
        }
    }
}

async fn send_command<T: Transport>(transport: &mut T, command: &Command) -> Result<(), TransportError> {
    match command.encode() {
        Ok(frame) => transport.send(frame).await,
        Err(e) => {
            log::error!("Failed to encode {}: {e}", command.name());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use tokio::time::timeout;

    type Script = Vec<Option<Result<String, TransportError>>>;

    // ── Mock transport ──────────────────────────────────────────────

    /// Replays a scripted connection, then hangs. A `None` entry closes it.
    struct MockTransport {
        incoming: VecDeque<Option<Result<String, TransportError>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            match self.incoming.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Hands out one scripted outcome per connect attempt.
    struct MockConnector {
        attempts: StdMutex<VecDeque<Result<Script, TransportError>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    impl MockConnector {
        fn new(attempts: Vec<Result<Script, TransportError>>) -> Self {
            Self {
                attempts: StdMutex::new(attempts.into()),
                sent: Arc::new(StdMutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
                connects: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&self, _room_id: &str) -> Result<MockTransport, TransportError> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            let next = self.attempts.lock().unwrap().pop_front();
            match next {
                Some(Ok(script)) => Ok(MockTransport {
                    incoming: script.into(),
                    sent: Arc::clone(&self.sent),
                    closed: Arc::clone(&self.closed),
                }),
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Connect("no scripted connection".into())),
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn frame(event: &str, data: Value) -> Option<Result<String, TransportError>> {
        Some(Ok(json!({ "event": event, "data": data }).to_string()))
    }

    fn snapshot(ids: &[&str]) -> Option<Result<String, TransportError>> {
        let records: Vec<Value> = ids.iter().map(|id| json!({ "id": id, "name": id })).collect();
        frame("roomSnapshot", Value::Array(records))
    }

    fn racer() -> Identity {
        Identity::new("me", "Observer", Role::Racer)
    }

    struct Harness {
        handle: SessionHandle,
        events: mpsc::Receiver<SessionEvent>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    fn start_with(
        config: SessionConfig,
        identity: Identity,
        attempts: Vec<Result<Script, TransportError>>,
    ) -> Harness {
        let connector = MockConnector::new(attempts);
        let sent = Arc::clone(&connector.sent);
        let closed = Arc::clone(&connector.closed);
        let connects = Arc::clone(&connector.connects);
        let store = Arc::new(RosterStore::new(config.room_id.clone()));
        let (handle, events) = RaceSession::spawn(config, identity, connector, store);
        Harness {
            handle,
            events,
            sent,
            closed,
            connects,
        }
    }

    fn start(attempts: Vec<Result<Script, TransportError>>) -> Harness {
        start_with(SessionConfig::for_testing("ws://mock", "race-1"), racer(), attempts)
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<SessionEvent>,
        mut pred: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("session ended before expected event"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    fn sent_commands(sent: &Arc<StdMutex<Vec<String>>>) -> Vec<String> {
        sent.lock()
            .unwrap()
            .iter()
            .map(|frame| {
                let value: Value = serde_json::from_str(frame).unwrap();
                value["command"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn is_resync(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::Resynced { .. })
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_buffers_events_until_snapshot() {
        let mut h = start(vec![Ok(vec![
            frame("locationUpdate", json!({"id": "u1", "lat": 7.1, "lng": 125.6})),
            frame("join", json!({"id": "u9", "name": "Late"})),
            snapshot(&["u1", "u2"]),
        ])]);

        let event = wait_for(&mut h.events, is_resync).await;
        assert_eq!(event, SessionEvent::Resynced { active: 3, replayed: 2 });

        let roster = h.handle.store().view();
        let u1 = roster.get("u1").unwrap();
        assert_eq!(u1.state.position.unwrap().lat, 7.1);
        assert!(roster.is_active("u2"));
        assert!(roster.is_active("u9"));
        assert_eq!(h.handle.state(), SessionState::Joined);
        assert_eq!(sent_commands(&h.sent), vec!["joinRoom"]);
        assert_eq!(h.handle.stats().events_replayed, 2);
    }

    #[tokio::test]
    async fn test_replayed_join_keeps_snapshot_identity() {
        let mut h = start(vec![Ok(vec![
            frame("join", json!({"id": "u1"})),
            frame("roomSnapshot", json!([{"id": "u1", "name": "Ann", "bib": 12}])),
        ])]);

        let event = wait_for(&mut h.events, is_resync).await;
        assert_eq!(event, SessionEvent::Resynced { active: 1, replayed: 1 });
        let roster = h.handle.store().view();
        let identity = &roster.get("u1").unwrap().identity;
        assert_eq!(identity.name, "Ann");
        assert_eq!(identity.bib, Some(12));
    }

    #[tokio::test]
    async fn test_join_command_carries_identity() {
        let mut h = start(vec![Ok(vec![snapshot(&[])])]);
        wait_for(&mut h.events, is_resync).await;

        let frame: Value = serde_json::from_str(&h.sent.lock().unwrap()[0]).unwrap();
        assert_eq!(frame["data"]["roomId"], "race-1");
        assert_eq!(frame["data"]["identity"]["id"], "me");
        assert_eq!(frame["data"]["identity"]["role"], "racer");
    }

    #[tokio::test]
    async fn test_live_events_after_snapshot_apply_directly() {
        let mut h = start(vec![Ok(vec![
            snapshot(&["u1"]),
            frame("locationUpdate", json!({"id": "u1", "lat": 1.0, "lng": 2.0})),
            frame("finish", json!({"id": "u1"})),
        ])]);

        let event = wait_for(&mut h.events, |e| {
            matches!(e, SessionEvent::RosterChanged(d) if !d.finished.is_empty())
        })
        .await;
        assert_eq!(
            event,
            SessionEvent::RosterChanged(RosterDelta {
                finished: vec!["u1".into()],
                ..RosterDelta::default()
            })
        );
        let roster = h.handle.store().view();
        assert!(roster.is_finished("u1"));
        assert_eq!(roster.get("u1").unwrap().state.position.unwrap().lng, 2.0);
    }

    #[tokio::test]
    async fn test_reconnect_resends_join_and_resyncs() {
        let mut h = start(vec![
            Ok(vec![snapshot(&["u1", "u2"]), None]),
            Ok(vec![snapshot(&["u3"])]),
        ]);

        wait_for(&mut h.events, is_resync).await;
        wait_for(&mut h.events, |e| *e == SessionEvent::StateChanged(SessionState::Reconnecting))
            .await;
        let event = wait_for(&mut h.events, is_resync).await;
        assert_eq!(event, SessionEvent::Resynced { active: 1, replayed: 0 });

        let roster = h.handle.store().view();
        assert_eq!(roster.active().keys().collect::<Vec<_>>(), vec!["u3"]);
        assert_eq!(sent_commands(&h.sent), vec!["joinRoom", "joinRoom"]);
        assert_eq!(h.handle.stats().reconnects, 1);
        assert_eq!(h.handle.state(), SessionState::Joined);
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried() {
        let mut h = start(vec![
            Err(TransportError::Connect("refused".into())),
            Err(TransportError::Timeout),
            Ok(vec![snapshot(&["u1"])]),
        ]);

        wait_for(&mut h.events, is_resync).await;
        assert_eq!(h.connects.load(Ordering::Relaxed), 3);
        assert_eq!(h.handle.stats().reconnects, 2);
    }

    #[tokio::test]
    async fn test_finished_survive_reconnect_snapshot() {
        let mut h = start(vec![
            Ok(vec![snapshot(&["u1", "u2"]), frame("finish", json!({"id": "u1"})), None]),
            Ok(vec![snapshot(&["u1", "u2"])]),
        ]);

        wait_for(&mut h.events, is_resync).await;
        let event = wait_for(&mut h.events, is_resync).await;
        assert_eq!(event, SessionEvent::Resynced { active: 1, replayed: 0 });
        let roster = h.handle.store().view();
        assert!(roster.is_finished("u1"));
        assert!(!roster.is_active("u1"));
    }

    #[tokio::test]
    async fn test_rejection_frame_is_fatal() {
        let mut h = start(vec![Ok(vec![
            snapshot(&["u1"]),
            frame("joinRejected", json!({"reason": "race is private"})),
        ])]);

        let event = wait_for(&mut h.events, |e| matches!(e, SessionEvent::Rejected { .. })).await;
        assert_eq!(event, SessionEvent::Rejected { reason: "race is private".into() });

        let store = Arc::clone(h.handle.store());
        let result = timeout(Duration::from_secs(1), h.handle.closed()).await.unwrap();
        assert_eq!(result, Err(SessionError::Unauthorized("race is private".into())));
        assert!(store.view().is_empty());
        assert!(h.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_not_retried() {
        let h = start(vec![
            Err(TransportError::Unauthorized("401".into())),
            Ok(vec![snapshot(&["u1"])]),
        ]);

        let state = h.handle.watch_state();
        let result = timeout(Duration::from_secs(1), h.handle.closed()).await.unwrap();
        assert_eq!(result, Err(SessionError::Unauthorized("401".into())));
        assert_eq!(*state.borrow(), SessionState::Rejected);
        assert_eq!(h.connects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_during_backoff_is_prompt() {
        let mut config = SessionConfig::for_testing("ws://mock", "race-1");
        config.reconnect.initial_ms = 60_000;
        config.reconnect.max_ms = 60_000;
        let started = Instant::now();
        let mut h = start_with(config, racer(), vec![Err(TransportError::Connect("down".into()))]);

        wait_for(&mut h.events, |e| *e == SessionEvent::StateChanged(SessionState::Reconnecting))
            .await;
        h.handle.leave();
        assert_eq!(h.handle.state(), SessionState::Left);

        let result = timeout(Duration::from_secs(1), h.handle.closed()).await;
        assert_eq!(result, Ok(Ok(())));
        assert_eq!(h.connects.load(Ordering::Relaxed), 1);
        // The backoff sleep was cancelled, not waited out.
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_leave_sends_leave_room_and_clears_roster() {
        let mut h = start(vec![Ok(vec![snapshot(&["u1", "u2"])])]);
        wait_for(&mut h.events, is_resync).await;

        h.handle.leave();
        let event = wait_for(&mut h.events, |e| {
            matches!(e, SessionEvent::RosterChanged(d) if d.replaced && !d.removed.is_empty())
        })
        .await;
        match event {
            SessionEvent::RosterChanged(delta) => assert_eq!(delta.removed.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        wait_for(&mut h.events, |e| *e == SessionEvent::StateChanged(SessionState::Left)).await;

        let store = Arc::clone(h.handle.store());
        assert_eq!(h.handle.closed().await, Ok(()));
        assert!(store.view().is_empty());
        assert_eq!(sent_commands(&h.sent), vec!["joinRoom", "leaveRoom"]);
        assert!(h.closed.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timeout_reconnects() {
        let config = SessionConfig::for_testing("ws://mock", "race-1")
            .with_liveness_timeout(Some(Duration::from_millis(50)));
        let started = Instant::now();
        let mut h = start_with(
            config,
            racer(),
            vec![Ok(vec![snapshot(&["u1"])]), Ok(vec![snapshot(&["u2"])])],
        );

        wait_for(&mut h.events, is_resync).await;
        wait_for(&mut h.events, is_resync).await;
        assert_eq!(h.connects.load(Ordering::Relaxed), 2);
        assert!(h.handle.store().view().is_active("u2"));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_counted_and_dropped() {
        let mut h = start(vec![Ok(vec![
            Some(Ok("garbage".to_string())),
            snapshot(&["u1"]),
            frame("locationUpdate", json!({"id": "u1", "lat": "north", "lng": 1.0})),
            frame("roomSnapshot", json!([{"id": "u1"}, {"name": "no id"}])),
            frame("finish", json!({"id": "u1"})),
        ])]);

        wait_for(&mut h.events, |e| {
            matches!(e, SessionEvent::RosterChanged(d) if !d.finished.is_empty())
        })
        .await;
        let stats = h.handle.stats();
        assert_eq!(stats.malformed_dropped, 3);
        assert_eq!(stats.frames_received, 5);
        assert!(h.handle.store().view().is_finished("u1"));
    }

    #[tokio::test]
    async fn test_snapshot_buffer_overflow_drops_oldest() {
        let config =
            SessionConfig::for_testing("ws://mock", "race-1").with_snapshot_buffer_capacity(2);
        let mut h = start_with(
            config,
            racer(),
            vec![Ok(vec![
                frame("join", json!({"id": "a"})),
                frame("join", json!({"id": "b"})),
                frame("join", json!({"id": "c"})),
                snapshot(&[]),
            ])],
        );

        let event = wait_for(&mut h.events, is_resync).await;
        assert_eq!(event, SessionEvent::Resynced { active: 2, replayed: 2 });
        let roster = h.handle.store().view();
        assert!(!roster.is_active("a"));
        assert!(roster.is_active("b") && roster.is_active("c"));
        assert_eq!(h.handle.stats().buffer_overflow, 1);
    }

    #[tokio::test]
    async fn test_race_commands_require_admin() {
        let mut h = start(vec![Ok(vec![snapshot(&[])])]);
        wait_for(&mut h.events, is_resync).await;
        assert_eq!(h.handle.start_race(), Err(SessionError::NotPermitted("startRace")));
        assert_eq!(h.handle.stop_race(), Err(SessionError::NotPermitted("stopRace")));
    }

    #[tokio::test]
    async fn test_admin_race_commands_and_signals() {
        let admin = Identity::new("boss", "Race Control", Role::Admin);
        let mut h = start_with(
            SessionConfig::for_testing("ws://mock", "race-1"),
            admin,
            vec![Ok(vec![snapshot(&[]), frame("raceStarted", Value::Null)])],
        );

        wait_for(&mut h.events, |e| *e == SessionEvent::RaceStarted).await;
        h.handle.start_race().unwrap();

        timeout(Duration::from_secs(1), async {
            while !sent_commands(&h.sent).contains(&"startRace".to_string()) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("startRace was never sent");
    }

    #[tokio::test]
    async fn test_commands_suspended_while_not_joined() {
        let mut config = SessionConfig::for_testing("ws://mock", "race-1");
        config.reconnect.initial_ms = 60_000;
        config.reconnect.max_ms = 60_000;
        let admin = Identity::new("boss", "Race Control", Role::Admin);
        let mut h = start_with(config, admin, vec![Err(TransportError::Connect("down".into()))]);

        wait_for(&mut h.events, |e| *e == SessionEvent::StateChanged(SessionState::Reconnecting))
            .await;
        assert!(h.handle.is_reconnecting());
        assert_eq!(h.handle.start_race(), Err(SessionError::Suspended("startRace")));

        h.handle.leave();
        assert_eq!(h.handle.stop_race(), Err(SessionError::Closed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Left.is_terminal());
        assert!(SessionState::Rejected.is_terminal());
        assert!(!SessionState::Reconnecting.is_terminal());
        assert!(!SessionState::Disconnected.is_terminal());
    }
}
