//! Session hub
//!
//! Owns the connection registry and the group index behind a single lock,
//! and is the only path through which sessions appear, change state, or
//! disappear. Routing snapshots targets under the read lock and enqueues
//! after releasing it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::message::{Control, Message, Payload, Scope};
use super::queue::OverflowPolicy;
use super::registry::Registry;
use super::router::{self, DeliveryReport, Groups};
use super::session::{CloseReason, Connection, SessionId, SessionState};
use super::{HubError, HubResult};

/// Tunables for the hub
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Per-connection outbound queue capacity
    pub queue_capacity: usize,
    /// What to do when an outbound queue is full
    pub overflow_policy: OverflowPolicy,
    /// Maximum silence from a peer before its session is closed
    pub liveness_timeout: Duration,
    /// How long a Closing session may drain before it is forced Closed
    pub close_grace: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::Close,
            liveness_timeout: Duration::from_secs(45),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle events broadcast by the hub
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Handshake complete, session Open
    Connected { id: SessionId, remote: SocketAddr },
    /// Session entered Closing
    Closing { id: SessionId, reason: CloseReason },
    /// Session Closed and removed from the registry
    Closed { id: SessionId, reason: CloseReason },
}

/// Sessions touched by one liveness sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open sessions moved to Closing for missing their heartbeat
    pub timed_out: Vec<SessionId>,
    /// Closing sessions forced Closed after the grace period
    pub finalized: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.finalized.is_empty()
    }
}

struct HubState {
    registry: Registry,
    groups: Groups,
}

pub struct Hub {
    state: RwLock<HubState>,
    settings: HubSettings,
    event_tx: broadcast::Sender<HubEvent>,
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(HubState {
                registry: Registry::new(),
                groups: Groups::new(),
            }),
            settings,
            event_tx,
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }

    /// Number of registered sessions (any state but Closed)
    pub fn session_count(&self) -> usize {
        self.state.read().registry.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a freshly accepted socket in the Handshaking state
    pub fn admit(&self, remote: SocketAddr) -> HubResult<Arc<Connection>> {
        let mut state = self.state.write();
        let id = state.registry.allocate();
        let connection = Arc::new(Connection::new(
            id,
            remote,
            self.settings.queue_capacity,
            self.settings.overflow_policy,
        ));
        if let Err(e) = state.registry.register(Arc::clone(&connection)) {
            error!("Failed to register connection from {}: {}", remote, e);
            state.registry.unregister(id);
            return Err(e);
        }
        debug!("Admitted {} as session {}", remote, id);
        Ok(connection)
    }

    /// Handshaking → Open
    pub fn open(&self, id: SessionId) -> HubResult<Arc<Connection>> {
        let connection = self.lookup(id)?;
        if let Err(e) = connection.mark_open(Instant::now()) {
            log_rejected("open", id, &e);
            return Err(e);
        }
        info!("Session {} open ({})", id, connection.remote());
        let _ = self.event_tx.send(HubEvent::Connected {
            id,
            remote: connection.remote(),
        });
        Ok(connection)
    }

    /// Start a graceful close
    ///
    /// Open sessions move to Closing and their queue stops accepting new
    /// messages. A session still handshaking has nothing to drain and is
    /// finalized directly. Returns false if the session was not found or
    /// was already closing.
    pub fn begin_close(&self, id: SessionId, reason: CloseReason) -> bool {
        self.begin_close_at(id, reason, Instant::now())
    }

    fn begin_close_at(&self, id: SessionId, reason: CloseReason, now: Instant) -> bool {
        let Ok(connection) = self.lookup(id) else {
            return false;
        };
        match connection.state() {
            SessionState::Handshaking => self.finalize(id, reason).is_some(),
            SessionState::Open => {
                if !connection.start_closing(reason.clone(), now) {
                    return false;
                }
                info!("Session {} closing: {}", id, reason);
                let _ = self.event_tx.send(HubEvent::Closing { id, reason });
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Mark a session Closed and remove it from the registry and groups
    ///
    /// Both happen under the write lock, so no lookup ever observes a Closed
    /// session. Idempotent: returns `None` if the session was already gone.
    pub fn finalize(&self, id: SessionId, reason: CloseReason) -> Option<Arc<Connection>> {
        let connection = {
            let mut state = self.state.write();
            let connection = state.registry.unregister(id)?;
            state.groups.remove_session(id);
            connection.mark_closed(reason.clone());
            connection
        };
        let reason = connection.close_reason().cloned().unwrap_or(reason);
        if let CloseReason::Transport(detail) = &reason {
            warn!("Session {} dropped: {}", id, HubError::Transport(detail.clone()));
        }
        info!("Session {} closed: {}", id, reason);
        let _ = self.event_tx.send(HubEvent::Closed { id, reason });
        Some(connection)
    }

    /// Move every session toward Closed with `CloseReason::Shutdown`
    pub fn shutdown_all(&self) -> usize {
        let connections = self.connections();
        info!("Closing {} sessions for shutdown", connections.len());
        connections
            .iter()
            .filter(|connection| self.begin_close(connection.id(), CloseReason::Shutdown))
            .count()
    }

    /// Enforce liveness and the close grace period as of `now`
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for connection in self.connections() {
            let id = connection.id();
            match connection.state() {
                SessionState::Open => {
                    if connection.idle_for(now) > self.settings.liveness_timeout {
                        warn!("{}", HubError::LivenessTimeout(id));
                        if self.begin_close_at(id, CloseReason::LivenessTimeout, now) {
                            report.timed_out.push(id);
                        }
                    }
                }
                SessionState::Closing => {
                    let expired = connection
                        .closing_for(now)
                        .is_some_and(|elapsed| elapsed >= self.settings.close_grace);
                    if expired {
                        let reason = connection
                            .close_reason()
                            .cloned()
                            .unwrap_or(CloseReason::Application);
                        if self.finalize(id, reason).is_some() {
                            debug!("Session {} finalized after close grace", id);
                            report.finalized.push(id);
                        }
                    }
                }
                SessionState::Handshaking | SessionState::Closed => {}
            }
        }
        report
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn lookup(&self, id: SessionId) -> HubResult<Arc<Connection>> {
        self.state.read().registry.lookup(id)
    }

    /// Snapshot of all registered connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.read().registry.enumerate().collect()
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Subscribe an Open session to a group
    pub fn join(&self, id: SessionId, group: &str) -> HubResult<bool> {
        let mut state = self.state.write();
        let connection = state.registry.lookup(id)?;
        let current = connection.state();
        if current != SessionState::Open {
            let err = HubError::SessionNotOpen { id, state: current };
            log_rejected("join", id, &err);
            return Err(err);
        }
        let added = state.groups.join(group, id);
        if added {
            debug!("Session {} joined group {}", id, group);
        }
        Ok(added)
    }

    pub fn leave(&self, id: SessionId, group: &str) -> bool {
        self.state.write().groups.leave(group, id)
    }

    pub fn members(&self, group: &str) -> Vec<SessionId> {
        self.state.read().groups.members(group)
    }

    pub fn groups_of(&self, id: SessionId) -> Vec<String> {
        self.state.read().groups.groups_of(id)
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Route a scoped message
    ///
    /// Unicast fails with `TargetNotFound` for unknown ids, `SessionNotOpen`
    /// for targets that are no longer Open, and `QueueOverflow` when the
    /// target's queue is full. Fan-out never fails on individual targets;
    /// the report says what happened. Overflowing targets are closed.
    pub fn dispatch(&self, message: Message) -> HubResult<DeliveryReport> {
        let scope = message.scope().cloned().ok_or(HubError::Unroutable)?;
        let targets = {
            let state = self.state.read();
            router::resolve_targets(&state.registry, &state.groups, &scope, message.sender())?
        };

        match message.payload() {
            Payload::Text(_) | Payload::Binary(_) => {}
            Payload::Control(Control::Close(reason)) => {
                let mut report = DeliveryReport::default();
                for target in &targets {
                    if self.begin_close(target.id(), reason.clone()) {
                        report.delivered += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                return Ok(report);
            }
            Payload::Control(Control::Ping(_)) | Payload::Control(Control::Pong(_)) => {
                debug!("Ping/pong is connection-local, not routing");
                return Ok(DeliveryReport::default());
            }
        }

        let report = router::deliver(&targets, Arc::new(message));
        for id in &report.overflowed {
            warn!("{}", HubError::QueueOverflow(*id));
            self.begin_close(*id, CloseReason::QueueOverflow);
        }

        if let Scope::Session(target) = scope {
            if let Some(id) = report.overflowed.first() {
                return Err(HubError::QueueOverflow(*id));
            }
            if report.delivered == 0 {
                let state = targets
                    .first()
                    .map(|connection| connection.state())
                    .unwrap_or(SessionState::Closed);
                let err = HubError::SessionNotOpen { id: target, state };
                log_rejected("unicast", target, &err);
                return Err(err);
            }
        }
        Ok(report)
    }

    /// Send to one session
    pub fn unicast(
        &self,
        from: Option<SessionId>,
        to: SessionId,
        payload: Payload,
    ) -> HubResult<DeliveryReport> {
        self.dispatch(addressed(payload, from, Scope::Session(to)))
    }

    /// Send to every Open member of a group
    pub fn publish(
        &self,
        from: Option<SessionId>,
        group: &str,
        payload: Payload,
    ) -> HubResult<DeliveryReport> {
        self.dispatch(addressed(payload, from, Scope::Group(group.to_string())))
    }

    /// Send to every Open session, optionally including the sender
    pub fn broadcast(
        &self,
        from: Option<SessionId>,
        payload: Payload,
        include_sender: bool,
    ) -> HubResult<DeliveryReport> {
        self.dispatch(addressed(payload, from, Scope::Broadcast { include_sender }))
    }
}

fn addressed(payload: Payload, from: Option<SessionId>, scope: Scope) -> Message {
    let message = Message::new(payload).to(scope);
    match from {
        Some(sender) => message.from_session(sender),
        None => message,
    }
}

/// Contract violations are logged at warn, operational misses at debug
fn log_rejected(operation: &str, id: SessionId, err: &HubError) {
    if err.is_contract_violation() {
        warn!("Session {} {} rejected: {}", id, operation, err);
    } else {
        debug!("Session {} {} rejected: {}", id, operation, err);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubSettings::default())
    }
}
