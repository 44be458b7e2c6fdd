//! Per-connection session state
//!
//! A `Connection` is one accepted socket upgraded to WebSocket. Its session
//! moves through Handshaking → Open → Closing → Closed; every transition is
//! published on a watch channel so the connection's tasks wake up promptly.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::message::Message;
use super::queue::{Enqueued, OutboundQueue, OverflowPolicy, QueueError};
use super::{HubError, HubResult};

/// Generation-checked session identifier
///
/// `index` addresses a slot in the registry arena; `generation` is bumped
/// every time that slot is vacated, so an id held after its session closed
/// can never resolve to a newer connection in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the registry arena
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at allocation time
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Packed wire form: generation in the high half, index in the low half
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl From<SessionId> for u64 {
    fn from(id: SessionId) -> Self {
        id.as_u64()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Socket accepted, WebSocket upgrade in progress
    Handshaking,
    /// Upgrade complete; the only state that accepts outbound messages
    Open,
    /// Draining the outbound queue before the close frame
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Handshaking, Open)
                | (Open, Closing)
                | (Closing, Closed)
                | (Handshaking, Closed)
                | (Open, Closed)
        )
    }

    /// Validate a transition, returning the new state
    pub fn transition(self, next: SessionState) -> HubResult<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(HubError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session left the Open state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame
    PeerClosed,
    /// Closed by the application layer
    Application,
    /// No heartbeat within the liveness window
    LivenessTimeout,
    /// Outbound queue exceeded its capacity
    QueueOverflow,
    /// Server is shutting down
    Shutdown,
    /// WebSocket upgrade or authentication failed
    HandshakeFailed(String),
    /// Socket error or reset; no graceful drain
    Transport(String),
}

impl CloseReason {
    /// Abrupt closes skip draining and the close frame
    pub fn is_abrupt(&self) -> bool {
        matches!(
            self,
            CloseReason::Transport(_) | CloseReason::HandshakeFailed(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Application => f.write_str("closed by application"),
            CloseReason::LivenessTimeout => f.write_str("liveness timeout"),
            CloseReason::QueueOverflow => f.write_str("outbound queue overflow"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
            CloseReason::HandshakeFailed(detail) => write!(f, "handshake failed: {}", detail),
            CloseReason::Transport(detail) => write!(f, "transport error: {}", detail),
        }
    }
}

/// One live connection and its session
pub struct Connection {
    id: SessionId,
    remote: SocketAddr,
    created_at: SystemTime,
    state: watch::Sender<SessionState>,
    close_reason: OnceLock<CloseReason>,
    last_activity: Mutex<Instant>,
    closing_since: Mutex<Option<Instant>>,
    queue: OutboundQueue,
}

impl Connection {
    /// Create a connection in the Handshaking state
    pub fn new(
        id: SessionId,
        remote: SocketAddr,
        queue_capacity: usize,
        overflow_policy: OverflowPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Handshaking);
        Self {
            id,
            remote,
            created_at: SystemTime::now(),
            state,
            close_reason: OnceLock::new(),
            last_activity: Mutex::new(Instant::now()),
            closing_since: Mutex::new(None),
            queue: OutboundQueue::new(queue_capacity, overflow_policy),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Reason the session is closing, once one has been recorded
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    /// Number of messages waiting to be written
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Record inbound activity (any frame from the peer)
    pub fn touch(&self, at: Instant) {
        let mut last = self.last_activity.lock();
        if at > *last {
            *last = at;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last inbound activity, as seen at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Time spent in the Closing state, as seen at `now`
    pub fn closing_for(&self, now: Instant) -> Option<Duration> {
        self.closing_since
            .lock()
            .map(|since| now.saturating_duration_since(since))
    }

    /// Enqueue a message for the writer task
    ///
    /// The state check and the enqueue happen under the state read guard,
    /// so a message is never queued once the session has left Open.
    pub fn send(&self, message: Arc<Message>) -> HubResult<Enqueued> {
        let state = self.state.borrow();
        if *state != SessionState::Open {
            return Err(HubError::SessionNotOpen {
                id: self.id,
                state: *state,
            });
        }
        match self.queue.push(message) {
            Ok(outcome) => Ok(outcome),
            Err(QueueError::Full) => Err(HubError::QueueOverflow(self.id)),
            Err(QueueError::Closed) => Err(HubError::SessionNotOpen {
                id: self.id,
                state: *state,
            }),
        }
    }

    /// Next message for the writer; `None` once closed and drained
    pub async fn next_outbound(&self) -> Option<Arc<Message>> {
        self.queue.pop().await
    }

    /// Take everything currently queued without waiting
    #[cfg(test)]
    pub(crate) fn drain_outbound(&self) -> Vec<Arc<Message>> {
        std::iter::from_fn(|| self.queue.try_pop()).collect()
    }

    /// Handshaking → Open
    pub(crate) fn mark_open(&self, now: Instant) -> HubResult<()> {
        self.transition(SessionState::Open)?;
        self.touch(now);
        Ok(())
    }

    /// Open → Closing. Returns false if the session was not Open.
    pub(crate) fn start_closing(&self, reason: CloseReason, now: Instant) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if started {
            let _ = self.close_reason.set(reason);
            *self.closing_since.lock() = Some(now);
            self.queue.close();
        }
        started
    }

    /// Any non-terminal state → Closed. Returns false if already Closed.
    pub(crate) fn mark_closed(&self, reason: CloseReason) -> bool {
        let _ = self.close_reason.set(reason);
        let closed = self.state.send_if_modified(|state| {
            if state.can_transition_to(SessionState::Closed) {
                *state = SessionState::Closed;
                true
            } else {
                false
            }
        });
        self.queue.close();
        closed
    }

    fn transition(&self, next: SessionState) -> HubResult<SessionState> {
        let mut outcome = Ok(next);
        self.state.send_if_modified(|state| {
            let previous = *state;
            outcome = state.transition(next).map(|_| previous);
            if outcome.is_ok() {
                *state = next;
            }
            outcome.is_ok()
        });
        outcome
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(
            SessionId::new(0, 0),
            "127.0.0.1:4000".parse().unwrap(),
            4,
            OverflowPolicy::Close,
        )
    }

    #[test]
    fn test_session_id_wire_form() {
        let id = SessionId::new(7, 3);
        assert_eq!(id.as_u64(), (3u64 << 32) | 7);
        assert_eq!(SessionId::from(id.as_u64()), id);
        assert_eq!(serde_json::to_string(&id).unwrap(), id.as_u64().to_string());
        assert_eq!(id.to_string(), "7:3");
    }

    #[test]
    fn test_state_machine_transitions() {
        use SessionState::*;
        assert!(Handshaking.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Handshaking.can_transition_to(Closing));

        let err = Closed.transition(Open).unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition { .. }));
    }

    #[test]
    fn test_send_requires_open() {
        let conn = connection();
        let msg = Arc::new(Message::text("early"));
        let err = conn.send(Arc::clone(&msg)).unwrap_err();
        assert!(matches!(
            err,
            HubError::SessionNotOpen {
                state: SessionState::Handshaking,
                ..
            }
        ));

        conn.mark_open(Instant::now()).unwrap();
        assert!(conn.send(msg).is_ok());
        assert_eq!(conn.queued(), 1);
    }

    #[test]
    fn test_start_closing_records_first_reason() {
        let conn = connection();
        conn.mark_open(Instant::now()).unwrap();

        assert!(conn.start_closing(CloseReason::LivenessTimeout, Instant::now()));
        assert!(!conn.start_closing(CloseReason::Application, Instant::now()));
        assert_eq!(conn.state(), SessionState::Closing);
        assert_eq!(conn.close_reason(), Some(&CloseReason::LivenessTimeout));

        let err = conn.send(Arc::new(Message::text("late"))).unwrap_err();
        assert!(matches!(err, HubError::SessionNotOpen { .. }));
    }

    #[test]
    fn test_mark_closed_is_terminal() {
        let conn = connection();
        conn.mark_open(Instant::now()).unwrap();
        assert!(conn.mark_closed(CloseReason::Transport("reset".into())));
        assert!(!conn.mark_closed(CloseReason::Application));
        assert_eq!(conn.state(), SessionState::Closed);
        assert!(conn.close_reason().unwrap().is_abrupt());
    }

    #[test]
    fn test_idle_tracking() {
        let conn = connection();
        let start = Instant::now();
        conn.touch(start);
        let later = start + Duration::from_secs(10);
        assert!(conn.idle_for(later) >= Duration::from_secs(10));
        conn.touch(later);
        assert_eq!(conn.idle_for(later), Duration::ZERO);
        // Older timestamps never move activity backwards
        conn.touch(start);
        assert_eq!(conn.last_activity(), later);
    }

    #[tokio::test]
    async fn test_closing_unblocks_writer() {
        let conn = Arc::new(connection());
        conn.mark_open(Instant::now()).unwrap();
        conn.send(Arc::new(Message::text("last"))).unwrap();

        let writer = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut drained = Vec::new();
                while let Some(msg) = conn.next_outbound().await {
                    drained.push(msg);
                }
                drained
            })
        };

        conn.start_closing(CloseReason::Application, Instant::now());
        let drained = writer.await.unwrap();
        assert_eq!(drained.len(), 1);
    }
}
