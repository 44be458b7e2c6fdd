//! Two-player lobby
//!
//! Players queue with `join` and are paired first-come first-served into a
//! room, which is a hub group. The first player of a pair plays white and
//! moves first. Moves are relayed to the whole room in turn order after the
//! room's [`GameRules`] accept them; chess is the default. Both players
//! voting `replay` restarts the room. `quit` dissolves the room and puts the
//! opponent back in the queue; a disconnect dissolves it without requeueing.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{publish_json, send_json, Application, ChessRules};
use crate::hub::{CloseReason, Hub, Message, Payload, SessionId};
use crate::server::{ErrorCode, PROTOCOL_VERSION};

// ============================================================================
// Wire Messages
// ============================================================================

/// Requests sent by lobby clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyRequest {
    /// Enter the waiting queue
    Join,
    /// Play a move; its shape is up to the game rules
    Move { mv: Value },
    /// Vote to restart the current room
    Replay,
    /// Leave the current room
    Quit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// Side to move at a given ply
    pub fn to_move(ply: usize) -> Self {
        if ply % 2 == 0 {
            Color::White
        } else {
            Color::Black
        }
    }
}

/// Events sent by the lobby
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyEvent {
    Welcome {
        version: u32,
        session_id: SessionId,
    },
    /// Queued, waiting for an opponent
    Waiting,
    /// Paired into a room
    Start {
        room: String,
        color: Color,
        opponent: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        fen: Option<String>,
    },
    /// A move accepted in the room
    Move {
        room: String,
        color: Color,
        ply: usize,
        mv: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        fen: Option<String>,
    },
    /// The sender's move was refused
    Invalid {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mv: Option<Value>,
    },
    /// The rules ended the game
    GameOver { room: String, result: String },
    /// Both players voted to replay; the room restarts at ply 0
    ReplayStart {
        room: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fen: Option<String>,
    },
    /// One player quit or disconnected; the room is gone
    OpponentLeft { room: String },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

impl LobbyEvent {
    fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        LobbyEvent::Error {
            message: message.into(),
            code: Some(code),
        }
    }
}

// ============================================================================
// Game Rules
// ============================================================================

/// Outcome of playing a move
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveVerdict {
    /// Legal; the game continues
    Accept,
    /// Illegal; the reason goes back to the mover
    Reject(String),
    /// Legal and final; the result is announced to the room
    Finish(String),
}

/// Rules for the games played in lobby rooms
pub trait GameRules: Send + Sync + 'static {
    /// A game at its starting position
    fn new_game(&self) -> Box<dyn Game>;
}

/// One game in progress
///
/// The lobby enforces turn order before calling [`Game::play`].
pub trait Game: Send {
    /// Apply `mv` for `color` unless the verdict is `Reject`
    fn play(&mut self, color: Color, mv: &Value) -> MoveVerdict;

    /// Current position sent to clients, if the rules have one
    fn position(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Lobby State
// ============================================================================

struct Room {
    white: SessionId,
    black: SessionId,
    game: Box<dyn Game>,
    ply: usize,
    finished: bool,
    replay_votes: HashSet<SessionId>,
}

impl Room {
    fn new(white: SessionId, black: SessionId, game: Box<dyn Game>) -> Self {
        Self {
            white,
            black,
            game,
            ply: 0,
            finished: false,
            replay_votes: HashSet::new(),
        }
    }

    fn color_of(&self, id: SessionId) -> Color {
        if id == self.white {
            Color::White
        } else {
            Color::Black
        }
    }

    fn opponent_of(&self, id: SessionId) -> SessionId {
        if id == self.white {
            self.black
        } else {
            self.white
        }
    }

    fn restart(&mut self, game: Box<dyn Game>) {
        self.game = game;
        self.ply = 0;
        self.finished = false;
        self.replay_votes.clear();
    }
}

#[derive(Default)]
struct LobbyState {
    waiting: VecDeque<SessionId>,
    rooms: HashMap<String, Room>,
    seats: HashMap<SessionId, String>,
}

impl LobbyState {
    fn is_queued(&self, id: SessionId) -> bool {
        self.waiting.contains(&id)
    }

    /// Remove a room and both seats; returns the players
    fn dissolve(&mut self, room: &str) -> Option<Room> {
        let removed = self.rooms.remove(room)?;
        self.seats.remove(&removed.white);
        self.seats.remove(&removed.black);
        Some(removed)
    }
}

fn room_name(white: SessionId, black: SessionId) -> String {
    format!("room_{}_{}", white.as_u64(), black.as_u64())
}

pub struct LobbyApp {
    state: Mutex<LobbyState>,
    rules: Box<dyn GameRules>,
}

impl LobbyApp {
    /// Lobby playing chess
    pub fn new() -> Self {
        Self::with_rules(ChessRules)
    }

    pub fn with_rules(rules: impl GameRules) -> Self {
        Self {
            state: Mutex::new(LobbyState::default()),
            rules: Box::new(rules),
        }
    }

    /// Number of players waiting for an opponent
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Number of active rooms
    pub fn rooms(&self) -> usize {
        self.state.lock().rooms.len()
    }

    /// Room the session is seated in, if any
    pub fn room_of(&self, id: SessionId) -> Option<String> {
        self.state.lock().seats.get(&id).cloned()
    }

    fn handle_request(&self, hub: &Hub, sender: SessionId, request: LobbyRequest) {
        match request {
            LobbyRequest::Join => self.join(hub, sender),
            LobbyRequest::Move { mv } => self.play(hub, sender, mv),
            LobbyRequest::Replay => self.replay(hub, sender),
            LobbyRequest::Quit => self.quit(hub, sender),
        }
    }

    fn join(&self, hub: &Hub, id: SessionId) {
        let mut state = self.state.lock();
        if state.is_queued(id) || state.seats.contains_key(&id) {
            debug!("Session {} already queued or seated", id);
            return;
        }
        state.waiting.push_back(id);
        send_json(hub, id, &LobbyEvent::Waiting);
        self.pair(hub, &mut state);
    }

    /// Seat waiting players two at a time
    fn pair(&self, hub: &Hub, state: &mut LobbyState) {
        while state.waiting.len() >= 2 {
            let (Some(white), Some(black)) = (state.waiting.pop_front(), state.waiting.pop_front())
            else {
                break;
            };
            let room = room_name(white, black);

            // A player whose session is already closing cannot be seated
            let white_ok = hub.join(white, &room).is_ok();
            let black_ok = hub.join(black, &room).is_ok();
            if !(white_ok && black_ok) {
                hub.leave(white, &room);
                hub.leave(black, &room);
                for (id, ok) in [(black, black_ok), (white, white_ok)] {
                    if ok {
                        state.waiting.push_front(id);
                    }
                }
                continue;
            }

            info!("Paired {} (white) and {} (black) in {}", white, black, room);
            let game = self.rules.new_game();
            let fen = game.position();
            state.seats.insert(white, room.clone());
            state.seats.insert(black, room.clone());
            state.rooms.insert(room.clone(), Room::new(white, black, game));
            send_json(
                hub,
                white,
                &LobbyEvent::Start {
                    room: room.clone(),
                    color: Color::White,
                    opponent: black,
                    fen: fen.clone(),
                },
            );
            send_json(
                hub,
                black,
                &LobbyEvent::Start {
                    room,
                    color: Color::Black,
                    opponent: white,
                    fen,
                },
            );
        }
    }

    fn play(&self, hub: &Hub, id: SessionId, mv: Value) {
        let mut state = self.state.lock();
        let Some(name) = state.seats.get(&id).cloned() else {
            send_json(hub, id, &LobbyEvent::error("not in a game", ErrorCode::InvalidState));
            return;
        };
        let Some(room) = state.rooms.get_mut(&name) else {
            warn!("Session {} seated in missing room {}", id, name);
            return;
        };

        let color = room.color_of(id);
        let refusal = if room.finished {
            Some("game is over".to_string())
        } else if Color::to_move(room.ply) != color {
            Some("not your turn".to_string())
        } else {
            None
        };
        if let Some(reason) = refusal {
            send_json(hub, id, &LobbyEvent::Invalid { reason, mv: Some(mv) });
            return;
        }

        let result = match room.game.play(color, &mv) {
            MoveVerdict::Reject(reason) => {
                send_json(hub, id, &LobbyEvent::Invalid { reason, mv: Some(mv) });
                return;
            }
            MoveVerdict::Accept => None,
            MoveVerdict::Finish(result) => Some(result),
        };

        let ply = room.ply;
        room.ply += 1;
        let moved = LobbyEvent::Move {
            room: name.clone(),
            color,
            ply,
            mv,
            fen: room.game.position(),
        };
        if let Err(e) = publish_json(hub, &name, &moved) {
            warn!("Failed to relay move in {}: {}", name, e);
        }
        if let Some(result) = result {
            room.finished = true;
            info!("Game in {} over: {}", name, result);
            let over = LobbyEvent::GameOver {
                room: name.clone(),
                result,
            };
            if let Err(e) = publish_json(hub, &name, &over) {
                warn!("Failed to announce result in {}: {}", name, e);
            }
        }
    }

    fn replay(&self, hub: &Hub, id: SessionId) {
        let mut state = self.state.lock();
        let Some(name) = state.seats.get(&id).cloned() else {
            send_json(hub, id, &LobbyEvent::error("not in a game", ErrorCode::InvalidState));
            return;
        };
        let Some(room) = state.rooms.get_mut(&name) else {
            return;
        };
        room.replay_votes.insert(id);
        debug!("Replay requested by {} in {}", id, name);
        if room.replay_votes.len() == 2 {
            room.restart(self.rules.new_game());
            info!("Room {} restarted", name);
            let restart = LobbyEvent::ReplayStart {
                room: name.clone(),
                fen: room.game.position(),
            };
            if let Err(e) = publish_json(hub, &name, &restart) {
                warn!("Failed to announce replay in {}: {}", name, e);
            }
        }
    }

    fn quit(&self, hub: &Hub, id: SessionId) {
        let mut state = self.state.lock();
        let Some(name) = state.seats.get(&id).cloned() else {
            // Quitting from the queue just leaves it
            state.waiting.retain(|waiting| *waiting != id);
            return;
        };
        let left = LobbyEvent::OpponentLeft { room: name.clone() };
        if let Err(e) = publish_json(hub, &name, &left) {
            debug!("Failed to notify {}: {}", name, e);
        }
        let Some(room) = state.dissolve(&name) else {
            return;
        };
        let opponent = room.opponent_of(id);
        hub.leave(id, &name);
        hub.leave(opponent, &name);
        info!("{} quit {}; requeueing {}", id, name, opponent);

        if hub.lookup(opponent).is_ok_and(|connection| connection.is_open())
            && !state.is_queued(opponent)
        {
            state.waiting.push_back(opponent);
            send_json(hub, opponent, &LobbyEvent::Waiting);
            self.pair(hub, &mut state);
        }
    }
}

impl Default for LobbyApp {
    fn default() -> Self {
        Self::new()
    }
}

impl Application for LobbyApp {
    fn on_open(&self, hub: &Hub, id: SessionId) {
        send_json(
            hub,
            id,
            &LobbyEvent::Welcome {
                version: PROTOCOL_VERSION,
                session_id: id,
            },
        );
    }

    fn on_message(&self, hub: &Hub, message: Message) {
        let Some(sender) = message.sender() else {
            warn!("Lobby received a message without a sender");
            return;
        };
        match message.payload() {
            Payload::Text(text) => match serde_json::from_str::<LobbyRequest>(text) {
                Ok(request) => self.handle_request(hub, sender, request),
                Err(e) => {
                    debug!("Rejected lobby frame from {}: {}", sender, e);
                    let event =
                        LobbyEvent::error(format!("Invalid message: {}", e), ErrorCode::InvalidMessage);
                    send_json(hub, sender, &event);
                }
            },
            Payload::Binary(_) => {
                let event =
                    LobbyEvent::error("binary frames are not supported", ErrorCode::InvalidMessage);
                send_json(hub, sender, &event);
            }
            Payload::Control(_) => {}
        }
    }

    fn on_close(&self, hub: &Hub, id: SessionId, reason: &CloseReason) {
        let mut state = self.state.lock();
        state.waiting.retain(|waiting| *waiting != id);
        let Some(name) = state.seats.get(&id).cloned() else {
            return;
        };
        // The closed session has already left the room group
        let left = LobbyEvent::OpponentLeft { room: name.clone() };
        if let Err(e) = publish_json(hub, &name, &left) {
            debug!("Failed to notify {}: {}", name, e);
        }
        if let Some(room) = state.dissolve(&name) {
            hub.leave(room.opponent_of(id), &name);
        }
        info!("{} left {} ({}); room dissolved", id, name, reason);
    }
}
