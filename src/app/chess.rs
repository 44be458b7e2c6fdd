//! Chess rules for lobby rooms
//!
//! Moves are UCI strings (`"e2e4"`, `"e7e8q"`) or objects of the form
//! `{"from": "e2", "to": "e4", "promotion": "q"}`. Positions are sent to
//! clients as FEN.

use serde_json::Value;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{Chess, EnPassantMode, Position};

use super::{Color, Game, GameRules, MoveVerdict};

/// Standard chess from the initial position
#[derive(Debug, Default, Clone, Copy)]
pub struct ChessRules;

impl GameRules for ChessRules {
    fn new_game(&self) -> Box<dyn Game> {
        Box::new(ChessGame::default())
    }
}

#[derive(Debug, Default)]
pub struct ChessGame {
    position: Chess,
}

impl ChessGame {
    pub fn fen(&self) -> String {
        Fen::from_setup(self.position.clone().into_setup(EnPassantMode::Legal)).to_string()
    }
}

/// UCI text for either accepted move shape
fn uci_text(mv: &Value) -> Option<String> {
    match mv {
        Value::String(text) => Some(text.clone()),
        Value::Object(fields) => {
            let from = fields.get("from")?.as_str()?;
            let to = fields.get("to")?.as_str()?;
            let promotion = fields.get("promotion").and_then(Value::as_str).unwrap_or("");
            Some(format!("{}{}{}", from, to, promotion))
        }
        _ => None,
    }
}

impl Game for ChessGame {
    fn play(&mut self, _color: Color, mv: &Value) -> MoveVerdict {
        let Some(text) = uci_text(mv) else {
            return MoveVerdict::Reject("expected a UCI move".to_string());
        };
        let Ok(uci) = text.parse::<UciMove>() else {
            return MoveVerdict::Reject(format!("malformed move: {}", text));
        };
        let Ok(legal) = uci.to_move(&self.position) else {
            return MoveVerdict::Reject(format!("illegal move: {}", text));
        };
        self.position.play_unchecked(&legal);

        match self.position.outcome() {
            Some(outcome) => MoveVerdict::Finish(outcome.to_string()),
            None => MoveVerdict::Accept,
        }
    }

    fn position(&self) -> Option<String> {
        Some(self.fen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn play_all(game: &mut ChessGame, moves: &[&str]) -> Vec<MoveVerdict> {
        moves
            .iter()
            .enumerate()
            .map(|(ply, mv)| game.play(Color::to_move(ply), &json!(mv)))
            .collect()
    }

    #[test]
    fn test_new_game_starts_at_initial_position() {
        let game = ChessRules.new_game();
        assert_eq!(game.position().as_deref(), Some(START));
    }

    #[test]
    fn test_legal_move_updates_fen() {
        let mut game = ChessGame::default();
        assert_eq!(game.play(Color::White, &json!("e2e4")), MoveVerdict::Accept);
        assert_eq!(
            game.fen(),
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1"
        );
    }

    #[test]
    fn test_object_move_with_promotion_field() {
        let mut game = ChessGame::default();
        let mv = json!({"from": "g1", "to": "f3"});
        assert_eq!(game.play(Color::White, &mv), MoveVerdict::Accept);
        assert!(game.fen().starts_with("rnbqkbnr/pppppppp/8/8/8/5N2/"));
    }

    #[test]
    fn test_illegal_move_is_rejected_and_not_applied() {
        let mut game = ChessGame::default();
        assert_eq!(
            game.play(Color::White, &json!("e2e5")),
            MoveVerdict::Reject("illegal move: e2e5".to_string())
        );
        assert_eq!(
            game.play(Color::White, &json!("zz")),
            MoveVerdict::Reject("malformed move: zz".to_string())
        );
        assert_eq!(
            game.play(Color::White, &json!(42)),
            MoveVerdict::Reject("expected a UCI move".to_string())
        );
        assert_eq!(game.fen(), START);
    }

    #[test]
    fn test_fools_mate_finishes_the_game() {
        let mut game = ChessGame::default();
        let verdicts = play_all(&mut game, &["f2f3", "e7e5", "g2g4", "d8h4"]);
        assert_eq!(
            verdicts,
            vec![
                MoveVerdict::Accept,
                MoveVerdict::Accept,
                MoveVerdict::Accept,
                MoveVerdict::Finish("0-1".to_string()),
            ]
        );
    }
}
