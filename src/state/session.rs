//! Shared session record as both clients see it in the change-feed store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::dao::{
    change_feed::{Document, Fields},
    models,
};

/// One of the two seats at the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Moves first.
    White,
    /// Joins second; also the matchmaking pairer.
    Black,
}

impl Side {
    /// The other seat.
    pub fn opponent(self) -> Side {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    /// Stored spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }

    /// Outcome that credits this side with the win.
    pub fn as_winner(self) -> GameResult {
        match self {
            Side::White => GameResult::White,
            Side::Black => GameResult::Black,
        }
    }
}

/// Lifecycle of a session: `waiting → playing → finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Room open, black seat possibly empty.
    Waiting,
    /// Clocks running.
    Playing,
    /// Result fixed; only rematch and rating settlement remain.
    Finished,
}

impl SessionStatus {
    /// Stored spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Playing => "playing",
            SessionStatus::Finished => "finished",
        }
    }
}

/// Final outcome; only meaningful once the session is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameResult {
    /// White won.
    White,
    /// Black won.
    Black,
    /// Nobody won.
    Draw,
    /// Game not over, stored as `none`.
    #[default]
    #[serde(rename = "none")]
    Undecided,
}

impl GameResult {
    /// Stored spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            GameResult::White => "white",
            GameResult::Black => "black",
            GameResult::Draw => "draw",
            GameResult::Undecided => "none",
        }
    }

    /// Score credited to `side`: 1 for a win, 0.5 for a draw, 0 otherwise.
    pub fn score_for(self, side: Side) -> f64 {
        match (self, side) {
            (GameResult::Draw, _) => 0.5,
            (GameResult::White, Side::White) | (GameResult::Black, Side::Black) => 1.0,
            _ => 0.0,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationCause {
    /// The side to move was mated.
    Checkmate,
    /// A player conceded.
    Resignation,
    /// A clock ran out.
    Timeout,
    /// Both players agreed to a draw.
    DrawAgreement,
    /// Stalemate, insufficient material, threefold repetition or the fifty-move rule.
    RuleDraw,
    /// Game not over, stored as `none`.
    #[default]
    #[serde(rename = "none")]
    NotTerminated,
}

impl TerminationCause {
    /// Stored spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationCause::Checkmate => "checkmate",
            TerminationCause::Resignation => "resignation",
            TerminationCause::Timeout => "timeout",
            TerminationCause::DrawAgreement => "draw-agreement",
            TerminationCause::RuleDraw => "rule-draw",
            TerminationCause::NotTerminated => "none",
        }
    }
}

macro_rules! impl_into_value {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::String(value.as_str().to_owned())
            }
        })+
    };
}

impl_into_value!(Side, SessionStatus, GameResult, TerminationCause);

/// Reference to a player's identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Stable user id.
    pub uid: String,
    /// Display email, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserRef {
    /// User known only by uid.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
        }
    }

    /// Attach a display email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Human label shown next to the board.
    pub fn label(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.uid)
    }
}

/// Seats of the session. White is fixed at creation, black binds on join.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Players {
    /// Creator of the session.
    #[serde(default)]
    pub white: Option<UserRef>,
    /// Second player, `None` until someone joins.
    #[serde(default)]
    pub black: Option<UserRef>,
}

impl Players {
    /// Player seated on `side`.
    pub fn get(&self, side: Side) -> Option<&UserRef> {
        match side {
            Side::White => self.white.as_ref(),
            Side::Black => self.black.as_ref(),
        }
    }

    /// Whether both seats are taken.
    pub fn both_bound(&self) -> bool {
        self.white.is_some() && self.black.is_some()
    }
}

/// Base time plus per-move increment, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TimeControl {
    /// Starting time of each side.
    #[validate(range(min = 1000))]
    pub base_ms: u64,
    /// Added to the mover after every move.
    #[validate(range(max = 3_600_000))]
    pub increment_ms: u64,
}

impl Default for TimeControl {
    fn default() -> Self {
        Self {
            base_ms: 600_000,
            increment_ms: 0,
        }
    }
}

/// Stored clock counters of both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    /// White counter as last pushed.
    pub white_remaining_ms: u64,
    /// Black counter as last pushed.
    pub black_remaining_ms: u64,
    /// Time control the counters were seeded from.
    pub time_control: TimeControl,
}

impl ClockState {
    /// Both counters at the base time of `time_control`.
    pub fn seeded(time_control: TimeControl) -> Self {
        Self {
            white_remaining_ms: time_control.base_ms,
            black_remaining_ms: time_control.base_ms,
            time_control,
        }
    }

    /// Stored counter of `side`.
    pub fn remaining_ms(&self, side: Side) -> u64 {
        match side {
            Side::White => self.white_remaining_ms,
            Side::Black => self.black_remaining_ms,
        }
    }
}

/// Two-phase rematch handshake flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RematchState {
    /// Someone proposed a rematch.
    pub offered: bool,
    /// The other player agreed; the reset is due.
    pub accepted: bool,
    /// Who proposed it.
    #[serde(default)]
    pub offered_by: Option<Side>,
}

/// Most recent move, kept for highlighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMove {
    /// Origin square.
    pub from: String,
    /// Destination square.
    pub to: String,
    /// Side that played it.
    pub moving_side: Side,
}

/// The shared record for one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Store-assigned id; not part of the stored body.
    #[serde(skip)]
    pub id: String,
    /// Store revision the record was decoded from.
    #[serde(skip)]
    pub revision: u64,
    /// Seated players.
    pub players: Players,
    /// Current position as FEN.
    pub position: String,
    /// Every position of the current game, oldest first, ending with [`Self::position`].
    pub position_history: Vec<String>,
    /// Side to move.
    pub turn: Side,
    /// Stored clock counters.
    pub clock: ClockState,
    /// Lifecycle phase.
    pub status: SessionStatus,
    /// Outcome once finished.
    #[serde(default)]
    pub result: GameResult,
    /// Why the game ended.
    #[serde(default)]
    pub termination_cause: TerminationCause,
    /// Rematch handshake of a finished game.
    #[serde(default)]
    pub rematch: RematchState,
    /// Move that produced [`Self::position`]; cleared by undo.
    #[serde(default)]
    pub last_move: Option<LastMove>,
    /// Side with a pending draw offer.
    #[serde(default)]
    pub draw_offer: Option<Side>,
    /// Ratings and game records were written for this result.
    #[serde(default)]
    pub rating_applied: bool,
    /// Bumped by every rematch reset; part of every transition guard.
    #[serde(default)]
    pub generation: u64,
    /// Epoch milliseconds of creation.
    #[serde(default)]
    pub created_at: u64,
}

impl Session {
    /// Fresh session waiting for its second player.
    pub fn new(
        white: UserRef,
        start_position: String,
        time_control: TimeControl,
        created_at: u64,
    ) -> Self {
        Self {
            id: String::new(),
            revision: 0,
            players: Players {
                white: Some(white),
                black: None,
            },
            position_history: vec![start_position.clone()],
            position: start_position,
            turn: Side::White,
            clock: ClockState::seeded(time_control),
            status: SessionStatus::Waiting,
            result: GameResult::Undecided,
            termination_cause: TerminationCause::NotTerminated,
            rematch: RematchState::default(),
            last_move: None,
            draw_offer: None,
            rating_applied: false,
            generation: 0,
            created_at,
        }
    }

    /// Session with both seats already bound, as produced by matchmaking.
    pub fn paired(
        white: UserRef,
        black: UserRef,
        start_position: String,
        time_control: TimeControl,
        created_at: u64,
    ) -> Self {
        let mut session = Self::new(white, start_position, time_control, created_at);
        session.players.black = Some(black);
        session
    }

    /// Decode a stored record, taking id and revision from the document.
    pub fn from_document(document: &Document) -> Result<Self, serde_json::Error> {
        let mut session: Session = document.decode()?;
        session.id = document.id.clone();
        session.revision = document.revision;
        Ok(session)
    }

    /// Stored body of this record.
    pub fn to_fields(&self) -> Result<Fields, serde_json::Error> {
        models::to_fields(self)
    }

    /// Seat occupied by `uid`, if any.
    pub fn side_of(&self, uid: &str) -> Option<Side> {
        [Side::White, Side::Black]
            .into_iter()
            .find(|side| self.players.get(*side).is_some_and(|user| user.uid == uid))
    }

    /// Stored counter of `side`.
    pub fn remaining_ms(&self, side: Side) -> u64 {
        self.clock.remaining_ms(side)
    }

    /// Number of half-moves played since the current position history began.
    pub fn ply(&self) -> usize {
        self.position_history.len().saturating_sub(1)
    }

    /// Positions that preceded the current one in this game.
    pub fn earlier_positions(&self) -> &[String] {
        let len = self.position_history.len();
        &self.position_history[..len.saturating_sub(1)]
    }
}

/// Serialize any record into a field value; our records always encode.
pub(crate) fn encode<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[test]
    fn new_session_satisfies_record_invariants() {
        let session = Session::new(
            UserRef::new("alice"),
            START.into(),
            TimeControl::default(),
            0,
        );
        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.position_history, vec![START.to_string()]);
        assert_eq!(session.position_history.last(), Some(&session.position));
        assert!(session.players.black.is_none());
        assert_eq!(session.remaining_ms(Side::Black), 600_000);
    }

    #[test]
    fn stored_shape_uses_wire_names() {
        let mut session = Session::paired(
            UserRef::new("alice").with_email("alice@example.com"),
            UserRef::new("bob"),
            START.into(),
            TimeControl {
                base_ms: 60_000,
                increment_ms: 2_000,
            },
            7,
        );
        session.termination_cause = TerminationCause::DrawAgreement;
        let fields = session.to_fields().unwrap();
        let value = Value::Object(fields);

        assert_eq!(value["players"]["white"]["email"], json!("alice@example.com"));
        assert_eq!(value["clock"]["timeControl"]["incrementMs"], json!(2_000));
        assert_eq!(value["clock"]["whiteRemainingMs"], json!(60_000));
        assert_eq!(value["terminationCause"], json!("draw-agreement"));
        assert_eq!(value["result"], json!("none"));
        assert_eq!(value["lastMove"], Value::Null);
        assert!(value.get("id").is_none());
    }

    #[test]
    fn decoding_restores_id_and_revision() {
        let session = Session::new(UserRef::new("alice"), START.into(), TimeControl::default(), 0);
        let document = Document {
            id: "s1".into(),
            revision: 4,
            fields: session.to_fields().unwrap(),
        };
        let decoded = Session::from_document(&document).unwrap();
        assert_eq!(decoded.id, "s1");
        assert_eq!(decoded.revision, 4);
        assert_eq!(decoded.side_of("alice"), Some(Side::White));
        assert_eq!(decoded.side_of("mallory"), None);
    }

    #[test]
    fn score_for_follows_result() {
        assert_eq!(GameResult::White.score_for(Side::White), 1.0);
        assert_eq!(GameResult::White.score_for(Side::Black), 0.0);
        assert_eq!(GameResult::Draw.score_for(Side::Black), 0.5);
    }
}
