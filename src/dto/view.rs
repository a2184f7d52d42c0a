//! What one client renders for a session: banner, clocks and the intents that apply.

use serde::Serialize;

use crate::state::{
    clock::format_clock,
    oracle::RulesOracle,
    session::{GameResult, LastMove, Session, SessionStatus, Side, TerminationCause},
};

const WAITING_BANNER: &str = "Waiting for opponent to join...";
const YOUR_TURN_BANNER: &str = "Your turn";
const OPPONENT_TURN_BANNER: &str = "Opponent's turn";
const EMPTY_SEAT: &str = "Waiting...";

/// Draw offer state from the viewer's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawOfferView {
    /// No offer pending.
    None,
    /// The viewer offered; waiting for an answer.
    OfferedByMe,
    /// The viewer may accept or decline.
    OfferedByOpponent,
}

/// Rematch handshake state from the viewer's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RematchView {
    /// The game is not over or the viewer is not seated.
    Unavailable,
    /// Nobody offered yet.
    CanOffer,
    /// The viewer offered.
    AwaitingOpponent,
    /// The opponent offered.
    CanAccept,
    /// Both agreed; waiting for the reset to land.
    Starting,
}

/// Render-ready projection of a session for one viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    /// Id of the viewed session.
    pub session_id: String,
    /// Seat of the viewer, `None` for spectators.
    pub my_side: Option<Side>,
    /// Lifecycle phase.
    pub status: SessionStatus,
    /// The game runs and the viewer is to move.
    pub is_my_turn: bool,
    /// Headline such as `Your turn` or `Game Over - Draw`.
    pub banner: String,
    /// Label of the white seat.
    pub white_player: String,
    /// Label of the black seat, a placeholder while empty.
    pub black_player: String,
    /// Current position as FEN.
    pub position: String,
    /// Side to move.
    pub turn: Side,
    /// Half-moves played.
    pub ply: usize,
    /// Move to highlight on the board.
    pub last_move: Option<LastMove>,
    /// Moves of the current game in order, recovered from the position history.
    pub moves: Vec<LastMove>,
    /// White remaining time as `m:ss`.
    pub white_clock: String,
    /// Black remaining time as `m:ss`.
    pub black_clock: String,
    /// White remaining time in milliseconds.
    pub white_remaining_ms: u64,
    /// Black remaining time in milliseconds.
    pub black_remaining_ms: u64,
    /// Outcome once finished.
    pub result: GameResult,
    /// Why the game ended.
    pub termination_cause: TerminationCause,
    /// Pending draw offer as the viewer sees it.
    pub draw_offer: DrawOfferView,
    /// Rematch handshake as the viewer sees it.
    pub rematch: RematchView,
    /// Resign is available.
    pub can_resign: bool,
    /// Offering a draw is available.
    pub can_offer_draw: bool,
    /// Undo is available.
    pub can_undo: bool,
}

impl SessionView {
    /// Build the view for `viewer` with clocks already extrapolated to now.
    pub fn build(
        session: &Session,
        viewer: &str,
        (white_ms, black_ms): (u64, u64),
        oracle: &dyn RulesOracle,
    ) -> Self {
        let my_side = session.side_of(viewer);
        let playing = session.status == SessionStatus::Playing;
        let is_my_turn = playing && my_side == Some(session.turn);

        let draw_offer = match (session.draw_offer, my_side) {
            (Some(offered), Some(me)) if offered == me => DrawOfferView::OfferedByMe,
            (Some(_), Some(_)) => DrawOfferView::OfferedByOpponent,
            _ => DrawOfferView::None,
        };

        Self {
            session_id: session.id.clone(),
            my_side,
            status: session.status,
            is_my_turn,
            banner: banner(session, is_my_turn),
            white_player: seat_label(session, Side::White),
            black_player: seat_label(session, Side::Black),
            position: session.position.clone(),
            turn: session.turn,
            ply: session.ply(),
            last_move: session.last_move.clone(),
            moves: move_list(session, oracle),
            white_clock: format_clock(white_ms),
            black_clock: format_clock(black_ms),
            white_remaining_ms: white_ms,
            black_remaining_ms: black_ms,
            result: session.result,
            termination_cause: session.termination_cause,
            draw_offer,
            rematch: rematch_view(session, my_side),
            can_resign: playing && my_side.is_some(),
            can_offer_draw: playing && my_side.is_some() && session.draw_offer.is_none(),
            can_undo: is_my_turn && session.ply() > 0,
        }
    }
}

fn banner(session: &Session, is_my_turn: bool) -> String {
    match session.status {
        SessionStatus::Waiting => WAITING_BANNER.into(),
        SessionStatus::Playing if is_my_turn => YOUR_TURN_BANNER.into(),
        SessionStatus::Playing => OPPONENT_TURN_BANNER.into(),
        SessionStatus::Finished => match session.result {
            GameResult::Draw => "Game Over - Draw".into(),
            GameResult::Undecided => "Game Over".into(),
            winner => format!("Game Over - {} wins", winner.as_str()),
        },
    }
}

/// Stops at the first pair of positions no single legal move connects.
fn move_list(session: &Session, oracle: &dyn RulesOracle) -> Vec<LastMove> {
    session
        .position_history
        .windows(2)
        .map_while(|pair| oracle.infer_move(&pair[0], &pair[1]).ok().flatten())
        .collect()
}

fn seat_label(session: &Session, side: Side) -> String {
    session
        .players
        .get(side)
        .map_or_else(|| EMPTY_SEAT.to_string(), |user| user.label().to_string())
}

fn rematch_view(session: &Session, my_side: Option<Side>) -> RematchView {
    let Some(me) = my_side else {
        return RematchView::Unavailable;
    };
    if session.status != SessionStatus::Finished {
        return RematchView::Unavailable;
    }
    let rematch = session.rematch;
    match (rematch.offered, rematch.accepted, rematch.offered_by) {
        (_, true, _) => RematchView::Starting,
        (false, _, _) => RematchView::CanOffer,
        (true, false, Some(by)) if by == me => RematchView::AwaitingOpponent,
        (true, false, _) => RematchView::CanAccept,
    }
}
