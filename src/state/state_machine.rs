//! Pure transition planner for the shared session record.
//!
//! A [`Plan`] pairs the field-group [`Patch`] that realises a transition with the
//! [`Guard`] that must still hold for it to be written. The store applies both in one
//! conditional write, so two clients planning from the same snapshot can never both
//! succeed.

use serde_json::Value;
use thiserror::Error;

use crate::{
    dao::change_feed::{Guard, Patch},
    state::{
        oracle::{OracleError, RulesOracle, Terminal},
        session::{
            ClockState, GameResult, LastMove, RematchState, Session, SessionStatus, Side,
            TerminationCause, UserRef, encode,
        },
    },
};

/// Stored field names touched by transitions.
pub(crate) mod fields {
    pub const STATUS: &str = "status";
    pub const GENERATION: &str = "generation";
    pub const POSITION: &str = "position";
    pub const POSITION_HISTORY: &str = "positionHistory";
    pub const TURN: &str = "turn";
    pub const RESULT: &str = "result";
    pub const TERMINATION_CAUSE: &str = "terminationCause";
    pub const LAST_MOVE: &str = "lastMove";
    pub const DRAW_OFFER: &str = "drawOffer";
    pub const RATING_APPLIED: &str = "ratingApplied";
    pub const PLAYERS_BLACK: &str = "players.black";
    pub const CLOCK: &str = "clock";
    pub const REMATCH: &str = "rematch";
    pub const REMATCH_OFFERED: &str = "rematch.offered";
    pub const REMATCH_ACCEPTED: &str = "rematch.accepted";
    pub const REMATCH_OFFERED_BY: &str = "rematch.offeredBy";

    use crate::state::session::Side;

    /// Counter owned by one side's clock.
    pub fn remaining(side: Side) -> &'static str {
        match side {
            Side::White => "clock.whiteRemainingMs",
            Side::Black => "clock.blackRemainingMs",
        }
    }
}

/// Intents and observations that may change a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A user asks to take the black seat.
    Join(UserRef),
    /// Both seats are bound; the game can begin.
    StartPlaying,
    /// The side to move plays `from → to`, reporting its local remaining time.
    Move {
        /// Origin square.
        from: String,
        /// Destination square.
        to: String,
        /// Mover's local clock, `None` to keep the stored counter.
        remaining_ms: Option<u64>,
    },
    /// Revert the opponent's last move.
    Undo,
    /// The acting player concedes.
    Resign,
    /// The acting player proposes a draw.
    OfferDraw,
    /// The opponent of the offering side agrees.
    AcceptDraw,
    /// Either player clears the pending offer.
    DeclineDraw,
    /// The side to move was observed with no time left.
    FlagFall,
    /// The current position ends the game by rule.
    Adjudicate,
    /// The side to move pushes its local remaining time.
    SyncClock {
        /// Mover's local clock.
        remaining_ms: u64,
    },
    /// A player proposes another game after the finish.
    OfferRematch,
    /// The other player agrees to the rematch.
    AcceptRematch,
    /// Both players agreed; start the next game in the same session.
    ResetForRematch,
    /// Claim the right to apply rating changes for this game.
    ClaimRating,
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// A seated player.
    Player(Side),
    /// Observer-driven transitions any client may perform.
    Observer,
}

impl Actor {
    /// Seat of `uid`, falling back to an observer.
    pub fn for_user(session: &Session, uid: &str) -> Self {
        session
            .side_of(uid)
            .map_or(Actor::Observer, Actor::Player)
    }

    fn side(self) -> Option<Side> {
        match self {
            Actor::Player(side) => Some(side),
            Actor::Observer => None,
        }
    }
}

/// Error returned when an event cannot be applied in the current status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while {from:?}")]
pub struct InvalidTransition {
    /// Status the session was in.
    pub from: SessionStatus,
    /// Event that does not apply there.
    pub event: SessionEvent,
}

/// Policy rejections surfaced to the requesting player.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The actor holds no seat.
    #[error("only seated players can do that")]
    NotAParticipant,
    /// The actor is not the side to move.
    #[error("it is not your turn")]
    NotYourTurn,
    /// The rules forbid the move.
    #[error("illegal move {from}{to}")]
    IllegalMove {
        /// Origin square.
        from: String,
        /// Destination square.
        to: String,
    },
    /// The game has no move left to take back.
    #[error("there is no move to take back")]
    UndoUnavailable,
    /// No pending offer from the opponent.
    #[error("there is no offer to answer")]
    NothingToAccept,
    /// The black seat is taken by someone else.
    #[error("session already has two players")]
    SessionFull,
}

/// Errors that can occur when planning a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The event does not apply in the current status.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    /// Game policy refused the actor.
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// The stored position could not be evaluated.
    #[error(transparent)]
    Oracle(OracleError),
}

impl From<OracleError> for PlanError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::IllegalMove { from, to } => {
                PlanError::Rejected(Rejection::IllegalMove { from, to })
            }
            other => PlanError::Oracle(other),
        }
    }
}

/// A validated transition ready to be written with a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Status planned from.
    pub from: SessionStatus,
    /// Status after the write.
    pub to: SessionStatus,
    /// Event being realised.
    pub event: SessionEvent,
    /// Preconditions of the write.
    pub guard: Guard,
    /// Fields to write.
    pub patch: Patch,
}

impl Plan {
    /// Plan that writes nothing because the record already reflects the event.
    fn unchanged(session: &Session, event: SessionEvent) -> Self {
        Self {
            from: session.status,
            to: session.status,
            event,
            guard: Guard::new(),
            patch: Patch::new(),
        }
    }

    /// Whether the record already reflects the event.
    pub fn is_noop(&self) -> bool {
        self.patch.is_empty()
    }
}

/// Outcome of attempting a planned transition against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The conditional write landed.
    Applied,
    /// Another writer changed the record first; the next notification carries its result.
    Superseded,
    /// The record already reflected the event, nothing was written.
    Unchanged,
}

/// Compute the guarded patch realising `event` on `session`.
pub fn plan(
    session: &Session,
    actor: Actor,
    event: SessionEvent,
    oracle: &dyn RulesOracle,
) -> Result<Plan, PlanError> {
    let Some(to) = next_status(session, &event) else {
        return Err(InvalidTransition {
            from: session.status,
            event,
        }
        .into());
    };

    let (guard, patch) = match &event {
        SessionEvent::Join(user) => {
            if session.side_of(&user.uid).is_some() {
                return Ok(Plan::unchanged(session, event));
            }
            if session.status != SessionStatus::Waiting || session.players.black.is_some() {
                return Err(Rejection::SessionFull.into());
            }
            (
                base_guard(session).field_eq(fields::PLAYERS_BLACK, Value::Null),
                Patch::new().set(fields::PLAYERS_BLACK, encode(user)),
            )
        }
        SessionEvent::StartPlaying => {
            if session.status != SessionStatus::Waiting {
                return Ok(Plan::unchanged(session, event));
            }
            if !session.players.both_bound() {
                return Err(InvalidTransition {
                    from: session.status,
                    event,
                }
                .into());
            }
            (
                base_guard(session),
                Patch::new()
                    .set(fields::STATUS, SessionStatus::Playing)
                    .set(
                        fields::CLOCK,
                        encode(&ClockState::seeded(session.clock.time_control)),
                    ),
            )
        }
        SessionEvent::Move {
            from,
            to: target,
            remaining_ms,
        } => {
            let side = movers_side(session, actor)?;
            let applied =
                oracle.apply_move(&session.position, from, target, &session.position_history)?;
            let mut history = session.position_history.clone();
            history.push(applied.position.clone());
            let remaining = remaining_ms
                .unwrap_or_else(|| session.remaining_ms(side))
                .saturating_add(session.clock.time_control.increment_ms);

            let mut patch = Patch::new()
                .set(fields::POSITION, applied.position)
                .set(fields::POSITION_HISTORY, history)
                .set(fields::TURN, applied.side_to_move)
                .set(
                    fields::LAST_MOVE,
                    encode(&LastMove {
                        from: from.clone(),
                        to: target.clone(),
                        moving_side: side,
                    }),
                )
                .set(fields::DRAW_OFFER, Value::Null)
                .set(fields::remaining(side), remaining);
            if let Some((result, cause)) = verdict(applied.terminal, applied.side_to_move) {
                patch = finish(patch, result, cause);
            }
            (position_guard(session), patch)
        }
        SessionEvent::Undo => {
            movers_side(session, actor)?;
            let keep = session.position_history.len().saturating_sub(1);
            if keep < 1 {
                return Err(Rejection::UndoUnavailable.into());
            }
            let history = session.position_history[..keep].to_vec();
            let previous = history[keep - 1].clone();
            let turn = oracle.side_to_move(&previous)?;
            (
                position_guard(session),
                Patch::new()
                    .set(fields::POSITION, previous)
                    .set(fields::POSITION_HISTORY, history)
                    .set(fields::TURN, turn)
                    .set(fields::LAST_MOVE, Value::Null)
                    .set(fields::DRAW_OFFER, Value::Null),
            )
        }
        SessionEvent::Resign => {
            let side = seated(actor)?;
            (
                base_guard(session),
                finish(
                    Patch::new().set(fields::DRAW_OFFER, Value::Null),
                    side.opponent().as_winner(),
                    TerminationCause::Resignation,
                ),
            )
        }
        SessionEvent::OfferDraw => {
            let side = seated(actor)?;
            match session.draw_offer {
                Some(offered) if offered == side => return Ok(Plan::unchanged(session, event)),
                Some(_) => {
                    return Err(InvalidTransition {
                        from: session.status,
                        event,
                    }
                    .into());
                }
                None => (
                    base_guard(session).field_eq(fields::DRAW_OFFER, Value::Null),
                    Patch::new().set(fields::DRAW_OFFER, side),
                ),
            }
        }
        SessionEvent::AcceptDraw => {
            let offered_by = pending_draw_offer(session, actor)?;
            (
                base_guard(session).field_eq(fields::DRAW_OFFER, offered_by),
                finish(
                    Patch::new().set(fields::DRAW_OFFER, Value::Null),
                    GameResult::Draw,
                    TerminationCause::DrawAgreement,
                ),
            )
        }
        SessionEvent::DeclineDraw => {
            let offered_by = pending_draw_offer(session, actor)?;
            (
                base_guard(session).field_eq(fields::DRAW_OFFER, offered_by),
                Patch::new().set(fields::DRAW_OFFER, Value::Null),
            )
        }
        SessionEvent::FlagFall => {
            let flagged = session.turn;
            if session.remaining_ms(flagged) > 0 {
                return Err(InvalidTransition {
                    from: session.status,
                    event,
                }
                .into());
            }
            (
                base_guard(session)
                    .field_eq(fields::TURN, flagged)
                    .field_eq(fields::remaining(flagged), 0),
                finish(
                    Patch::new().set(fields::DRAW_OFFER, Value::Null),
                    flagged.opponent().as_winner(),
                    TerminationCause::Timeout,
                ),
            )
        }
        SessionEvent::Adjudicate => {
            let terminal = oracle.classify(&session.position, session.earlier_positions())?;
            let Some((result, cause)) = verdict(terminal, session.turn) else {
                return Err(InvalidTransition {
                    from: session.status,
                    event,
                }
                .into());
            };
            (
                position_guard(session),
                finish(Patch::new().set(fields::DRAW_OFFER, Value::Null), result, cause),
            )
        }
        SessionEvent::SyncClock { remaining_ms } => {
            let side = movers_side(session, actor)?;
            (
                position_guard(session),
                Patch::new().set(fields::remaining(side), *remaining_ms),
            )
        }
        SessionEvent::OfferRematch => {
            let side = seated(actor)?;
            if session.rematch.offered {
                return match session.rematch.offered_by {
                    Some(offered_by) if offered_by == side => Ok(Plan::unchanged(session, event)),
                    _ => Err(InvalidTransition {
                        from: session.status,
                        event,
                    }
                    .into()),
                };
            }
            (
                base_guard(session).field_eq(fields::REMATCH_OFFERED, false),
                Patch::new()
                    .set(fields::REMATCH_OFFERED, true)
                    .set(fields::REMATCH_OFFERED_BY, side),
            )
        }
        SessionEvent::AcceptRematch => {
            let side = seated(actor)?;
            let RematchState {
                offered,
                accepted,
                offered_by,
            } = session.rematch;
            if accepted {
                return Ok(Plan::unchanged(session, event));
            }
            if !offered || offered_by != Some(side.opponent()) {
                return Err(Rejection::NothingToAccept.into());
            }
            (
                base_guard(session)
                    .field_eq(fields::REMATCH_OFFERED, true)
                    .field_eq(fields::REMATCH_ACCEPTED, false),
                Patch::new().set(fields::REMATCH_ACCEPTED, true),
            )
        }
        SessionEvent::ResetForRematch => {
            if !(session.rematch.offered && session.rematch.accepted) {
                return Err(InvalidTransition {
                    from: session.status,
                    event,
                }
                .into());
            }
            let start = oracle.start_position();
            (
                base_guard(session)
                    .field_eq(fields::REMATCH_OFFERED, true)
                    .field_eq(fields::REMATCH_ACCEPTED, true),
                Patch::new()
                    .set(fields::STATUS, SessionStatus::Playing)
                    .set(fields::GENERATION, session.generation + 1)
                    .set(fields::POSITION, start.clone())
                    .set(fields::POSITION_HISTORY, vec![start])
                    .set(fields::TURN, Side::White)
                    .set(
                        fields::CLOCK,
                        encode(&ClockState::seeded(session.clock.time_control)),
                    )
                    .set(fields::RESULT, GameResult::Undecided)
                    .set(fields::TERMINATION_CAUSE, TerminationCause::NotTerminated)
                    .set(fields::REMATCH, encode(&RematchState::default()))
                    .set(fields::LAST_MOVE, Value::Null)
                    .set(fields::DRAW_OFFER, Value::Null)
                    .set(fields::RATING_APPLIED, false),
            )
        }
        SessionEvent::ClaimRating => {
            if session.rating_applied {
                return Ok(Plan::unchanged(session, event));
            }
            (
                base_guard(session).field_eq(fields::RATING_APPLIED, false),
                Patch::new().set(fields::RATING_APPLIED, true),
            )
        }
    };

    let to = if patch.get(fields::STATUS).is_some_and(|status| status == "finished") {
        SessionStatus::Finished
    } else {
        to
    };

    Ok(Plan {
        from: session.status,
        to,
        event,
        guard,
        patch,
    })
}

/// Status reached by `event`, or `None` when the event is invalid in the current status.
fn next_status(session: &Session, event: &SessionEvent) -> Option<SessionStatus> {
    use SessionEvent as E;
    use SessionStatus as S;

    match (session.status, event) {
        (S::Waiting, E::Join(_)) => Some(S::Waiting),
        (status, E::Join(_)) => Some(status),
        (S::Waiting, E::StartPlaying) => Some(S::Playing),
        (status, E::StartPlaying) => Some(status),
        (
            S::Playing,
            E::Move { .. }
            | E::Undo
            | E::OfferDraw
            | E::DeclineDraw
            | E::SyncClock { .. },
        ) => Some(S::Playing),
        (S::Playing, E::Resign | E::AcceptDraw | E::FlagFall | E::Adjudicate) => {
            Some(S::Finished)
        }
        (S::Finished, E::OfferRematch | E::AcceptRematch | E::ClaimRating) => Some(S::Finished),
        (S::Finished, E::ResetForRematch) => Some(S::Playing),
        _ => None,
    }
}

/// Every transition requires the status and game generation it was planned from.
fn base_guard(session: &Session) -> Guard {
    Guard::new()
        .field_eq(fields::STATUS, session.status)
        .field_eq(fields::GENERATION, session.generation)
}

/// Move-like transitions additionally pin the exact move sequence.
fn position_guard(session: &Session) -> Guard {
    base_guard(session)
        .field_eq(fields::TURN, session.turn)
        .field_eq(fields::POSITION_HISTORY, session.position_history.clone())
}

fn finish(patch: Patch, result: GameResult, cause: TerminationCause) -> Patch {
    patch
        .set(fields::STATUS, SessionStatus::Finished)
        .set(fields::RESULT, result)
        .set(fields::TERMINATION_CAUSE, cause)
}

/// Result implied by a terminal position where `to_move` is the side to play.
fn verdict(terminal: Terminal, to_move: Side) -> Option<(GameResult, TerminationCause)> {
    match terminal {
        Terminal::Ongoing => None,
        Terminal::Checkmate => Some((to_move.opponent().as_winner(), TerminationCause::Checkmate)),
        Terminal::Stalemate
        | Terminal::InsufficientMaterial
        | Terminal::Repetition
        | Terminal::FiftyMove => Some((GameResult::Draw, TerminationCause::RuleDraw)),
    }
}

fn seated(actor: Actor) -> Result<Side, PlanError> {
    actor
        .side()
        .ok_or_else(|| Rejection::NotAParticipant.into())
}

fn movers_side(session: &Session, actor: Actor) -> Result<Side, PlanError> {
    let side = seated(actor)?;
    if side != session.turn {
        return Err(Rejection::NotYourTurn.into());
    }
    Ok(side)
}

fn pending_draw_offer(session: &Session, actor: Actor) -> Result<Side, PlanError> {
    let side = seated(actor)?;
    match session.draw_offer {
        Some(offered_by) if offered_by == side.opponent() => Ok(offered_by),
        _ => Err(Rejection::NothingToAccept.into()),
    }
}
