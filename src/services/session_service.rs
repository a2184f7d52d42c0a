//! Client-side session engine: turns local intents into guarded writes and keeps a
//! reconciled copy of the shared record.
//!
//! Every client runs the same loop. The record in the store is authoritative; the
//! local snapshot only ever follows it. Transitions that any observer may perform
//! (starting the game, adjudicating a timeout or a terminal position, resetting for a
//! rematch, settling ratings) are attempted by whichever client notices them first and
//! deduplicated by their guards.

use std::{sync::Arc, time::Duration};

use futures::Stream;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    dao::{
        change_feed::{ChangeFeedStore, DocPath, DocumentFeed},
        models::SESSIONS,
    },
    dto::{
        intent::{CreateSessionRequest, MoveIntent, PlayerInput},
        view::SessionView,
    },
    error::ServiceError,
    services::{clock_service, rating},
    state::{
        SharedState,
        clock::{LocalClock, displayed_remaining, flag_fallen},
        epoch_millis,
        oracle::RulesOracle,
        session::{Session, SessionStatus, UserRef},
        state_machine::{Actor, SessionEvent, TransitionOutcome, plan},
        transitions::perform,
    },
};

/// Attempts at binding the black seat before giving up on a churning record.
const JOIN_ATTEMPTS: usize = 3;

/// A session record together with the local instant it was received.
#[derive(Debug, Clone)]
pub(crate) struct Observed {
    pub(crate) session: Arc<Session>,
    pub(crate) at: Instant,
}

impl Observed {
    fn now(session: Session) -> Self {
        Self {
            session: Arc::new(session),
            at: Instant::now(),
        }
    }
}

/// State shared between a [`SessionClient`] and its background tasks.
pub(crate) struct ClientShared {
    pub(crate) state: SharedState,
    store: Arc<dyn ChangeFeedStore>,
    pub(crate) me: UserRef,
    session_id: String,
    snapshot: watch::Sender<Option<Observed>>,
    pub(crate) local_clock: Mutex<Option<LocalClock>>,
}

impl ClientShared {
    pub(crate) fn current(&self) -> Option<Observed> {
        self.snapshot.borrow().clone()
    }

    /// Plan `event` for this client against `session` and write it.
    pub(crate) async fn act(
        &self,
        session: &Session,
        event: SessionEvent,
    ) -> Result<TransitionOutcome, ServiceError> {
        if self.state.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        let actor = Actor::for_user(session, &self.me.uid);
        let plan = plan(session, actor, event, self.state.oracle())?;
        perform(self.store.as_ref(), session, plan).await
    }

    /// Accept a newer record from the feed; stale or unreadable ones are dropped.
    fn observe(&self, session: Session) -> bool {
        self.snapshot.send_if_modified(|current| {
            if current
                .as_ref()
                .is_some_and(|known| known.session.revision > session.revision)
            {
                return false;
            }
            *current = Some(Observed::now(session));
            true
        })
    }

    /// Attempt whichever observer-driven transition the latest record calls for.
    async fn housekeeping(&self) {
        let Some(Observed { session, .. }) = self.current() else {
            return;
        };
        if session.side_of(&self.me.uid).is_none() {
            return;
        }

        let event = match session.status {
            SessionStatus::Waiting if session.players.both_bound() => {
                Some(SessionEvent::StartPlaying)
            }
            SessionStatus::Playing if flag_fallen(&session).is_some() => {
                Some(SessionEvent::FlagFall)
            }
            SessionStatus::Playing => match self
                .state
                .oracle()
                .classify(&session.position, session.earlier_positions())
            {
                Ok(terminal) if terminal.is_over() => Some(SessionEvent::Adjudicate),
                Ok(_) => None,
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "cannot classify position");
                    None
                }
            },
            SessionStatus::Finished if !session.rating_applied => {
                let config = &self.state.config().rating;
                if let Err(err) =
                    rating::settle(self.store.as_ref(), self.state.oracle(), config, &session).await
                {
                    warn!(session_id = %session.id, error = %err, "failed to settle ratings");
                }
                None
            }
            SessionStatus::Finished if session.rematch.offered && session.rematch.accepted => {
                Some(SessionEvent::ResetForRematch)
            }
            _ => None,
        };

        if let Some(event) = event {
            let label = format!("{event:?}");
            match self.act(&session, event).await {
                Ok(outcome) => {
                    debug!(session_id = %session.id, event = %label, outcome = ?outcome, "housekeeping")
                }
                Err(err) => {
                    warn!(session_id = %session.id, event = %label, error = %err, "housekeeping write failed")
                }
            }
        }
    }
}

/// Follow the session feed, publishing every newer record and reacting to it.
async fn reconcile(shared: Arc<ClientShared>, mut feed: DocumentFeed) {
    shared.housekeeping().await;
    while let Some(document) = feed.next().await {
        let Some(document) = document else {
            info!(session_id = %shared.session_id, "session removed; stopping reconciliation");
            shared.snapshot.send_replace(None);
            return;
        };
        match Session::from_document(&document) {
            Ok(session) => {
                debug!(
                    session_id = %shared.session_id,
                    revision = session.revision,
                    status = session.status.as_str(),
                    ply = session.ply(),
                    "reconciled session record"
                );
                if shared.observe(session) {
                    shared.housekeeping().await;
                }
            }
            Err(err) => {
                warn!(session_id = %shared.session_id, error = %err, "ignoring unreadable session record");
            }
        }
    }
    debug!(session_id = %shared.session_id, "session feed closed");
}

/// One player's (or spectator's) live attachment to a session.
///
/// Dropping the client, or calling [`SessionClient::leave`], unsubscribes and stops
/// the clock driver.
pub struct SessionClient {
    shared: Arc<ClientShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Open a new room with `me` as white and return its id.
pub async fn create_session(
    state: &SharedState,
    me: UserRef,
    request: CreateSessionRequest,
) -> Result<String, ServiceError> {
    PlayerInput::from(&me).validate()?;
    request.validate()?;
    let store = state.require_store().await?;

    let time_control = request.time_control.unwrap_or(state.config().time_control);
    let uid = me.uid.clone();
    let session = Session::new(
        me,
        state.oracle().start_position(),
        time_control,
        epoch_millis(),
    );
    let id = store.create(SESSIONS, session.to_fields()?).await?;
    info!(session_id = %id, white = %uid, base_ms = time_control.base_ms, "session created");
    Ok(id)
}

/// Take the black seat of `session_id` (or rejoin an own seat) and attach to it.
pub async fn join_session(
    state: &SharedState,
    me: UserRef,
    session_id: &str,
) -> Result<SessionClient, ServiceError> {
    PlayerInput::from(&me).validate()?;
    let store = state.require_store().await?;
    let path = DocPath::new(SESSIONS, session_id);

    for _ in 0..JOIN_ATTEMPTS {
        let document = store
            .get(&path)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}`")))?;
        let session = Session::from_document(&document)?;
        let actor = Actor::for_user(&session, &me.uid);
        let join = plan(
            &session,
            actor,
            SessionEvent::Join(me.clone()),
            state.oracle(),
        )?;

        match perform(store.as_ref(), &session, join).await? {
            TransitionOutcome::Superseded => continue,
            TransitionOutcome::Applied => {
                info!(session_id, black = %me.uid, "joined session");
            }
            TransitionOutcome::Unchanged => {
                info!(session_id, uid = %me.uid, "rejoined own seat");
            }
        }
        return open_session(state, me, session_id).await;
    }

    Err(ServiceError::InvalidState(format!(
        "session `{session_id}` kept changing while joining"
    )))
}

/// Attach to an existing session without changing its seats.
pub async fn open_session(
    state: &SharedState,
    me: UserRef,
    session_id: &str,
) -> Result<SessionClient, ServiceError> {
    let store = state.require_store().await?;
    let mut feed = store.subscribe(&DocPath::new(SESSIONS, session_id)).await?;
    let document = feed
        .next()
        .await
        .flatten()
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}`")))?;
    let session = Session::from_document(&document)?;

    let (snapshot, _rx) = watch::channel(Some(Observed::now(session)));
    let shared = Arc::new(ClientShared {
        state: state.clone(),
        store,
        me,
        session_id: session_id.to_owned(),
        snapshot,
        local_clock: Mutex::new(None),
    });
    let tasks = vec![
        tokio::spawn(reconcile(shared.clone(), feed)),
        tokio::spawn(clock_service::drive(shared.clone())),
    ];
    debug!(session_id, uid = %shared.me.uid, "attached to session");

    Ok(SessionClient { shared, tasks })
}

impl SessionClient {
    /// Id of the attached session.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// User this client acts for.
    pub fn me(&self) -> &UserRef {
        &self.shared.me
    }

    /// Latest reconciled record, `None` once the session was removed.
    pub fn snapshot(&self) -> Option<Arc<Session>> {
        self.shared.current().map(|observed| observed.session)
    }

    /// Render-ready view with clocks extrapolated to now.
    pub fn view(&self) -> Option<SessionView> {
        self.shared
            .current()
            .map(|observed| {
                view_of(&observed, &self.shared.me.uid, self.shared.state.oracle(), Instant::now())
            })
    }

    /// A fresh view for every reconciled record.
    pub fn views(&self) -> impl Stream<Item = SessionView> + Send + 'static {
        let uid = self.shared.me.uid.clone();
        let state = self.shared.state.clone();
        WatchStream::new(self.shared.snapshot.subscribe()).filter_map(move |observed| {
            observed.map(|observed| view_of(&observed, &uid, state.oracle(), Instant::now()))
        })
    }

    /// Wait until the reconciled record satisfies `predicate`.
    pub async fn wait_until<F>(
        &self,
        limit: Duration,
        mut predicate: F,
    ) -> Result<Arc<Session>, ServiceError>
    where
        F: FnMut(&Session) -> bool,
    {
        let mut rx = self.shared.snapshot.subscribe();
        let waited = timeout(
            limit,
            rx.wait_for(|observed| {
                observed
                    .as_ref()
                    .is_some_and(|observed| predicate(&observed.session))
            }),
        )
        .await;
        match waited {
            Err(_) => Err(ServiceError::Timeout),
            Ok(Err(_)) => Err(ServiceError::NotFound(format!(
                "session `{}`",
                self.shared.session_id
            ))),
            Ok(Ok(observed)) => observed
                .as_ref()
                .map(|observed| observed.session.clone())
                .ok_or_else(|| ServiceError::NotFound(self.shared.session_id.clone())),
        }
    }

    /// Play `from → to` (square names such as `e2`, `e4`).
    pub async fn make_move(&self, from: &str, to: &str) -> Result<TransitionOutcome, ServiceError> {
        let intent = MoveIntent::new(from, to);
        intent.validate()?;
        let session = self.require_session()?;

        let remaining_ms = {
            let slot = self.shared.local_clock.lock().await;
            slot.as_ref()
                .filter(|clock| clock.tracks(&session))
                .map(|clock| clock.remaining_ms(Instant::now()))
        };
        if remaining_ms == Some(0) {
            return Err(ServiceError::InvalidState("no time left on the clock".into()));
        }

        let outcome = self
            .shared
            .act(
                &session,
                SessionEvent::Move {
                    from: intent.from,
                    to: intent.to,
                    remaining_ms,
                },
            )
            .await?;
        if outcome == TransitionOutcome::Applied {
            self.shared.local_clock.lock().await.take();
        }
        Ok(outcome)
    }

    /// Take back the opponent's last move.
    pub async fn undo(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::Undo).await
    }

    /// Concede the game.
    pub async fn resign(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::Resign).await
    }

    /// Offer a draw; any move clears the offer.
    pub async fn offer_draw(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::OfferDraw).await
    }

    /// Accept the opponent's pending draw offer.
    pub async fn accept_draw(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::AcceptDraw).await
    }

    /// Withdraw or decline a pending draw offer.
    pub async fn decline_draw(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::DeclineDraw).await
    }

    /// Propose a new game in this session once finished.
    pub async fn offer_rematch(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::OfferRematch).await
    }

    /// Accept the opponent's rematch offer.
    pub async fn accept_rematch(&self) -> Result<TransitionOutcome, ServiceError> {
        self.intent(SessionEvent::AcceptRematch).await
    }

    /// Destination squares for the piece on `square` in the current position.
    pub fn legal_moves(&self, square: &str) -> Result<Vec<String>, ServiceError> {
        let session = self.require_session()?;
        self.shared
            .state
            .oracle()
            .legal_moves(&session.position, square)
            .map_err(|err| ServiceError::InvalidInput(err.to_string()))
    }

    /// Stop following the session. Writes already sent are not awaited.
    pub fn leave(self) {
        info!(session_id = %self.shared.session_id, uid = %self.shared.me.uid, "left session");
    }

    async fn intent(&self, event: SessionEvent) -> Result<TransitionOutcome, ServiceError> {
        let session = self.require_session()?;
        self.shared.act(&session, event).await
    }

    fn require_session(&self) -> Result<Arc<Session>, ServiceError> {
        self.snapshot()
            .ok_or_else(|| ServiceError::NotFound(format!("session `{}`", self.shared.session_id)))
    }
}

fn view_of(
    observed: &Observed,
    uid: &str,
    oracle: &dyn RulesOracle,
    now: Instant,
) -> SessionView {
    let clocks = displayed_remaining(&observed.session, observed.at, now);
    SessionView::build(&observed.session, uid, clocks, oracle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        dao::{
            change_feed::memory::MemoryStore,
            models::{GAMES, RATINGS},
        },
        services::rating::current_rating,
        state::{
            EngineState,
            oracle::StandardChess,
            session::{GameResult, Side, TerminationCause, TimeControl},
        },
    };

    const WAIT: Duration = Duration::from_secs(5);

    async fn engine() -> (SharedState, MemoryStore) {
        let state = EngineState::new(EngineConfig::default(), Arc::new(StandardChess));
        let store = MemoryStore::new();
        state.install_store(Arc::new(store.clone())).await;
        (state, store)
    }

    async fn seated_pair(state: &SharedState) -> (SessionClient, SessionClient) {
        let id = create_session(state, UserRef::new("alice"), CreateSessionRequest::default())
            .await
            .unwrap();
        let white = open_session(state, UserRef::new("alice"), &id).await.unwrap();
        let black = join_session(state, UserRef::new("bob"), &id).await.unwrap();
        white
            .wait_until(WAIT, |s| s.status == SessionStatus::Playing)
            .await
            .unwrap();
        black
            .wait_until(WAIT, |s| s.status == SessionStatus::Playing)
            .await
            .unwrap();
        (white, black)
    }

    #[tokio::test]
    async fn moves_are_seen_by_both_clients() {
        let (state, _store) = engine().await;
        let (white, black) = seated_pair(&state).await;

        assert_eq!(white.view().unwrap().banner, "Your turn");
        assert_eq!(black.view().unwrap().banner, "Opponent's turn");

        assert_eq!(
            white.make_move("e2", "e4").await.unwrap(),
            TransitionOutcome::Applied
        );
        let seen = black.wait_until(WAIT, |s| s.ply() == 1).await.unwrap();
        assert_eq!(seen.turn, Side::Black);
        assert_eq!(seen.last_move.as_ref().unwrap().to, "e4");

        black.make_move("e7", "e5").await.unwrap();
        let seen = white.wait_until(WAIT, |s| s.ply() == 2).await.unwrap();
        assert_eq!(seen.turn, Side::White);
        assert_eq!(seen.position_history.len(), 3);
        assert_eq!(seen.position_history.last(), Some(&seen.position));
    }

    #[tokio::test]
    async fn out_of_turn_and_illegal_moves_are_rejected() {
        let (state, _store) = engine().await;
        let (white, black) = seated_pair(&state).await;

        assert!(matches!(
            black.make_move("e7", "e5").await,
            Err(ServiceError::Rejected(_))
        ));
        assert!(matches!(
            white.make_move("e2", "e5").await,
            Err(ServiceError::Rejected(_))
        ));
        assert!(matches!(
            white.make_move("e2", "z9").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert_eq!(white.snapshot().unwrap().ply(), 0);
    }

    #[tokio::test]
    async fn third_user_is_turned_away() {
        let (state, _store) = engine().await;
        let (white, _black) = seated_pair(&state).await;
        let err = join_session(&state, UserRef::new("carol"), white.session_id())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::SessionFull));

        let err = join_session(&state, UserRef::new("carol"), "missing")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn checkmate_finishes_and_settles_ratings_once() {
        let (state, store) = engine().await;
        let (white, black) = seated_pair(&state).await;

        for (client, from, to) in [
            (&white, "f2", "f3"),
            (&black, "e7", "e5"),
            (&white, "g2", "g4"),
            (&black, "d8", "h4"),
        ] {
            let ply = client.snapshot().unwrap().ply();
            client.make_move(from, to).await.unwrap();
            white.wait_until(WAIT, |s| s.ply() == ply + 1).await.unwrap();
            black.wait_until(WAIT, |s| s.ply() == ply + 1).await.unwrap();
        }

        let finished = white
            .wait_until(WAIT, |s| s.rating_applied)
            .await
            .unwrap();
        assert_eq!(finished.status, SessionStatus::Finished);
        assert_eq!(finished.result, GameResult::Black);
        assert_eq!(finished.termination_cause, TerminationCause::Checkmate);
        assert_eq!(white.view().unwrap().banner, "Game Over - black wins");

        // Ratings and records are written right after the claim.
        let deadline = Instant::now() + WAIT;
        while store.list(GAMES).await.unwrap().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.list(GAMES).await.unwrap().len(), 2);
        assert_eq!(store.list(RATINGS).await.unwrap().len(), 2);
        let bob = current_rating(&store, "bob", 1200).await.unwrap();
        assert_eq!((bob.rating, bob.games_played), (1216, 1));
    }

    #[tokio::test]
    async fn draw_offer_and_acceptance() {
        let (state, _store) = engine().await;
        let (white, black) = seated_pair(&state).await;

        white.offer_draw().await.unwrap();
        black
            .wait_until(WAIT, |s| s.draw_offer == Some(Side::White))
            .await
            .unwrap();
        assert!(matches!(
            white.accept_draw().await,
            Err(ServiceError::Rejected(_))
        ));
        black.accept_draw().await.unwrap();
        let finished = white
            .wait_until(WAIT, |s| s.status == SessionStatus::Finished)
            .await
            .unwrap();
        assert_eq!(finished.result, GameResult::Draw);
        assert_eq!(finished.termination_cause, TerminationCause::DrawAgreement);
    }

    #[tokio::test]
    async fn rematch_resets_to_a_new_generation() {
        let (state, _store) = engine().await;
        let (white, black) = seated_pair(&state).await;

        white.make_move("e2", "e4").await.unwrap();
        black.wait_until(WAIT, |s| s.ply() == 1).await.unwrap();
        black.resign().await.unwrap();
        white
            .wait_until(WAIT, |s| s.status == SessionStatus::Finished)
            .await
            .unwrap();

        white.offer_rematch().await.unwrap();
        black
            .wait_until(WAIT, |s| s.rematch.offered)
            .await
            .unwrap();
        black.accept_rematch().await.unwrap();

        for client in [&white, &black] {
            let reset = client
                .wait_until(WAIT, |s| s.generation == 1)
                .await
                .unwrap();
            assert_eq!(reset.status, SessionStatus::Playing);
            assert_eq!(reset.position_history, vec![StandardChess.start_position()]);
            assert_eq!(reset.turn, Side::White);
            assert!(!reset.rematch.offered);
        }
        assert!(white.make_move("d2", "d4").await.is_ok());
    }

    #[tokio::test]
    async fn undo_takes_back_the_last_move() {
        let (state, _store) = engine().await;
        let (white, black) = seated_pair(&state).await;

        white.make_move("e2", "e4").await.unwrap();
        black.wait_until(WAIT, |s| s.ply() == 1).await.unwrap();
        assert!(matches!(white.undo().await, Err(ServiceError::Rejected(_))));
        black.undo().await.unwrap();
        let undone = white.wait_until(WAIT, |s| s.ply() == 0).await.unwrap();
        assert_eq!(undone.turn, Side::White);
        assert!(undone.last_move.is_none());
    }

    #[tokio::test]
    async fn concurrent_timeout_adjudication_has_one_winner() {
        let store = MemoryStore::new();
        let mut session = Session::paired(
            UserRef::new("alice"),
            UserRef::new("bob"),
            StandardChess.start_position(),
            TimeControl::default(),
            0,
        );
        session.status = SessionStatus::Playing;
        session.clock.white_remaining_ms = 0;
        let id = store
            .create(SESSIONS, session.to_fields().unwrap())
            .await
            .unwrap();
        let path = DocPath::new(SESSIONS, &id);
        let session = Session::from_document(&store.get(&path).await.unwrap().unwrap()).unwrap();

        let first = plan(&session, Actor::Observer, SessionEvent::FlagFall, &StandardChess).unwrap();
        let second = first.clone();
        let (a, b) = tokio::join!(
            perform(&store, &session, first),
            perform(&store, &session, second)
        );
        let mut outcomes = [a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome == TransitionOutcome::Applied);
        assert_eq!(
            outcomes,
            [TransitionOutcome::Superseded, TransitionOutcome::Applied]
        );

        let stored = Session::from_document(&store.get(&path).await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.result, GameResult::Black);
        assert_eq!(stored.termination_cause, TerminationCause::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn running_out_of_time_loses_the_game() {
        let (state, _store) = engine().await;
        let id = create_session(
            &state,
            UserRef::new("alice"),
            CreateSessionRequest {
                time_control: Some(TimeControl {
                    base_ms: 2_000,
                    increment_ms: 0,
                }),
            },
        )
        .await
        .unwrap();
        let white = open_session(&state, UserRef::new("alice"), &id).await.unwrap();
        let black = join_session(&state, UserRef::new("bob"), &id).await.unwrap();

        let finished = black
            .wait_until(Duration::from_secs(30), |s| {
                s.status == SessionStatus::Finished
            })
            .await
            .unwrap();
        assert_eq!(finished.result, GameResult::Black);
        assert_eq!(finished.termination_cause, TerminationCause::Timeout);
        assert_eq!(finished.remaining_ms(Side::White), 0);
        white
            .wait_until(Duration::from_secs(30), |s| {
                s.status == SessionStatus::Finished
            })
            .await
            .unwrap();
        assert!(matches!(
            white.make_move("e2", "e4").await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn waiting_room_view_and_stream() {
        let (state, _store) = engine().await;
        let id = create_session(&state, UserRef::new("alice"), CreateSessionRequest::default())
            .await
            .unwrap();
        let white = open_session(&state, UserRef::new("alice"), &id).await.unwrap();
        let mut views = white.views();
        let first = views.next().await.unwrap();
        assert_eq!(first.banner, "Waiting for opponent to join...");
        assert_eq!(first.black_player, "Waiting...");

        let _black = join_session(&state, UserRef::new("bob"), &id).await.unwrap();
        let mut latest = first;
        while latest.status != SessionStatus::Playing {
            latest = tokio::time::timeout(WAIT, views.next()).await.unwrap().unwrap();
        }
        assert_eq!(latest.banner, "Your turn");
        assert_eq!(latest.white_clock, "10:00");
    }

    #[tokio::test]
    async fn intents_fail_fast_while_degraded() {
        let (state, _store) = engine().await;
        let (white, _black) = seated_pair(&state).await;
        state.update_degraded(true);
        let err = white.make_move("e2", "e4").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ServiceError::Degraded));
    }

    #[tokio::test]
    async fn legal_move_hints_follow_the_position() {
        let (state, _store) = engine().await;
        let (white, _black) = seated_pair(&state).await;
        let mut targets = white.legal_moves("b1").unwrap();
        targets.sort();
        assert_eq!(targets, vec!["a3".to_string(), "c3".to_string()]);
    }

    #[tokio::test]
    async fn removed_session_clears_the_snapshot() {
        let (state, store) = engine().await;
        let id = create_session(&state, UserRef::new("alice"), CreateSessionRequest::default())
            .await
            .unwrap();
        let white = open_session(&state, UserRef::new("alice"), &id).await.unwrap();
        store.delete(&DocPath::new(SESSIONS, &id)).await.unwrap();

        let deadline = Instant::now() + WAIT;
        while white.snapshot().is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(white.snapshot().is_none());
        assert!(matches!(white.resign().await, Err(ServiceError::NotFound(_))));
    }
}
