//! Elo rating updates, applied once per finished game.

use tracing::{debug, info, warn};

use crate::{
    config::RatingConfig,
    dao::{
        change_feed::{ChangeFeedStore, DocPath},
        models::{RATINGS, RatingEntity, to_fields},
    },
    error::ServiceError,
    services::history,
    state::{
        oracle::RulesOracle,
        session::{Session, SessionStatus, Side},
        state_machine::{Actor, SessionEvent, TransitionOutcome, plan},
        transitions::perform,
    },
};

/// Rating movement of one player after a game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingChange {
    /// Player whose rating moved.
    pub uid: String,
    /// Rating before the game.
    pub before: i32,
    /// Rating after the game.
    pub after: i32,
}

/// Probability-like expected score of `own` against `opponent`.
pub fn expected_score(own: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf(f64::from(opponent - own) / 400.0))
}

/// New rating after scoring `score` (1, 0.5 or 0) against `opponent`.
pub fn updated_rating(own: i32, opponent: i32, score: f64, k_factor: f64) -> i32 {
    let delta = k_factor * (score - expected_score(own, opponent));
    (f64::from(own) + delta).round() as i32
}

/// Stored rating of `uid`, or a fresh record at the initial rating.
pub async fn current_rating(
    store: &dyn ChangeFeedStore,
    uid: &str,
    initial: i32,
) -> Result<RatingEntity, ServiceError> {
    let fresh = || RatingEntity {
        uid: uid.to_owned(),
        rating: initial,
        games_played: 0,
    };
    let Some(document) = store.get(&DocPath::new(RATINGS, uid)).await? else {
        return Ok(fresh());
    };
    match document.decode::<RatingEntity>() {
        Ok(entity) => Ok(entity),
        Err(err) => {
            warn!(uid, error = %err, "unreadable rating record; starting from initial rating");
            Ok(fresh())
        }
    }
}

/// Claim and apply the rating update for a finished session.
///
/// Returns `None` when another client already claimed it or the session is not
/// eligible. A failure after the claim loses the update for this game.
pub async fn settle(
    store: &dyn ChangeFeedStore,
    oracle: &dyn RulesOracle,
    config: &RatingConfig,
    session: &Session,
) -> Result<Option<[RatingChange; 2]>, ServiceError> {
    if session.status != SessionStatus::Finished || session.rating_applied {
        return Ok(None);
    }
    let (Some(white), Some(black)) = (&session.players.white, &session.players.black) else {
        return Ok(None);
    };

    let claim = plan(session, Actor::Observer, SessionEvent::ClaimRating, oracle)?;
    if perform(store, session, claim).await? != TransitionOutcome::Applied {
        debug!(session_id = %session.id, "rating update claimed elsewhere");
        return Ok(None);
    }

    let white_before = current_rating(store, &white.uid, config.initial).await?;
    let black_before = current_rating(store, &black.uid, config.initial).await?;

    let changes = [
        rerate(
            store,
            config,
            &white_before,
            black_before.rating,
            session.result.score_for(Side::White),
        )
        .await?,
        rerate(
            store,
            config,
            &black_before,
            white_before.rating,
            session.result.score_for(Side::Black),
        )
        .await?,
    ];

    info!(
        session_id = %session.id,
        generation = session.generation,
        white = %white.uid,
        white_rating = changes[0].after,
        black = %black.uid,
        black_rating = changes[1].after,
        "ratings applied"
    );

    history::record_game(store, session, &changes).await?;
    Ok(Some(changes))
}

async fn rerate(
    store: &dyn ChangeFeedStore,
    config: &RatingConfig,
    own: &RatingEntity,
    opponent_rating: i32,
    score: f64,
) -> Result<RatingChange, ServiceError> {
    let after = updated_rating(own.rating, opponent_rating, score, config.k_factor);
    let entity = RatingEntity {
        uid: own.uid.clone(),
        rating: after,
        games_played: own.games_played + 1,
    };
    let fields = to_fields(&entity)?;
    store.put(&DocPath::new(RATINGS, &own.uid), fields).await?;
    Ok(RatingChange {
        uid: own.uid.clone(),
        before: own.rating,
        after,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        dao::{change_feed::memory::MemoryStore, models::SESSIONS},
        state::{
            oracle::StandardChess,
            session::{GameResult, TerminationCause, TimeControl, UserRef},
        },
    };

    #[test]
    fn equal_players_split_k() {
        assert_eq!(expected_score(1200, 1200), 0.5);
        assert_eq!(updated_rating(1200, 1200, 1.0, 32.0), 1216);
        assert_eq!(updated_rating(1200, 1200, 0.0, 32.0), 1184);
        assert_eq!(updated_rating(1200, 1200, 0.5, 32.0), 1200);
    }

    #[test]
    fn upset_moves_more_points() {
        // 1400 vs 1200: expected ≈ 0.76
        assert_eq!(updated_rating(1400, 1200, 0.0, 32.0), 1376);
        assert_eq!(updated_rating(1200, 1400, 1.0, 32.0), 1224);
    }

    async fn finished_session(store: &MemoryStore) -> Session {
        let mut session = Session::paired(
            UserRef::new("alice"),
            UserRef::new("bob"),
            StandardChess.start_position(),
            TimeControl::default(),
            0,
        );
        session.status = SessionStatus::Finished;
        session.result = GameResult::White;
        session.termination_cause = TerminationCause::Resignation;
        let id = store
            .create(SESSIONS, session.to_fields().unwrap())
            .await
            .unwrap();
        let document = store.get(&DocPath::new(SESSIONS, &id)).await.unwrap().unwrap();
        Session::from_document(&document).unwrap()
    }

    #[tokio::test]
    async fn concurrent_settlement_applies_once() {
        let store = Arc::new(MemoryStore::new());
        let session = finished_session(&store).await;
        let config = RatingConfig::default();

        let (first, second) = tokio::join!(
            settle(store.as_ref(), &StandardChess, &config, &session),
            settle(store.as_ref(), &StandardChess, &config, &session),
        );
        let applied: Vec<_> = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(applied.len(), 1);

        let alice = current_rating(store.as_ref(), "alice", 1200).await.unwrap();
        let bob = current_rating(store.as_ref(), "bob", 1200).await.unwrap();
        assert_eq!((alice.rating, alice.games_played), (1216, 1));
        assert_eq!((bob.rating, bob.games_played), (1184, 1));

        let stats = history::player_stats(store.as_ref(), "bob").await.unwrap();
        assert_eq!((stats.total, stats.losses), (1, 1));
    }

    #[tokio::test]
    async fn unfinished_sessions_are_not_rated() {
        let store = MemoryStore::new();
        let mut session = finished_session(&store).await;
        session.status = SessionStatus::Playing;
        let outcome = settle(&store, &StandardChess, &RatingConfig::default(), &session)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
