//! Finished-game records and the profile statistics derived from them.

use tracing::warn;

use crate::{
    dao::{
        change_feed::{ChangeFeedStore, DocPath},
        models::{GAMES, GameRecordEntity, RecordResult, to_fields},
    },
    dto::{format_epoch_millis, stats::PlayerStats},
    error::ServiceError,
    services::rating::RatingChange,
    state::{
        epoch_millis,
        session::{GameResult, Session, Side},
    },
};

/// Deterministic record id, so a replayed write overwrites instead of duplicating.
pub fn record_id(session_id: &str, generation: u64, uid: &str) -> String {
    format!("{session_id}-{generation}-{uid}")
}

/// Write one record per seated player for a finished session.
pub async fn record_game(
    store: &dyn ChangeFeedStore,
    session: &Session,
    changes: &[RatingChange; 2],
) -> Result<(), ServiceError> {
    let finished_at = epoch_millis();
    for side in [Side::White, Side::Black] {
        let (Some(player), Some(opponent)) = (
            session.players.get(side),
            session.players.get(side.opponent()),
        ) else {
            continue;
        };
        let change = changes.iter().find(|change| change.uid == player.uid);
        let record = GameRecordEntity {
            user_id: player.uid.clone(),
            opponent_id: opponent.uid.clone(),
            opponent_email: opponent.email.clone(),
            result: result_for(session.result, side),
            termination_cause: session.termination_cause,
            date: format_epoch_millis(finished_at),
            finished_at,
            session_id: session.id.clone(),
            rating_before: change.map(|change| change.before),
            rating_after: change.map(|change| change.after),
        };
        let path = DocPath::new(GAMES, record_id(&session.id, session.generation, &player.uid));
        store.put(&path, to_fields(&record)?).await?;
    }
    Ok(())
}

/// Totals and the most recent games of `uid`.
pub async fn player_stats(
    store: &dyn ChangeFeedStore,
    uid: &str,
) -> Result<PlayerStats, ServiceError> {
    let records = store
        .list(GAMES)
        .await?
        .into_iter()
        .filter_map(|document| match document.decode::<GameRecordEntity>() {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(record_id = %document.id, error = %err, "skipping unreadable game record");
                None
            }
        })
        .filter(|record| record.user_id == uid)
        .collect();
    Ok(PlayerStats::from_records(records))
}

fn result_for(result: GameResult, side: Side) -> RecordResult {
    match result {
        GameResult::Draw | GameResult::Undecided => RecordResult::Draw,
        winner if winner == side.as_winner() => RecordResult::Win,
        _ => RecordResult::Loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::change_feed::memory::MemoryStore,
        state::session::{SessionStatus, TerminationCause, TimeControl, UserRef},
    };

    fn finished(id: &str, generation: u64, result: GameResult) -> Session {
        let mut session = Session::paired(
            UserRef::new("alice"),
            UserRef::new("bob").with_email("bob@example.com"),
            "start".into(),
            TimeControl::default(),
            0,
        );
        session.id = id.into();
        session.generation = generation;
        session.status = SessionStatus::Finished;
        session.result = result;
        session.termination_cause = TerminationCause::Checkmate;
        session
    }

    fn changes() -> [RatingChange; 2] {
        [
            RatingChange {
                uid: "alice".into(),
                before: 1200,
                after: 1216,
            },
            RatingChange {
                uid: "bob".into(),
                before: 1200,
                after: 1184,
            },
        ]
    }

    #[test]
    fn result_is_seen_per_side() {
        assert_eq!(result_for(GameResult::White, Side::White), RecordResult::Win);
        assert_eq!(result_for(GameResult::White, Side::Black), RecordResult::Loss);
        assert_eq!(result_for(GameResult::Draw, Side::Black), RecordResult::Draw);
    }

    #[tokio::test]
    async fn records_are_idempotent_per_game() {
        let store = MemoryStore::new();
        let session = finished("s1", 0, GameResult::White);
        record_game(&store, &session, &changes()).await.unwrap();
        record_game(&store, &session, &changes()).await.unwrap();
        assert_eq!(store.list(GAMES).await.unwrap().len(), 2);

        let rematch = finished("s1", 1, GameResult::Black);
        record_game(&store, &rematch, &changes()).await.unwrap();

        let alice = player_stats(&store, "alice").await.unwrap();
        assert_eq!((alice.total, alice.wins, alice.losses), (2, 1, 1));
        assert_eq!(alice.win_rate, 50);
        assert_eq!(alice.recent[0].opponent_email.as_deref(), Some("bob@example.com"));
        assert_eq!(alice.recent[0].rating_after, Some(1216));
    }

    #[test]
    fn record_ids_include_generation() {
        assert_eq!(record_id("s1", 2, "bob"), "s1-2-bob");
    }
}
