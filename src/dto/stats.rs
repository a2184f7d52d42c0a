use serde::Serialize;

use crate::dao::models::{GameRecordEntity, RecordResult};

/// Number of recent games listed on a profile.
pub const RECENT_GAMES: usize = 10;

/// Aggregated results of one player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    /// Games on record.
    pub total: usize,
    /// Games won.
    pub wins: usize,
    /// Games lost.
    pub losses: usize,
    /// Games drawn.
    pub draws: usize,
    /// Rounded percentage of games won.
    pub win_rate: u32,
    /// Newest first.
    pub recent: Vec<GameRecordEntity>,
}

impl PlayerStats {
    /// Aggregate records of a single player; order of `records` does not matter.
    pub fn from_records(mut records: Vec<GameRecordEntity>) -> Self {
        let count = |wanted: RecordResult| {
            records
                .iter()
                .filter(|record| record.result == wanted)
                .count()
        };
        let total = records.len();
        let wins = count(RecordResult::Win);
        let losses = count(RecordResult::Loss);
        let draws = count(RecordResult::Draw);
        let win_rate = if total == 0 {
            0
        } else {
            ((wins as f64 / total as f64) * 100.0).round() as u32
        };

        records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        records.truncate(RECENT_GAMES);

        Self {
            total,
            wins,
            losses,
            draws,
            win_rate,
            recent: records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::session::TerminationCause;

    fn record(result: RecordResult, finished_at: u64) -> GameRecordEntity {
        GameRecordEntity {
            user_id: "alice".into(),
            opponent_id: "bob".into(),
            opponent_email: None,
            result,
            termination_cause: TerminationCause::Checkmate,
            date: String::new(),
            finished_at,
            session_id: format!("s{finished_at}"),
            rating_before: None,
            rating_after: None,
        }
    }

    #[test]
    fn empty_history_has_zero_rate() {
        let stats = PlayerStats::from_records(Vec::new());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.win_rate, 0);
    }

    #[test]
    fn counts_and_rounds_win_rate() {
        let stats = PlayerStats::from_records(vec![
            record(RecordResult::Win, 1),
            record(RecordResult::Loss, 2),
            record(RecordResult::Win, 3),
        ]);
        assert_eq!((stats.wins, stats.losses, stats.draws), (2, 1, 0));
        assert_eq!(stats.win_rate, 67);
        assert_eq!(stats.recent[0].finished_at, 3);
    }

    #[test]
    fn recent_list_is_capped() {
        let records = (0..15).map(|i| record(RecordResult::Draw, i)).collect();
        let stats = PlayerStats::from_records(records);
        assert_eq!(stats.total, 15);
        assert_eq!(stats.recent.len(), RECENT_GAMES);
        assert_eq!(stats.recent[0].finished_at, 14);
    }
}
