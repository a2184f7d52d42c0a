use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    dao::change_feed::Fields,
    state::session::{TerminationCause, TimeControl},
};

/// Collection holding one record per game session.
pub const SESSIONS: &str = "sessions";
/// Collection of open matchmaking tickets, keyed by player uid.
pub const TICKETS: &str = "tickets";
/// Collection of player ratings, keyed by player uid.
pub const RATINGS: &str = "ratings";
/// Collection of finished-game records, one per player per game.
pub const GAMES: &str = "games";

/// Open request to be paired with an opponent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketEntity {
    /// Searching player; also the document id.
    pub uid: String,
    /// Shown to the opponent once paired.
    #[serde(default)]
    pub email: Option<String>,
    /// Rating at the time the ticket was published.
    pub rating_snapshot: i32,
    /// Only tickets with equal time controls pair.
    pub time_control: TimeControl,
    /// Milliseconds since the Unix epoch; orders tickets together with `uid`.
    pub enqueued_at: u64,
    /// Pairer currently holding this ticket.
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// Session created for this ticket by its pairer.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl TicketEntity {
    /// Position in the total order pairers use to decide who acts.
    pub fn order_key(&self) -> (u64, &str) {
        (self.enqueued_at, self.uid.as_str())
    }

    /// Unclaimed and not yet paired.
    pub fn is_open(&self) -> bool {
        self.claimed_by.is_none() && self.session_id.is_none()
    }
}

/// Persisted rating of a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingEntity {
    /// Player; also the document id.
    pub uid: String,
    /// Current Elo rating.
    pub rating: i32,
    /// Rated games counted so far.
    #[serde(default)]
    pub games_played: u32,
}

/// Outcome of a finished game from one player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordResult {
    /// The player won.
    Win,
    /// The player lost.
    Loss,
    /// Nobody won.
    Draw,
}

/// One player's record of a finished game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecordEntity {
    /// Player the record belongs to.
    pub user_id: String,
    /// Uid of the other player.
    pub opponent_id: String,
    /// Opponent email at the time of the game.
    #[serde(default)]
    pub opponent_email: Option<String>,
    /// Outcome for [`Self::user_id`].
    pub result: RecordResult,
    /// How the game ended.
    pub termination_cause: TerminationCause,
    /// RFC 3339 timestamp of the finish.
    pub date: String,
    /// Milliseconds since the Unix epoch; used for ordering.
    pub finished_at: u64,
    /// Session the game was played in.
    pub session_id: String,
    /// Rating before the game when it was rated.
    #[serde(default)]
    pub rating_before: Option<i32>,
    /// Rating after the game when it was rated.
    #[serde(default)]
    pub rating_after: Option<i32>,
}

/// Serialize a record into a document body.
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(fields) => Ok(fields),
        _ => Ok(Fields::new()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ticket_uses_camel_case_and_null_claims() {
        let ticket = TicketEntity {
            uid: "alice".into(),
            email: None,
            rating_snapshot: 1200,
            time_control: TimeControl::default(),
            enqueued_at: 10,
            claimed_by: None,
            session_id: None,
        };
        let fields = to_fields(&ticket).unwrap();
        assert_eq!(fields.get("claimedBy"), Some(&Value::Null));
        assert_eq!(fields.get("ratingSnapshot"), Some(&json!(1200)));
        assert!(ticket.is_open());
    }

    #[test]
    fn tickets_order_by_time_then_uid() {
        let mut a = TicketEntity {
            uid: "b".into(),
            email: None,
            rating_snapshot: 1200,
            time_control: TimeControl::default(),
            enqueued_at: 5,
            claimed_by: None,
            session_id: None,
        };
        let mut b = a.clone();
        b.uid = "a".into();
        assert!(b.order_key() < a.order_key());
        a.enqueued_at = 4;
        assert!(a.order_key() < b.order_key());
    }

    #[test]
    fn record_result_is_lowercase() {
        assert_eq!(serde_json::to_value(RecordResult::Loss).unwrap(), json!("loss"));
    }
}
