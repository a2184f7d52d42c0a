//! Local time keeping for the side to move.
//!
//! Only the client whose turn it is counts down; it owns its counter in the shared
//! record and pushes it periodically. The opponent merely extrapolates for display.

use std::time::Duration;

use tokio::time::Instant;

use crate::state::session::{Session, SessionStatus, Side};

/// Identifies the turn a running clock belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TurnAnchor {
    generation: u64,
    ply: usize,
    side: Side,
}

impl TurnAnchor {
    /// Anchor of the turn `session` is in.
    pub fn of(session: &Session) -> Self {
        Self {
            generation: session.generation,
            ply: session.ply(),
            side: session.turn,
        }
    }
}

/// Countdown of the side to move, started from the stored counter.
#[derive(Debug, Clone)]
pub(crate) struct LocalClock {
    anchor: TurnAnchor,
    remaining_at_start: u64,
    started: Instant,
    last_push: Instant,
    flag_reported: bool,
}

impl LocalClock {
    /// Start counting the side to move down from its stored counter.
    pub fn start(session: &Session, now: Instant) -> Self {
        Self {
            anchor: TurnAnchor::of(session),
            remaining_at_start: session.remaining_ms(session.turn),
            started: now,
            last_push: now,
            flag_reported: false,
        }
    }

    /// Whether this clock still tracks the turn shown by `session`.
    pub fn tracks(&self, session: &Session) -> bool {
        session.status == SessionStatus::Playing && self.anchor == TurnAnchor::of(session)
    }

    /// Time left at `now`.
    pub fn remaining_ms(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_millis();
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        self.remaining_at_start.saturating_sub(elapsed)
    }

    /// No time left at `now`.
    pub fn is_flagged(&self, now: Instant) -> bool {
        self.remaining_ms(now) == 0
    }

    /// Whether the counter should be pushed to the shared record now.
    pub fn push_due(&self, now: Instant, interval: Duration) -> bool {
        if self.is_flagged(now) {
            return !self.flag_reported;
        }
        now.saturating_duration_since(self.last_push) >= interval
    }

    /// Record a successful push made at `now`.
    pub fn mark_pushed(&mut self, now: Instant) {
        self.last_push = now;
        if self.is_flagged(now) {
            self.flag_reported = true;
        }
    }
}

/// Side whose stored counter has run out while it holds the move.
pub fn flag_fallen(session: &Session) -> Option<Side> {
    (session.status == SessionStatus::Playing && session.remaining_ms(session.turn) == 0)
        .then_some(session.turn)
}

/// Remaining time of both sides for display.
///
/// The side to move is extrapolated from the moment the record was observed; the
/// waiting side shows its stored counter.
pub fn displayed_remaining(session: &Session, observed_at: Instant, now: Instant) -> (u64, u64) {
    let mut white = session.remaining_ms(Side::White);
    let mut black = session.remaining_ms(Side::Black);
    if session.status == SessionStatus::Playing {
        let elapsed = now.saturating_duration_since(observed_at).as_millis();
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        match session.turn {
            Side::White => white = white.saturating_sub(elapsed),
            Side::Black => black = black.saturating_sub(elapsed),
        }
    }
    (white, black)
}

/// Render milliseconds as `m:ss`, rounding partial seconds up.
pub fn format_clock(remaining_ms: u64) -> String {
    let seconds = remaining_ms.div_ceil(1000);
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::session::{TimeControl, UserRef};

    fn playing(base_ms: u64) -> Session {
        let mut session = Session::paired(
            UserRef::new("alice"),
            UserRef::new("bob"),
            "start".into(),
            TimeControl {
                base_ms,
                increment_ms: 0,
            },
            0,
        );
        session.status = SessionStatus::Playing;
        session
    }

    #[test]
    fn format_clock_renders_minutes_and_seconds() {
        assert_eq!(format_clock(600_000), "10:00");
        assert_eq!(format_clock(65_000), "1:05");
        assert_eq!(format_clock(1), "0:01");
        assert_eq!(format_clock(0), "0:00");
    }

    #[test]
    fn local_clock_counts_down_and_flags() {
        let session = playing(2_000);
        let t0 = Instant::now();
        let clock = LocalClock::start(&session, t0);
        assert_eq!(clock.remaining_ms(t0 + Duration::from_millis(500)), 1_500);
        assert!(!clock.is_flagged(t0 + Duration::from_millis(1_999)));
        assert!(clock.is_flagged(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn flag_is_pushed_once() {
        let session = playing(1_000);
        let t0 = Instant::now();
        let mut clock = LocalClock::start(&session, t0);
        let late = t0 + Duration::from_secs(2);
        assert!(clock.push_due(late, Duration::from_secs(60)));
        clock.mark_pushed(late);
        assert!(!clock.push_due(late, Duration::from_secs(60)));
    }

    #[test]
    fn periodic_push_follows_interval() {
        let session = playing(60_000);
        let t0 = Instant::now();
        let mut clock = LocalClock::start(&session, t0);
        let interval = Duration::from_secs(1);
        assert!(!clock.push_due(t0 + Duration::from_millis(400), interval));
        assert!(clock.push_due(t0 + interval, interval));
        clock.mark_pushed(t0 + interval);
        assert!(!clock.push_due(t0 + Duration::from_millis(1_500), interval));
    }

    #[test]
    fn clock_stops_tracking_after_the_turn_changes() {
        let mut session = playing(60_000);
        let clock = LocalClock::start(&session, Instant::now());
        assert!(clock.tracks(&session));
        session.position_history.push("next".into());
        session.turn = Side::Black;
        assert!(!clock.tracks(&session));
    }

    #[test]
    fn display_extrapolates_only_the_side_to_move() {
        let session = playing(60_000);
        let t0 = Instant::now();
        let (white, black) = displayed_remaining(&session, t0, t0 + Duration::from_secs(3));
        assert_eq!((white, black), (57_000, 60_000));

        let mut finished = session.clone();
        finished.status = SessionStatus::Finished;
        let (white, _) = displayed_remaining(&finished, t0, t0 + Duration::from_secs(3));
        assert_eq!(white, 60_000);
    }

    #[test]
    fn flag_fallen_reports_the_side_to_move() {
        let mut session = playing(60_000);
        assert_eq!(flag_fallen(&session), None);
        session.clock.black_remaining_ms = 0;
        assert_eq!(flag_fallen(&session), None);
        session.clock.white_remaining_ms = 0;
        assert_eq!(flag_fallen(&session), Some(Side::White));
    }
}
