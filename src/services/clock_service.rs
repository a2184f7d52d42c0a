//! Local countdown of the side to move and its periodic push to the shared record.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::{
    services::session_service::ClientShared,
    state::{
        clock::LocalClock,
        session::SessionStatus,
        state_machine::{SessionEvent, TransitionOutcome},
    },
};

/// Tick the local clock while this client holds the move.
///
/// Only the mover writes its own counter; everyone else renders an extrapolation.
pub(crate) async fn drive(shared: Arc<ClientShared>) {
    let config = &shared.state.config().clock;
    let sync_interval = config.sync_interval();
    let mut ticker = interval(config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(observed) = shared.current() else {
            shared.local_clock.lock().await.take();
            continue;
        };
        let session = observed.session;
        let my_turn = session.status == SessionStatus::Playing
            && session.side_of(&shared.me.uid) == Some(session.turn);
        if !my_turn {
            shared.local_clock.lock().await.take();
            continue;
        }

        let now = Instant::now();
        let remaining_ms = {
            let mut slot = shared.local_clock.lock().await;
            if !slot.as_ref().is_some_and(|clock| clock.tracks(&session)) {
                *slot = Some(LocalClock::start(&session, now));
            }
            let Some(clock) = slot.as_ref() else {
                continue;
            };
            if !clock.push_due(now, sync_interval) {
                continue;
            }
            clock.remaining_ms(now)
        };

        match shared
            .act(&session, SessionEvent::SyncClock { remaining_ms })
            .await
        {
            Ok(outcome) => {
                if outcome == TransitionOutcome::Superseded {
                    debug!(session_id = %session.id, "clock push superseded");
                }
                let mut slot = shared.local_clock.lock().await;
                if let Some(clock) = slot.as_mut().filter(|clock| clock.tracks(&session)) {
                    clock.mark_pushed(now);
                }
            }
            Err(err) => {
                warn!(session_id = %session.id, remaining_ms, error = %err, "failed to push clock");
            }
        }
    }
}
