use tracing::{debug, info};

use crate::{
    dao::{
        change_feed::{ChangeFeedStore, DocPath},
        models::SESSIONS,
    },
    error::ServiceError,
    state::{
        session::Session,
        state_machine::{Plan, TransitionOutcome},
    },
};

/// Write a planned transition with a single conditional update.
///
/// A failed guard is reported as [`TransitionOutcome::Superseded`]: the other writer's
/// result reaches every client through the session feed.
pub async fn perform(
    store: &dyn ChangeFeedStore,
    session: &Session,
    plan: Plan,
) -> Result<TransitionOutcome, ServiceError> {
    if plan.is_noop() {
        return Ok(TransitionOutcome::Unchanged);
    }

    let path = DocPath::new(SESSIONS, &session.id);
    let Plan {
        from,
        to,
        event,
        guard,
        patch,
    } = plan;

    if !store.update_if(&path, guard, patch).await? {
        debug!(
            session_id = %session.id,
            event = ?event,
            revision = session.revision,
            "transition superseded by a concurrent write"
        );
        return Ok(TransitionOutcome::Superseded);
    }

    if from != to {
        info!(
            session_id = %session.id,
            from = from.as_str(),
            to = to.as_str(),
            event = ?event,
            "session transition applied"
        );
    } else {
        debug!(session_id = %session.id, event = ?event, "session updated");
    }
    Ok(TransitionOutcome::Applied)
}
