//! Random-opponent pairing without a central allocator.
//!
//! Every searching client publishes a ticket at `tickets/{uid}` and watches the whole
//! ticket collection. Only the newer ticket of a compatible pair acts: it creates the
//! session, records it on its own ticket, then claims the older ticket with a
//! conditional write. That last write decides the pairing; a loser removes the session
//! it created, reopens its ticket and listens again.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    dao::{
        change_feed::{ChangeFeedStore, CollectionFeed, CollectionSnapshot, DocPath, Guard, Patch},
        models::{SESSIONS, TICKETS, TicketEntity, to_fields},
    },
    dto::intent::PlayerInput,
    error::ServiceError,
    services::rating::current_rating,
    state::{
        SharedState, epoch_millis,
        session::{Session, Side, TimeControl, UserRef},
    },
};

const CLAIMED_BY: &str = "claimedBy";
const SESSION_ID: &str = "sessionId";

/// Attempts at withdrawing a ticket that keeps changing underneath us.
const WITHDRAW_ATTEMPTS: usize = 3;

/// A pairing this client takes part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFound {
    /// Session both players were seated in.
    pub session_id: String,
    /// Seat of this client.
    pub side: Side,
    /// The other player.
    pub opponent: UserRef,
}

enum Step {
    Found(MatchFound),
    Wait,
    Retry,
}

/// Publish a ticket for `me` and wait until paired or the configured timeout.
pub async fn find_match(
    state: &SharedState,
    me: UserRef,
    time_control: Option<TimeControl>,
) -> Result<MatchFound, ServiceError> {
    PlayerInput::from(&me).validate()?;
    let time_control = time_control.unwrap_or(state.config().time_control);
    time_control.validate()?;
    let store = state.require_store().await?;
    let config = &state.config().matchmaking;

    let rating = current_rating(store.as_ref(), &me.uid, state.config().rating.initial).await?;
    let ticket = TicketEntity {
        uid: me.uid.clone(),
        email: me.email.clone(),
        rating_snapshot: rating.rating,
        time_control,
        enqueued_at: epoch_millis(),
        claimed_by: None,
        session_id: None,
    };
    store
        .put(&ticket_path(&me.uid), to_fields(&ticket)?)
        .await?;
    info!(uid = %me.uid, rating = rating.rating, base_ms = time_control.base_ms, "searching for an opponent");

    let searching = async {
        let feed = store.subscribe_collection(TICKETS).await?;
        search(state, store.as_ref(), &me, feed).await
    };
    match timeout(config.timeout(), searching).await {
        Ok(found) => found,
        Err(_) => {
            if let Some(found) = withdraw(store.as_ref(), &me.uid).await? {
                return Ok(found);
            }
            info!(uid = %me.uid, "no opponent found before the timeout");
            Err(ServiceError::Timeout)
        }
    }
}

/// Withdraw the ticket of `uid`.
///
/// Fails with [`ServiceError::InvalidState`] when the ticket was already paired.
pub async fn cancel_search(state: &SharedState, uid: &str) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    match withdraw(store.as_ref(), uid).await? {
        None => {
            info!(uid, "search cancelled");
            Ok(())
        }
        Some(found) => Err(ServiceError::InvalidState(format!(
            "already paired into session `{}`",
            found.session_id
        ))),
    }
}

async fn search(
    state: &SharedState,
    store: &dyn ChangeFeedStore,
    me: &UserRef,
    mut feed: CollectionFeed,
) -> Result<MatchFound, ServiceError> {
    let jitter = state.config().matchmaking.retry_jitter_ms;
    let mut step = Step::Wait;
    loop {
        let snapshot = match step {
            Step::Found(found) => return Ok(found),
            Step::Retry => {
                let delay = rand::rng().random_range(0..=jitter);
                sleep(Duration::from_millis(delay)).await;
                feed.current()
            }
            Step::Wait => feed
                .next()
                .await
                .ok_or_else(|| ServiceError::InvalidState("ticket feed closed".into()))?,
        };
        step = consider(state, store, me, &snapshot).await?;
    }
}

/// Decide what to do about one view of the ticket collection.
async fn consider(
    state: &SharedState,
    store: &dyn ChangeFeedStore,
    me: &UserRef,
    snapshot: &CollectionSnapshot,
) -> Result<Step, ServiceError> {
    let tickets: Vec<TicketEntity> = snapshot
        .values()
        .filter_map(|document| match document.decode::<TicketEntity>() {
            Ok(ticket) => Some(ticket),
            Err(err) => {
                warn!(ticket_id = %document.id, error = %err, "skipping unreadable ticket");
                None
            }
        })
        .collect();

    let Some(own) = tickets.iter().find(|ticket| ticket.uid == me.uid) else {
        return Err(ServiceError::NotFound(format!("ticket of `{}`", me.uid)));
    };
    if let Some(session_id) = &own.session_id {
        return Ok(match resolve(store, &me.uid, own, session_id).await? {
            Some(found) => Step::Found(found),
            None => Step::Retry,
        });
    }
    if own.claimed_by.as_ref().is_some_and(|pairer| *pairer != me.uid) {
        return Ok(Step::Wait);
    }

    let max_gap = state.config().matchmaking.max_rating_gap;
    let Some(candidate) = pick_candidate(own, &tickets, max_gap) else {
        return Ok(Step::Wait);
    };
    pair_with(state, store, me, own, candidate).await
}

/// First older, open, compatible ticket in discovery order.
fn pick_candidate<'a>(
    own: &TicketEntity,
    tickets: &'a [TicketEntity],
    max_gap: Option<u32>,
) -> Option<&'a TicketEntity> {
    tickets.iter().find(|ticket| {
        ticket.uid != own.uid
            && ticket.is_open()
            && ticket.order_key() < own.order_key()
            && ticket.time_control == own.time_control
            && max_gap.is_none_or(|gap| ticket.rating_snapshot.abs_diff(own.rating_snapshot) <= gap)
    })
}

/// Pair `me` (black) with `candidate` (white).
///
/// The session id lands on our own ticket before the candidate is claimed, so a search
/// dropped between the two writes leaves enough behind for [`withdraw`] to finish it.
async fn pair_with(
    state: &SharedState,
    store: &dyn ChangeFeedStore,
    me: &UserRef,
    own: &TicketEntity,
    candidate: &TicketEntity,
) -> Result<Step, ServiceError> {
    let opponent = UserRef {
        uid: candidate.uid.clone(),
        email: candidate.email.clone(),
    };
    let session = Session::paired(
        opponent,
        me.clone(),
        state.oracle().start_position(),
        own.time_control,
        epoch_millis(),
    );
    let session_id = store.create(SESSIONS, session.to_fields()?).await?;

    let claim_own = Guard::new()
        .field_eq(CLAIMED_BY, claimant(own.claimed_by.as_deref()))
        .field_eq(SESSION_ID, Value::Null);
    let stamp = Patch::new()
        .set(CLAIMED_BY, me.uid.as_str())
        .set(SESSION_ID, session_id.as_str());
    if !store.update_if(&ticket_path(&me.uid), claim_own, stamp).await? {
        debug!(uid = %me.uid, "own ticket changed; waiting to be paired");
        store.delete(&DocPath::new(SESSIONS, &session_id)).await?;
        return Ok(Step::Wait);
    }

    Ok(match finish_pairing(store, &me.uid, &session_id).await? {
        Some(found) => Step::Found(found),
        None => Step::Retry,
    })
}

/// Claim the white player of `session_id` for a pairing `uid` started.
///
/// Returns `None` after undoing the attempt when that ticket went to someone else.
async fn finish_pairing(
    store: &dyn ChangeFeedStore,
    uid: &str,
    session_id: &str,
) -> Result<Option<MatchFound>, ServiceError> {
    let own_path = ticket_path(uid);
    let session_path = DocPath::new(SESSIONS, session_id);
    let Some(document) = store.get(&session_path).await? else {
        release(store, uid, session_id).await?;
        return Ok(None);
    };
    let session = Session::from_document(&document)?;
    let opponent = session
        .players
        .get(Side::White)
        .cloned()
        .ok_or_else(|| ServiceError::InvalidState(format!("`{session_id}` has no white player")))?;

    let candidate_path = ticket_path(&opponent.uid);
    let claim_candidate = Guard::new()
        .field_eq(CLAIMED_BY, Value::Null)
        .field_eq(SESSION_ID, Value::Null);
    let pairing = Patch::new()
        .set(CLAIMED_BY, uid)
        .set(SESSION_ID, session_id);
    let claimed = store
        .update_if(&candidate_path, claim_candidate, pairing)
        .await?
        || carries_session(store, &candidate_path, session_id).await?;
    if !claimed {
        debug!(uid, candidate = %opponent.uid, "candidate taken; retrying");
        store.delete(&session_path).await?;
        release(store, uid, session_id).await?;
        return Ok(None);
    }

    store.delete(&own_path).await?;
    info!(session_id, white = %opponent.uid, black = uid, "paired players");
    Ok(Some(MatchFound {
        session_id: session_id.to_owned(),
        side: Side::Black,
        opponent,
    }))
}

/// Whether the ticket at `path` already points at `session_id`.
async fn carries_session(
    store: &dyn ChangeFeedStore,
    path: &DocPath,
    session_id: &str,
) -> Result<bool, ServiceError> {
    let Some(document) = store.get(path).await? else {
        return Ok(false);
    };
    let ticket: TicketEntity = document.decode()?;
    Ok(ticket.session_id.as_deref() == Some(session_id))
}

/// Reopen our ticket after a failed pairing attempt.
async fn release(
    store: &dyn ChangeFeedStore,
    uid: &str,
    session_id: &str,
) -> Result<(), ServiceError> {
    let guard = Guard::new()
        .field_eq(CLAIMED_BY, uid)
        .field_eq(SESSION_ID, session_id);
    let reopen = Patch::new()
        .set(CLAIMED_BY, Value::Null)
        .set(SESSION_ID, Value::Null);
    store.update_if(&ticket_path(uid), guard, reopen).await?;
    Ok(())
}

/// Settle a ticket of `uid` that carries a session id.
///
/// Our own claim means we were pairing and stopped before claiming the opponent.
async fn resolve(
    store: &dyn ChangeFeedStore,
    uid: &str,
    ticket: &TicketEntity,
    session_id: &str,
) -> Result<Option<MatchFound>, ServiceError> {
    if ticket.claimed_by.as_deref() == Some(uid) {
        finish_pairing(store, uid, session_id).await
    } else {
        accept_pairing(store, uid, session_id).await.map(Some)
    }
}

/// Take a pairing made by another client and retire the ticket.
async fn accept_pairing(
    store: &dyn ChangeFeedStore,
    uid: &str,
    session_id: &str,
) -> Result<MatchFound, ServiceError> {
    let document = store
        .get(&DocPath::new(SESSIONS, session_id))
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}`")))?;
    let session = Session::from_document(&document)?;
    let side = session.side_of(uid).ok_or_else(|| {
        ServiceError::InvalidState(format!("`{uid}` is not seated in `{session_id}`"))
    })?;
    let opponent = session
        .players
        .get(side.opponent())
        .cloned()
        .ok_or_else(|| ServiceError::InvalidState(format!("`{session_id}` has an empty seat")))?;

    store.delete(&ticket_path(uid)).await?;
    info!(session_id, uid, side = side.as_str(), "paired by opponent");
    Ok(MatchFound {
        session_id: session_id.to_owned(),
        side,
        opponent,
    })
}

/// Close a ticket so no pairer can take it, then delete it.
///
/// Returns the pairing instead when one landed first.
async fn withdraw(
    store: &dyn ChangeFeedStore,
    uid: &str,
) -> Result<Option<MatchFound>, ServiceError> {
    let path = ticket_path(uid);
    for _ in 0..WITHDRAW_ATTEMPTS {
        let Some(document) = store.get(&path).await? else {
            return Ok(None);
        };
        let ticket: TicketEntity = document.decode()?;
        if let Some(session_id) = &ticket.session_id {
            match resolve(store, uid, &ticket, session_id).await? {
                Some(found) => return Ok(Some(found)),
                None => continue,
            }
        }
        let close = Guard::new()
            .field_eq(CLAIMED_BY, claimant(ticket.claimed_by.as_deref()))
            .field_eq(SESSION_ID, Value::Null);
        if store
            .update_if(&path, close, Patch::new().set(CLAIMED_BY, uid))
            .await?
        {
            store.delete(&path).await?;
            debug!(uid, "ticket withdrawn");
            return Ok(None);
        }
    }
    Err(ServiceError::InvalidState(format!(
        "ticket of `{uid}` kept changing while withdrawing"
    )))
}

fn ticket_path(uid: &str) -> DocPath {
    DocPath::new(TICKETS, uid)
}

fn claimant(claimed_by: Option<&str>) -> Value {
    claimed_by.map_or(Value::Null, Value::from)
}
