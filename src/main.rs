//! chess-duel binary: pairs two local players through matchmaking and plays a short
//! scripted game over the configured change-feed store.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chess_duel::{
    config::EngineConfig,
    dao::{change_feed::ChangeFeedStore, change_feed::memory::MemoryStore, storage::StorageError},
    services::{history, matchmaking, session_service, storage_supervisor},
    state::{
        EngineState, SharedState,
        oracle::StandardChess,
        session::{SessionStatus, UserRef},
    },
};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SCHOLARS_MATE: [(&str, &str); 7] = [
    ("e2", "e4"),
    ("e7", "e5"),
    ("f1", "c4"),
    ("b8", "c6"),
    ("d1", "h5"),
    ("g8", "f6"),
    ("h5", "f7"),
];

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let state = EngineState::new(EngineConfig::load(), Arc::new(StandardChess));
    let supervisor = spawn_supervisor(state.clone());

    let mut degraded = state.degraded_watcher();
    tokio::time::timeout(STEP_TIMEOUT, degraded.wait_for(|degraded| !degraded))
        .await
        .context("waiting for the change-feed store")?
        .context("engine state dropped")?;

    let alice = UserRef::new("alice").with_email("alice@example.com");
    let bob = UserRef::new("bob").with_email("bob@example.com");
    let (first, second) = tokio::join!(
        matchmaking::find_match(&state, alice.clone(), None),
        matchmaking::find_match(&state, bob.clone(), None),
    );
    let (first, _) = (first.context("alice matchmaking")?, second.context("bob matchmaking")?);
    info!(session_id = %first.session_id, alice_side = first.side.as_str(), "match found");

    let alice_client = session_service::open_session(&state, alice, &first.session_id).await?;
    let bob_client = session_service::open_session(&state, bob, &first.session_id).await?;
    alice_client
        .wait_until(STEP_TIMEOUT, |session| session.status == SessionStatus::Playing)
        .await?;

    for (from, to) in SCHOLARS_MATE {
        let session = alice_client
            .wait_until(STEP_TIMEOUT, |session| {
                session.status == SessionStatus::Playing
            })
            .await?;
        let mover = if session.turn == first.side {
            &alice_client
        } else {
            &bob_client
        };
        let ply = session.ply();
        mover.make_move(from, to).await?;
        for client in [&alice_client, &bob_client] {
            client
                .wait_until(STEP_TIMEOUT, |session| session.ply() > ply)
                .await?;
        }
        if let Some(view) = alice_client.view() {
            info!(ply = view.ply, banner = %view.banner, "{from}{to}");
        }
    }

    let finished = alice_client
        .wait_until(STEP_TIMEOUT, |session| session.rating_applied)
        .await?;
    info!(
        result = finished.result.as_str(),
        cause = finished.termination_cause.as_str(),
        "game over"
    );

    // Records land right after the rating claim.
    sleep(Duration::from_millis(200)).await;
    let store = state.require_store().await?;
    for uid in ["alice", "bob"] {
        let stats = history::player_stats(store.as_ref(), uid).await?;
        info!(uid, total = stats.total, wins = stats.wins, losses = stats.losses, win_rate = stats.win_rate, "player stats");
    }

    alice_client.leave();
    bob_client.leave();
    supervisor.abort();
    Ok(())
}

/// Supervise CouchDB when `COUCH_BASE_URL` is set, otherwise an in-memory store.
fn spawn_supervisor(state: SharedState) -> tokio::task::JoinHandle<()> {
    #[cfg(feature = "couch-store")]
    if std::env::var("COUCH_BASE_URL").is_ok() {
        use chess_duel::dao::change_feed::couchdb::{CouchConfig, CouchStore};

        info!("using CouchDB change-feed store");
        return tokio::spawn(storage_supervisor::run(state, || async {
            let config = CouchConfig::from_env()?;
            let store = CouchStore::connect(config).await?;
            Ok::<_, StorageError>(Arc::new(store) as Arc<dyn ChangeFeedStore>)
        }));
    }

    info!("using in-memory change-feed store");
    let store = MemoryStore::new();
    tokio::spawn(storage_supervisor::run(state, move || {
        let store = store.clone();
        async move { Ok::<_, StorageError>(Arc::new(store) as Arc<dyn ChangeFeedStore>) }
    }))
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
