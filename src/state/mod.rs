/// Local countdown and clock display helpers.
pub mod clock;
/// Chess rules behind a trait.
pub mod oracle;
/// The shared session record.
pub mod session;
/// Pure transition planning over session records.
pub mod state_machine;
/// Guarded writes of planned transitions.
pub mod transitions;

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::{RwLock, watch};

use crate::{
    config::EngineConfig, dao::change_feed::ChangeFeedStore, error::ServiceError,
    state::oracle::RulesOracle,
};

pub use self::state_machine::{Plan, PlanError, TransitionOutcome};

/// Handle to the engine state shared by every client and task.
pub type SharedState = Arc<EngineState>;

/// Process-wide engine state: the store handle, configuration and rules oracle.
pub struct EngineState {
    store: RwLock<Option<Arc<dyn ChangeFeedStore>>>,
    degraded: watch::Sender<bool>,
    config: EngineConfig,
    oracle: Arc<dyn RulesOracle>,
}

impl EngineState {
    /// Construct a new [`EngineState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The engine starts in degraded mode until a store is installed.
    pub fn new(config: EngineConfig, oracle: Arc<dyn RulesOracle>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            store: RwLock::new(None),
            degraded: degraded_tx,
            config,
            oracle,
        })
    }

    /// Obtain a handle to the current store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn ChangeFeedStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Store handle for an intent; fails fast while degraded.
    pub async fn require_store(&self) -> Result<Arc<dyn ChangeFeedStore>, ServiceError> {
        if self.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a store implementation and leave degraded mode.
    pub async fn install_store(&self, store: Arc<dyn ChangeFeedStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current store and enter degraded mode.
    pub async fn clear_store(&self) {
        {
            let mut guard = self.store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Configuration loaded at startup.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Chess rules used by every plan.
    pub fn oracle(&self) -> &dyn RulesOracle {
        self.oracle.as_ref()
    }
}

/// Wall-clock milliseconds since the Unix epoch, as stored in records.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
