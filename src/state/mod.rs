/// Match status state machine with two-phase transitions.
pub mod lifecycle;
/// Match, event and streak model.
pub mod match_session;
mod sse;
/// Side effects run alongside lifecycle transitions.
pub mod transitions;

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::match_store::MatchStore,
    error::ServiceError,
    state::{
        lifecycle::{MatchEvent, MatchLifecycle, Plan},
        match_session::MatchStatus,
    },
};

pub use self::sse::SseHub;
use self::sse::SseState;

/// Handle to [`AppState`] shared by every request.
pub type SharedState = Arc<AppState>;
/// Bound on a single lifecycle transition.
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);

/// Central application state: the match store, SSE hubs and per-match lifecycles.
pub struct AppState {
    store: Arc<dyn MatchStore>,
    config: AppConfig,
    sse: SseState,
    /// Lifecycle of every known match. Each mutex is that match's transition gate.
    lifecycles: DashMap<Uuid, Arc<Mutex<MatchLifecycle>>>,
    live_match: RwLock<Option<Uuid>>,
    transition_timeout: Option<Duration>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(store: Arc<dyn MatchStore>, config: AppConfig) -> SharedState {
        let capacity = config.server.channel_capacity;
        Arc::new(Self {
            store,
            config,
            sse: SseState::new(capacity),
            lifecycles: DashMap::new(),
            live_match: RwLock::new(None),
            transition_timeout: Some(DEFAULT_TRANSITION_TIMEOUT),
        })
    }

    /// Match store backend.
    pub fn store(&self) -> Arc<dyn MatchStore> {
        self.store.clone()
    }

    /// Configuration loaded at startup.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Broadcast hub of one match.
    pub fn match_sse(&self, match_id: Uuid) -> SseHub {
        self.sse.match_hub(match_id)
    }

    /// Drop the push hub of a match that no longer streams.
    pub fn retire_match_sse(&self, match_id: Uuid) {
        self.sse.retire(match_id);
    }

    /// Broadcast hub used for the dashboard ticker stream.
    pub fn live_sse(&self) -> &SseHub {
        self.sse.live()
    }

    /// Match currently shown on the dashboard ticker, if any.
    pub async fn live_match(&self) -> Option<Uuid> {
        *self.live_match.read().await
    }

    /// Point the live ticker at `match_id`.
    pub async fn set_live_match(&self, match_id: Uuid) {
        self.live_match.write().await.replace(match_id);
    }

    /// Clear the ticker only if it still shows `match_id`; returns whether it did.
    pub async fn clear_live_match(&self, match_id: Uuid) -> bool {
        let mut guard = self.live_match.write().await;
        if *guard == Some(match_id) {
            guard.take();
            true
        } else {
            false
        }
    }

    /// Register the lifecycle of a match, keeping an existing one untouched.
    pub fn track_lifecycle(&self, match_id: Uuid, status: MatchStatus) {
        self.lifecycles
            .entry(match_id)
            .or_insert_with(|| Arc::new(Mutex::new(MatchLifecycle::new(status))));
    }

    async fn lifecycle(&self, match_id: Uuid) -> Result<Arc<Mutex<MatchLifecycle>>, ServiceError> {
        if let Some(entry) = self.lifecycles.get(&match_id) {
            return Ok(entry.clone());
        }
        let session = self
            .store
            .find_match(match_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))?;
        self.track_lifecycle(match_id, session.status);
        self.lifecycles
            .get(&match_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("match `{match_id}` not found")))
    }

    /// Hold the transition gate of a match for a write that does not change its status.
    pub async fn lock_match(
        &self,
        match_id: Uuid,
    ) -> Result<OwnedMutexGuard<MatchLifecycle>, ServiceError> {
        Ok(self.lifecycle(match_id).await?.lock_owned().await)
    }

    /// Plan a lifecycle transition, run `work`, then apply the plan on success or abort it
    /// on failure. Transitions of one match are serialized; others proceed in parallel.
    pub async fn run_transition<F, Fut, T>(
        &self,
        match_id: Uuid,
        event: MatchEvent,
        work: F,
    ) -> Result<(T, MatchStatus), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let lifecycle = self.lifecycle(match_id).await?;
        let mut gate = lifecycle.lock().await;
        let Plan { id: plan_id, .. } = gate.plan(event)?;

        let work_future = work();
        let outcome = if let Some(limit) = self.transition_timeout {
            match timeout(limit, work_future).await {
                Ok(result) => result,
                Err(_) => {
                    if let Err(abort_err) = gate.abort(plan_id) {
                        warn!(
                            match_id = %match_id,
                            event = ?event,
                            error = ?abort_err,
                            "failed to abort transition after timeout"
                        );
                    }
                    return Err(ServiceError::Timeout);
                }
            }
        } else {
            work_future.await
        };

        match outcome {
            Ok(value) => {
                let next = gate.apply(plan_id)?;
                Ok((value, next))
            }
            Err(err) => {
                if let Err(abort_err) = gate.abort(plan_id) {
                    warn!(
                        match_id = %match_id,
                        event = ?event,
                        error = ?abort_err,
                        "failed to abort transition after work error"
                    );
                }
                Err(err)
            }
        }
    }
}
