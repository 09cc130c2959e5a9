use uuid::Uuid;

use crate::{
    error::ServiceError,
    services::sse_events::broadcast_status_changed,
    state::{SharedState, lifecycle::MatchEvent, match_session::MatchSession},
};

/// Execute a gated lifecycle transition, then broadcast the resulting status change.
pub async fn run_transition_with_broadcast<F, Fut>(
    state: &SharedState,
    match_id: Uuid,
    event: MatchEvent,
    work: F,
) -> Result<MatchSession, ServiceError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<MatchSession, ServiceError>>,
{
    let (session, _status) = state.run_transition(match_id, event, work).await?;
    broadcast_status_changed(state, &session).await;
    Ok(session)
}
