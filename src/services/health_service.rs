use tracing::warn;

use crate::{
    dto::health::HealthResponse,
    state::{SharedState, match_session::MatchStatus},
};

/// Check the match store and report how many matches accept writes.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let store = state.store();
    if let Err(err) = store.health_check().await {
        warn!(error = %err, "match store health check failed");
        return HealthResponse::degraded();
    }

    match store.list_matches().await {
        Ok(matches) => HealthResponse::ok(
            matches
                .iter()
                .filter(|session| session.status == MatchStatus::InProgress)
                .count(),
        ),
        Err(err) => {
            warn!(error = %err, "failed to list matches during health check");
            HealthResponse::degraded()
        }
    }
}
