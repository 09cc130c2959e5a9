use axum::{Json, Router, extract::State, routing::get};

use crate::{dto::health::HealthResponse, services::health_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/healthcheck",
    tag = "health",
    responses((status = 200, description = "Service health and live match count", body = HealthResponse))
)]
/// Return the current health status of the server and check the match store.
pub async fn healthcheck(State(state): State<SharedState>) -> Json<HealthResponse> {
    let status = health_service::health_status(&state).await;
    Json(status)
}

/// Configure the health routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{config::AppConfig, dao::memory::MemoryMatchStore, routes, state::AppState};

    async fn health(store: MemoryMatchStore) -> Value {
        let app = routes::router(AppState::new(Arc::new(store), AppConfig::default()));
        let resp = app
            .oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthy_store_reports_ok() {
        let body = health(MemoryMatchStore::new()).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live_matches"], 0);
    }

    #[tokio::test]
    async fn failing_store_reports_degraded() {
        let store = MemoryMatchStore::new();
        store.set_available(false);
        assert_eq!(health(store).await["status"], "degraded");
    }
}
