use axum::Router;

use crate::state::SharedState;

/// OpenAPI and Swagger UI routes.
pub mod docs;
/// Health check route.
pub mod health;
/// Match, goal and finish endpoints.
pub mod matches;
/// Push streams.
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(sse::router())
        .merge(matches::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
