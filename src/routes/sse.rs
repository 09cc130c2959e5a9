use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;
use uuid::Uuid;

use crate::{error::AppError, services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/matches/{id}",
    tag = "sse",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses(
        (status = 200, description = "Match event stream: init, goal, finish, ping", content_type = "text/event-stream", body = String),
        (status = 404, description = "Unknown match")
    )
)]
/// Stream the events of one match, starting with an `init` snapshot.
pub async fn match_stream(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let subscription = sse_service::subscribe_match(&state, id).await?;
    info!(match_id = %id, "new match SSE connection");
    Ok(sse_service::to_sse_stream(
        subscription,
        state.config().server.ping_interval,
    ))
}

#[utoipa::path(
    get,
    path = "/sse/live",
    tag = "sse",
    responses((status = 200, description = "Dashboard ticker: inactive, or the live match's events", content_type = "text/event-stream", body = String))
)]
/// Stream whichever match is currently live.
pub async fn live_stream(
    State(state): State<SharedState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let subscription = sse_service::subscribe_live(&state).await?;
    info!("new live ticker SSE connection");
    Ok(sse_service::to_sse_stream(
        subscription,
        state.config().server.ping_interval,
    ))
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/sse/matches/{id}", get(match_stream))
        .route("/sse/live", get(live_stream))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use futures::StreamExt;
    use indexmap::IndexSet;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::{match_store::MatchStore, memory::MemoryMatchStore},
        routes,
        state::{
            AppState,
            match_session::{MatchSession, StreakPair},
        },
    };

    async fn first_frame(app: axum::Router, uri: &str) -> (StatusCode, String, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut body = resp.into_body().into_data_stream();
        let frame = match body.next().await {
            Some(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => String::new(),
        };
        (status, content_type, frame)
    }

    #[tokio::test]
    async fn match_stream_opens_with_init() {
        let store = MemoryMatchStore::new();
        let mut session = MatchSession::schedule(
            IndexSet::from([Uuid::new_v4()]),
            IndexSet::from([Uuid::new_v4()]),
            IndexSet::new(),
            StreakPair::default(),
        );
        session.begin(1_000);
        let id = session.id;
        store.save_match(session).await.unwrap();
        let app = routes::router(AppState::new(Arc::new(store), AppConfig::default()));

        let (status, content_type, frame) =
            first_frame(app, &format!("/sse/matches/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/event-stream"));
        assert!(frame.contains("event: init"), "{frame}");
        assert!(frame.contains("\"black_goals\":0"), "{frame}");
    }

    #[tokio::test]
    async fn live_stream_reports_inactive_without_live_match() {
        let app = routes::router(AppState::new(
            Arc::new(MemoryMatchStore::new()),
            AppConfig::default(),
        ));
        let (status, _, frame) = first_frame(app, "/sse/live").await;
        assert_eq!(status, StatusCode::OK);
        assert!(frame.contains("event: inactive"), "{frame}");
    }

    #[tokio::test]
    async fn unknown_match_stream_is_not_found() {
        let app = routes::router(AppState::new(
            Arc::new(MemoryMatchStore::new()),
            AppConfig::default(),
        ));
        let (status, _, _) = first_frame(app, &format!("/sse/matches/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
