use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::matches::{
        CreateMatchRequest, FinishRequest, GoalSubmission, MatchDetail, StreakAdjustment,
        SubstitutionRequest, TieBreakRequest,
    },
    error::AppError,
    services::match_service,
    state::{SharedState, match_session::StatEvent},
};

/// Routes of the authoritative match log.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/matches", post(create_match))
        .route("/matches/{id}", get(get_match))
        .route("/matches/{id}/stats", get(list_stats))
        .route("/matches/{id}/stats/{stat_id}", delete(remove_stat))
        .route("/matches/{id}/goals", post(record_goal))
        .route("/matches/{id}/substitutions", post(record_substitution))
        .route("/matches/{id}/streak", post(adjust_streak))
        .route("/matches/{id}/tie-break", post(resolve_tie_break))
        .route("/matches/{id}/finish", post(finish_match))
}

/// Start a match: rosters fixed, scores zeroed, clock anchored on the server.
#[utoipa::path(
    post,
    path = "/matches",
    tag = "matches",
    request_body = CreateMatchRequest,
    responses(
        (status = 200, description = "Match started", body = MatchDetail),
        (status = 400, description = "Invalid rosters or streak counters")
    )
)]
pub async fn create_match(
    State(state): State<SharedState>,
    Json(payload): Json<CreateMatchRequest>,
) -> Result<Json<MatchDetail>, AppError> {
    payload.validate()?;
    let detail = match_service::create_match(&state, payload).await?;
    Ok(Json(detail))
}

/// Current detail of one match.
#[utoipa::path(
    get,
    path = "/matches/{id}",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses(
        (status = 200, description = "Match detail", body = MatchDetail),
        (status = 404, description = "Unknown match")
    )
)]
pub async fn get_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchDetail>, AppError> {
    Ok(Json(match_service::get_match(&state, id).await?))
}

/// Authoritative event log, in append order.
#[utoipa::path(
    get,
    path = "/matches/{id}/stats",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses((status = 200, description = "Event log", body = [StatEvent]))
)]
pub async fn list_stats(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatEvent>>, AppError> {
    Ok(Json(match_service::list_stats(&state, id).await?))
}

/// Append a goal. Safe to retry with the same idempotency key.
#[utoipa::path(
    post,
    path = "/matches/{id}/goals",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    request_body = GoalSubmission,
    responses(
        (status = 200, description = "Stored goal event", body = StatEvent),
        (status = 403, description = "Match no longer accepts writes")
    )
)]
pub async fn record_goal(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<GoalSubmission>,
) -> Result<Json<StatEvent>, AppError> {
    payload.validate()?;
    Ok(Json(match_service::record_goal(&state, id, payload).await?))
}

/// Swap a fielded player with a bench player.
#[utoipa::path(
    post,
    path = "/matches/{id}/substitutions",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    request_body = SubstitutionRequest,
    responses(
        (status = 200, description = "Stored substitution event", body = StatEvent),
        (status = 403, description = "Match no longer accepts writes")
    )
)]
pub async fn record_substitution(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubstitutionRequest>,
) -> Result<Json<StatEvent>, AppError> {
    payload.validate()?;
    Ok(Json(
        match_service::record_substitution(&state, id, payload).await?,
    ))
}

/// Remove one event and recompute the score.
#[utoipa::path(
    delete,
    path = "/matches/{id}/stats/{stat_id}",
    tag = "matches",
    params(
        ("id" = Uuid, Path, description = "Match identifier"),
        ("stat_id" = Uuid, Path, description = "Event identifier")
    ),
    responses((status = 200, description = "Match after the correction", body = MatchDetail))
)]
pub async fn remove_stat(
    State(state): State<SharedState>,
    Path((id, stat_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MatchDetail>, AppError> {
    Ok(Json(match_service::remove_stat(&state, id, stat_id).await?))
}

/// Overwrite the streak counters by hand.
#[utoipa::path(
    post,
    path = "/matches/{id}/streak",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    request_body = StreakAdjustment,
    responses((status = 200, description = "Adjusted match", body = MatchDetail))
)]
pub async fn adjust_streak(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StreakAdjustment>,
) -> Result<Json<MatchDetail>, AppError> {
    Ok(Json(match_service::adjust_streak(&state, id, payload).await?))
}

/// Record who won the tie-break of a plain draw.
#[utoipa::path(
    post,
    path = "/matches/{id}/tie-break",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    request_body = TieBreakRequest,
    responses(
        (status = 200, description = "Streak settled by the tie-break", body = MatchDetail),
        (status = 409, description = "No tie-break pending")
    )
)]
pub async fn resolve_tie_break(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TieBreakRequest>,
) -> Result<Json<MatchDetail>, AppError> {
    Ok(Json(
        match_service::resolve_tie_break(&state, id, payload).await?,
    ))
}

/// Final whistle. Succeeds exactly once per match.
#[utoipa::path(
    post,
    path = "/matches/{id}/finish",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    request_body = FinishRequest,
    responses(
        (status = 200, description = "Finished match", body = MatchDetail),
        (status = 409, description = "Match already finished")
    )
)]
pub async fn finish_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FinishRequest>,
) -> Result<Json<MatchDetail>, AppError> {
    payload.validate()?;
    Ok(Json(match_service::finish_match(&state, id, payload).await?))
}
