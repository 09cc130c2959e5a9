use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the live match server.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::matches::create_match,
        crate::routes::matches::get_match,
        crate::routes::matches::list_stats,
        crate::routes::matches::record_goal,
        crate::routes::matches::record_substitution,
        crate::routes::matches::remove_stat,
        crate::routes::matches::adjust_streak,
        crate::routes::matches::resolve_tie_break,
        crate::routes::matches::finish_match,
        crate::routes::sse::match_stream,
        crate::routes::sse::live_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::matches::CreateMatchRequest,
            crate::dto::matches::MatchDetail,
            crate::dto::matches::GoalSubmission,
            crate::dto::matches::SubstitutionRequest,
            crate::dto::matches::StreakAdjustment,
            crate::dto::matches::FinishRequest,
            crate::dto::matches::TieBreakRequest,
            crate::dto::sse::InitEvent,
            crate::dto::sse::GoalEvent,
            crate::dto::sse::FinishEvent,
            crate::dto::sse::PingEvent,
            crate::state::match_session::StatEvent,
            crate::state::match_session::StatKind,
            crate::state::match_session::Team,
            crate::state::match_session::MatchStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "matches", description = "Authoritative match log and lifecycle"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
/// OpenAPI document of the whole HTTP surface.
pub struct ApiDoc;
