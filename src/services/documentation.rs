use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the Study Arena match backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::matches::create_match,
        crate::routes::matches::join_match,
        crate::routes::matches::get_match,
        crate::routes::matches::list_room_matches,
        crate::routes::matches::end_match,
        crate::routes::matches::pause_match,
        crate::routes::matches::resume_match,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::matches::CreateMatchRequest,
            crate::dto::matches::MatchConfigInput,
            crate::dto::matches::JoinMatchRequest,
            crate::dto::matches::MatchSessionDto,
            crate::dto::matches::MatchPlayerDto,
            crate::dto::matches::MatchConfigDto,
            crate::dto::matches::MatchResultDto,
            crate::dto::matches::PlayerRankingDto,
            crate::dto::matches::MatchStateResponse,
            crate::dto::ws::Envelope,
            crate::dto::ws::MessageKind,
            crate::dto::ws::PlayerActionData,
            crate::dto::ws::PlayerJoinedEvent,
            crate::dto::ws::PlayerLeftEvent,
            crate::dto::ws::ScoreUpdateEvent,
            crate::dto::ws::StateChangedEvent,
            crate::dto::ws::MatchEndEvent,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "matches", description = "Match lifecycle control plane"),
        (name = "realtime", description = "WebSocket channel for match participants"),
    )
)]
pub struct ApiDoc;
