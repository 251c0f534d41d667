use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::matches::{
        CreateMatchRequest, JoinMatchRequest, MatchPlayerDto, MatchSessionDto, MatchStateResponse,
    },
    error::AppError,
    services::match_service,
    state::SharedState,
};

/// Control-plane routes for match sessions.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/matches", post(create_match))
        .route("/matches/{id}", get(get_match))
        .route("/matches/{id}/join", post(join_match))
        .route("/matches/{id}/end", post(end_match))
        .route("/matches/{id}/pause", post(pause_match))
        .route("/matches/{id}/resume", post(resume_match))
        .route("/rooms/{room_id}/matches", get(list_room_matches))
}

/// Create a lobby, start its coordinator and enroll the creator.
#[utoipa::path(
    post,
    path = "/matches",
    tag = "matches",
    request_body = CreateMatchRequest,
    responses(
        (status = 201, description = "Match created", body = MatchSessionDto),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn create_match(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateMatchRequest>>,
) -> Result<(StatusCode, Json<MatchSessionDto>), AppError> {
    let session = match_service::create_match(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(MatchSessionDto::from(&session))))
}

/// Join a match that is still in its lobby.
#[utoipa::path(
    post,
    path = "/matches/{id}/join",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    request_body = JoinMatchRequest,
    responses(
        (status = 200, description = "Player added to the roster", body = MatchPlayerDto),
        (status = 404, description = "Unknown match"),
        (status = 409, description = "Match already started, full, or already joined")
    )
)]
pub async fn join_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<JoinMatchRequest>>,
) -> Result<Json<MatchPlayerDto>, AppError> {
    let player = match_service::join_match(&state, id, payload).await?;
    Ok(Json(MatchPlayerDto::from(&player)))
}

/// Stored session of a match, live or completed.
#[utoipa::path(
    get,
    path = "/matches/{id}",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses(
        (status = 200, description = "Stored match session", body = MatchSessionDto),
        (status = 404, description = "Unknown match")
    )
)]
pub async fn get_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchSessionDto>, AppError> {
    let session = match_service::get_match(&state, id).await?;
    Ok(Json(MatchSessionDto::from(&session)))
}

/// Matches of a room that have not completed yet.
#[utoipa::path(
    get,
    path = "/rooms/{room_id}/matches",
    tag = "matches",
    params(("room_id" = String, Path, description = "Room identifier")),
    responses((status = 200, description = "Open matches", body = [MatchSessionDto]))
)]
pub async fn list_room_matches(
    State(state): State<SharedState>,
    Path(room_id): Path<String>,
) -> Result<Json<Vec<MatchSessionDto>>, AppError> {
    let sessions = match_service::get_active_matches(&state, &room_id).await?;
    Ok(Json(sessions.iter().map(MatchSessionDto::from).collect()))
}

/// Ask the coordinator to finish the match; results follow on the WebSocket.
#[utoipa::path(
    post,
    path = "/matches/{id}/end",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses(
        (status = 202, description = "Completion requested"),
        (status = 404, description = "Match is not live")
    )
)]
pub async fn end_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    match_service::end_match(&state, id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Suspend an active match.
#[utoipa::path(
    post,
    path = "/matches/{id}/pause",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses(
        (status = 200, description = "Match paused", body = MatchStateResponse),
        (status = 404, description = "Match is not live"),
        (status = 409, description = "Match is not active")
    )
)]
pub async fn pause_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchStateResponse>, AppError> {
    let next = match_service::pause_match(&state, id).await?;
    Ok(Json(MatchStateResponse::new(id, next)))
}

/// Resume a paused match.
#[utoipa::path(
    post,
    path = "/matches/{id}/resume",
    tag = "matches",
    params(("id" = Uuid, Path, description = "Match identifier")),
    responses(
        (status = 200, description = "Match resumed", body = MatchStateResponse),
        (status = 404, description = "Match is not live"),
        (status = 409, description = "Match is not paused")
    )
)]
pub async fn resume_match(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchStateResponse>, AppError> {
    let next = match_service::resume_match(&state, id).await?;
    Ok(Json(MatchStateResponse::new(id, next)))
}
