use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use uuid::Uuid;

use crate::{
    error::{AppError, ServiceError},
    services::websocket_service,
    state::SharedState,
};

/// Header carrying the user id authenticated by the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

#[utoipa::path(
    get,
    path = "/matches/{id}/ws",
    tag = "realtime",
    params(
        ("id" = Uuid, Path, description = "Match identifier"),
        ("x-user-id" = String, Header, description = "Authenticated user id")
    ),
    responses(
        (status = 101, description = "Switching protocols to WebSocket"),
        (status = 401, description = "Missing user id or user not on the roster"),
        (status = 404, description = "Match is not live")
    )
)]
/// Attach a rostered player to a live match over WebSocket.
pub async fn ws_handler(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized(format!("missing `{USER_ID_HEADER}` header")))?
        .to_owned();

    let handle = websocket_service::authorize(&state, id, &user_id).await?;
    Ok(ws.on_upgrade(move |socket| {
        websocket_service::handle_socket(state, socket, handle, user_id)
    }))
}

/// Configure the WebSocket endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/matches/{id}/ws", get(ws_handler))
}
