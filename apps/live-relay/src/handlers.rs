use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::connection::serve_socket;
use crate::lifecycle::{Actor, LifecycleError};
use crate::registry::{RoomSnapshot, RoomStatus};
use crate::state::RelayState;

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .route("/rooms", post(create_room))
        .route("/rooms/:id", get(room_status))
        .route("/rooms/:id/start", post(start_room))
        .route("/rooms/:id/join", post(join_room))
        .route("/rooms/:id/end", post(end_room))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Lifecycle(LifecycleError),
    BadRequest(String),
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        ApiError::Lifecycle(err)
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

fn too_early() -> StatusCode {
    StatusCode::from_u16(425).unwrap_or(StatusCode::CONFLICT)
}

fn lifecycle_status(err: &LifecycleError) -> StatusCode {
    match err {
        LifecycleError::RoomNotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::RoomEnded(_) => StatusCode::GONE,
        LifecycleError::TooEarly { .. } => too_early(),
        LifecycleError::NotHost { .. } => StatusCode::FORBIDDEN,
        LifecycleError::InvalidTransition { .. }
        | LifecycleError::AlreadyExists(_)
        | LifecycleError::Registry(_) => StatusCode::CONFLICT,
        LifecycleError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Lifecycle(err) => {
                let status = lifecycle_status(&err);
                let body = ApiErrorBody {
                    error: err.reason().as_str(),
                    message: err.to_string(),
                    retry_after_secs: err.retry_after_secs(),
                };
                match body.retry_after_secs {
                    Some(secs) => (
                        status,
                        [(header::RETRY_AFTER, secs.to_string())],
                        Json(body),
                    )
                        .into_response(),
                    None => (status, Json(body)).into_response(),
                }
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad-request",
                    message,
                    retry_after_secs: None,
                }),
            )
                .into_response(),
        }
    }
}

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn actor(actor_id: Option<String>) -> Actor {
    match actor_id {
        Some(id) if !id.trim().is_empty() => Actor::Member(id),
        _ => Actor::Admin,
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// `ws(s)://` endpoint for a public `http(s)://` base.
pub fn websocket_url(base_http: &str) -> String {
    let base = normalize_base_url(base_http);
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}/ws", ws_base)
}

/// GET /health
pub async fn health_check(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.registry.len(),
    }))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub room_id: String,
    pub host_id: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// POST /rooms
pub async fn create_room(
    State(state): State<RelayState>,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomSnapshot>), ApiError> {
    require(&payload.room_id, "room_id")?;
    require(&payload.host_id, "host_id")?;
    let snapshot = state
        .lifecycle
        .create(&payload.room_id, &payload.host_id, payload.scheduled_for)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /rooms/:id
pub async fn room_status(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
) -> ApiResult<RoomSnapshot> {
    Ok(Json(state.lifecycle.describe(&room_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActorRequest {
    #[serde(default)]
    pub actor_id: Option<String>,
}

/// POST /rooms/:id/start
pub async fn start_room(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(payload): Json<ActorRequest>,
) -> ApiResult<RoomSnapshot> {
    state.lifecycle.describe(&room_id).await?;
    let snapshot = state.lifecycle.start(&room_id, &actor(payload.actor_id))?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct JoinRoomRequest {
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JoinRoomResponse {
    pub room_id: String,
    pub user_id: String,
    pub status: RoomStatus,
    pub websocket_url: String,
}

/// POST /rooms/:id/join
///
/// Pre-flight only: confirms the room accepts joins and hands back the socket endpoint. The
/// member is registered when the client sends `join-room` over that socket.
pub async fn join_room(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(payload): Json<JoinRoomRequest>,
) -> ApiResult<JoinRoomResponse> {
    require(&payload.user_id, "user_id")?;
    let snapshot = state.lifecycle.ensure_room(&room_id).await?;
    if snapshot.status == RoomStatus::Ended {
        return Err(LifecycleError::RoomEnded(room_id).into());
    }
    debug!(
        room_id = %room_id,
        user_id = %payload.user_id,
        user_name = payload.user_name.as_deref().unwrap_or_default(),
        "join pre-flight"
    );
    Ok(Json(JoinRoomResponse {
        websocket_url: websocket_url(&state.config.public_base_url()),
        room_id,
        user_id: payload.user_id,
        status: snapshot.status,
    }))
}

#[derive(Debug, Serialize)]
pub struct EndRoomResponse {
    pub room_id: String,
    pub status: RoomStatus,
    pub notified: usize,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
}

/// POST /rooms/:id/end
pub async fn end_room(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
    Json(payload): Json<ActorRequest>,
) -> ApiResult<EndRoomResponse> {
    state.lifecycle.describe(&room_id).await?;
    let report = state.lifecycle.end(&room_id, &actor(payload.actor_id))?;
    let duration_secs = match (report.snapshot.started_at, report.snapshot.ended_at) {
        (Some(started), Some(ended)) => (ended - started).num_seconds().max(0) as u64,
        _ => 0,
    };
    Ok(Json(EndRoomResponse {
        room_id,
        status: report.snapshot.status,
        notified: report.notified,
        ended_at: report.snapshot.ended_at,
        duration_secs,
    }))
}
