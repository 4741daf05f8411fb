use crate::error::RelayError;
use crate::server::AppContext;
use crate::streaming::{SessionId, SessionInfo};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use streamrelay_av::{check_tools, Delivery};

pub fn api_routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/profiles", get(list_profiles))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(cancel_session))
        .route("/tools", get(get_tools))
}

async fn health(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "active_sessions": ctx.sessions.active_count(),
    }))
}

#[derive(Serialize)]
struct ProfileSummary {
    name: String,
    content_type: Option<String>,
    delivery: Delivery,
}

async fn list_profiles(State(ctx): State<AppContext>) -> Json<Vec<ProfileSummary>> {
    let profiles = ctx
        .profiles
        .iter()
        .map(|p| ProfileSummary {
            name: p.name.clone(),
            content_type: p.content_type.clone(),
            delivery: p.delivery,
        })
        .collect();

    Json(profiles)
}

#[derive(Deserialize)]
struct ListSessionsQuery {
    /// Include finished sessions still inside the retention window
    #[serde(default)]
    all: bool,
}

async fn list_sessions(
    State(ctx): State<AppContext>,
    Query(params): Query<ListSessionsQuery>,
) -> Json<Vec<SessionInfo>> {
    let mut sessions = ctx.sessions.list();
    if !params.all {
        sessions.retain(|s| !s.state.is_terminal());
    }
    Json(sessions)
}

fn parse_id(id: &str) -> Result<SessionId, RelayError> {
    id.parse()
        .map_err(|_| RelayError::SessionNotFound(id.to_string()))
}

async fn get_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, RelayError> {
    let id = parse_id(&id)?;
    ctx.sessions
        .get(&id)
        .map(Json)
        .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))
}

async fn cancel_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let id = parse_id(&id)?;
    let state = ctx.sessions.cancel(&id)?;

    Ok(Json(serde_json::json!({
        "id": id,
        "state": state,
    })))
}

async fn get_tools(State(ctx): State<AppContext>) -> Result<impl IntoResponse, RelayError> {
    let ffmpeg = ctx.config.tools.ffmpeg.to_string_lossy().to_string();
    let ffprobe = ctx.config.tools.ffprobe.to_string_lossy().to_string();

    // Runs each binary with -version
    let tools = tokio::task::spawn_blocking(move || check_tools(&ffmpeg, &ffprobe))
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?;

    Ok(Json(tools))
}
