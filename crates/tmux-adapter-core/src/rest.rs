//! REST surface for agent management. Thin re-use of the core: the same
//! registry snapshots, nudge locks and command façade as the WebSocket path.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::is_authorized;
use crate::nudge::nudge_session;
use crate::ws::WsServer;

/// Request body cap for prompt submissions.
const MAX_PROMPT_BODY: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct PromptBody {
    #[serde(default)]
    prompt: String,
}

/// Router slice owning `/api/agents` and its sub-paths.
pub fn router(server: Arc<WsServer>) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:name", get(get_agent).delete(kill_agent))
        .route(
            "/api/agents/:name/prompt",
            post(send_prompt).layer(DefaultBodyLimit::max(MAX_PROMPT_BODY)),
        )
        .route("/api/agents/:name/screen", get(capture_screen))
        .with_state(server)
}

fn check_auth(
    server: &WsServer,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), Response> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if is_authorized(
        &server.auth_token,
        authorization,
        query.get("token").map(String::as_str),
    ) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response())
    }
}

async fn list_agents(
    State(server): State<Arc<WsServer>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = check_auth(&server, &headers, &query) {
        return resp;
    }
    let agents = server.registry.get_agents().await;
    Json(json!({ "agents": agents })).into_response()
}

async fn get_agent(
    State(server): State<Arc<WsServer>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(name): Path<String>,
) -> Response {
    if let Err(resp) = check_auth(&server, &headers, &query) {
        return resp;
    }
    match server.registry.get_agent(&name).await {
        Some(agent) => Json(json!({ "agent": agent })).into_response(),
        None => agent_not_found(),
    }
}

async fn send_prompt(
    State(server): State<Arc<WsServer>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(name): Path<String>,
    body: Option<Json<PromptBody>>,
) -> Response {
    if let Err(resp) = check_auth(&server, &headers, &query) {
        return resp;
    }

    let Some(agent) = server.registry.get_agent(&name).await else {
        return agent_not_found();
    };

    let prompt = body.map(|Json(b)| b.prompt).unwrap_or_default();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "prompt field required"})),
        )
            .into_response();
    }

    let lock = server.nudge_locks.lock_for(&name);
    let _guard = lock.lock().await;

    match nudge_session(server.mux.as_ref(), &agent, &prompt).await {
        Ok(()) => {
            info!(agent = %name, "prompt delivered via REST");
            Json(json!({"ok": true})).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn capture_screen(
    State(server): State<Arc<WsServer>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(name): Path<String>,
) -> Response {
    if let Err(resp) = check_auth(&server, &headers, &query) {
        return resp;
    }

    if server.registry.get_agent(&name).await.is_none() {
        return agent_not_found();
    }

    match server.mux.capture_pane_visible(&name).await {
        Ok(screen) => Json(json!({ "screen": screen })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn kill_agent(
    State(server): State<Arc<WsServer>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(name): Path<String>,
) -> Response {
    if let Err(resp) = check_auth(&server, &headers, &query) {
        return resp;
    }

    if server.registry.get_agent(&name).await.is_none() {
        return agent_not_found();
    }

    match server.mux.kill_session(&name).await {
        Ok(()) => {
            info!(agent = %name, "session killed via REST");
            Json(json!({"ok": true})).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

fn agent_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "agent not found"})),
    )
        .into_response()
}
