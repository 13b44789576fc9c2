use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use elisa_orchestrator::controller::PipelineController;
use elisa_runtime::workspace::WorkspaceManager;
use elisa_types::RestartMode;
use elisa_wire::{
    event_kind, parse_spec, AgentSdkStatus, ApiKeyStatus, CreateSessionRequest, CreateSessionResponse,
    GateRequest, AnswerRequest, HealthResponse, HealthStatus, InternalConfigRequest, InternalConfigResponse,
    StatusResponse, WorkspaceInspectRequest, WorkspaceLoadRequest, WorkspaceLoadResponse,
    WorkspaceResetRequest, WorkspaceResetResponse, WorkspaceSaveRequest, WorkspaceSaveResponse, WsHello,
};

use crate::AppState;

#[derive(Debug, serde::Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>, code: Option<&str>) -> Response {
    (status, Json(ErrorEnvelope { error: message.into(), code: code.map(str::to_string) })).into_response()
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    tracing::info!(token = %state.api_token, "elisa-server bearer token (keep this secret)");

    let pruner_sessions = state.sessions.clone();
    let pruner = pruner_sessions.spawn_pruner(elisa_core::session_store::DEFAULT_PRUNE_TICK);

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "elisa-server listening");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    pruner.abort();
    result?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let mut router = Router::new()
        .route("/api/workspace/save", post(workspace_save))
        .route("/api/workspace/load", post(workspace_load))
        .route("/api/workspace/inspect", post(workspace_inspect))
        .route("/api/workspace/reset", post(workspace_reset))
        .route("/api/session", post(create_session))
        .route("/api/session/{id}/cancel", post(cancel_session))
        .route("/api/session/{id}/gate", post(answer_gate))
        .route("/api/session/{id}/answer", post(answer_question))
        .route("/ws/session/{id}", get(session_ws));

    if state.config.dev_mode {
        router = router.route("/api/internal/config", post(internal_config));
    }

    router
        .route("/api/health", get(health))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/api/health" {
        return next.run(request).await;
    }
    let provided = extract_request_token(request.headers());
    if provided.as_deref() == Some(state.api_token.as_str()) {
        return next.run(request).await;
    }
    error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token", Some("AUTH_REQUIRED"))
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed.strip_prefix("Bearer ").or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn health(State(_state): State<AppState>) -> Json<HealthResponse> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|v| !v.trim().is_empty());
    let (api_key_status, api_key_error) = match api_key {
        Some(_) => (ApiKeyStatus::Valid, None),
        None => (ApiKeyStatus::Missing, Some("OPENAI_API_KEY is not set".to_string())),
    };
    let status = if api_key_status == ApiKeyStatus::Valid { HealthStatus::Ready } else { HealthStatus::Degraded };
    Json(HealthResponse {
        status,
        api_key: api_key_status,
        api_key_error,
        agent_sdk: AgentSdkStatus::Found,
    })
}

async fn internal_config(
    State(_state): State<AppState>,
    Json(body): Json<InternalConfigRequest>,
) -> Result<Json<InternalConfigResponse>, Response> {
    if body.api_key.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "api_key must not be empty", None));
    }
    std::env::set_var("OPENAI_API_KEY", body.api_key.trim());
    Ok(Json(InternalConfigResponse { api_key: ApiKeyStatus::Valid }))
}

async fn workspace_save(
    State(state): State<AppState>,
    Json(body): Json<WorkspaceSaveRequest>,
) -> Result<Json<WorkspaceSaveResponse>, Response> {
    let root = state
        .resolve_workspace_path(&body.workspace_path)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e, Some("PATH_ESCAPE")))?;
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None))?;

    for (name, value) in [
        ("workspace.json", &body.workspace_json),
        ("skills.json", &body.skills),
        ("rules.json", &body.rules),
        ("portals.json", &body.portals),
    ] {
        if value.is_null() {
            continue;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None))?;
        elisa_core::config::write_atomic(&root.join(name), &bytes)
            .await
            .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None))?;
    }

    Ok(Json(WorkspaceSaveResponse { status: "saved" }))
}

async fn workspace_load(
    State(state): State<AppState>,
    Json(body): Json<WorkspaceLoadRequest>,
) -> Result<Json<WorkspaceLoadResponse>, Response> {
    let root = state
        .resolve_workspace_path(&body.workspace_path)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e, Some("PATH_ESCAPE")))?;

    async fn read_json(path: std::path::PathBuf) -> Value {
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }

    let workspace = read_json(root.join("workspace.json")).await;
    let skills = read_json(root.join("skills.json")).await;
    let rules = read_json(root.join("rules.json")).await;
    let portals = read_json(root.join("portals.json")).await;

    Ok(Json(WorkspaceLoadResponse { workspace, skills, rules, portals }))
}

async fn workspace_inspect(
    State(state): State<AppState>,
    Json(body): Json<WorkspaceInspectRequest>,
) -> Result<Json<elisa_wire::WorkspaceInspection>, Response> {
    let root = state
        .resolve_workspace_path(&body.workspace_path)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e, Some("PATH_ESCAPE")))?;
    let manager = WorkspaceManager::new(root);
    let inspection = manager.inspect().await;
    Ok(Json(elisa_wire::WorkspaceInspection {
        exists: inspection.exists,
        is_empty: inspection.is_empty,
        file_count: inspection.file_count as u64,
        src_file_count: inspection.src_file_count as u64,
        test_file_count: inspection.test_file_count as u64,
        has_git: inspection.has_git,
        top_files: inspection.top_files,
    }))
}

async fn workspace_reset(
    State(state): State<AppState>,
    Json(body): Json<WorkspaceResetRequest>,
) -> Result<Json<WorkspaceResetResponse>, Response> {
    if body.mode != "clean_generated" {
        return Err(error_response(StatusCode::BAD_REQUEST, "mode must be \"clean_generated\"", Some("BAD_MODE")));
    }
    let root = state
        .resolve_workspace_path(&body.workspace_path)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e, Some("PATH_ESCAPE")))?;

    let mut removed = Vec::new();
    for dir in ["src", "tests"] {
        let path = root.join(dir);
        if tokio::fs::metadata(&path).await.is_ok() {
            removed.push(dir.to_string());
        }
    }

    let manager = WorkspaceManager::new(root);
    manager
        .provision(RestartMode::Clean)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None))?;

    Ok(Json(WorkspaceResetResponse { status: "reset", mode: body.mode, removed }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, Response> {
    let spec = parse_spec(body.spec)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid spec: {e}"), Some("BAD_SPEC")))?;

    let workspace_path = match &body.workspace_path {
        Some(path) => state
            .resolve_workspace_path(path)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, e, Some("PATH_ESCAPE")))?
            .display()
            .to_string(),
        None => {
            let generated = uuid::Uuid::new_v4().to_string();
            state.config.workspaces_root.join(generated).display().to_string()
        }
    };

    let handle = state.sessions.create(spec, workspace_path, body.restart_mode).await;
    let cancel = state.cancellations.token_for(&handle.id).await;
    spawn_session_log_sink(&handle).await;

    let controller = std::sync::Arc::new(PipelineController::new(handle.clone(), cancel, state.deps.clone()));
    state.controllers.write().await.insert(handle.id.clone(), controller.clone());

    let session_id = handle.id.clone();
    tokio::spawn(async move {
        controller.run().await;
    });

    Ok(Json(CreateSessionResponse { session_id }))
}

async fn spawn_session_log_sink(handle: &elisa_core::session_store::SessionHandle) {
    let workspace_root = {
        let session = handle.session.read().await;
        std::path::PathBuf::from(&session.workspace_path)
    };
    let log_path = workspace_root.join(".elisa").join("logs").join(format!("session-{}.log", handle.id));
    elisa_core::event_bus::spawn_session_log_sink(&handle.bus, log_path);
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, Response> {
    let controllers = state.controllers.read().await;
    let Some(controller) = controllers.get(&id) else {
        return Err(error_response(StatusCode::NOT_FOUND, "unknown session", Some("NOT_FOUND")));
    };
    controller.cancel();
    state.cancellations.cancel(&id).await;
    Ok(Json(StatusResponse { status: "cancelled" }))
}

async fn answer_gate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<GateRequest>,
) -> Result<Json<StatusResponse>, Response> {
    let controllers = state.controllers.read().await;
    let Some(controller) = controllers.get(&id) else {
        return Err(error_response(StatusCode::NOT_FOUND, "unknown session", Some("NOT_FOUND")));
    };
    controller.answer_gate(body.approved, body.feedback).await;
    Ok(Json(StatusResponse { status: "accepted" }))
}

async fn answer_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AnswerRequest>,
) -> Result<Json<StatusResponse>, Response> {
    let controllers = state.controllers.read().await;
    let Some(controller) = controllers.get(&id) else {
        return Err(error_response(StatusCode::NOT_FOUND, "unknown session", Some("NOT_FOUND")));
    };
    controller.answer_question(&body.task_id, body.answers).await;
    Ok(Json(StatusResponse { status: "accepted" }))
}

/// `/ws/session/:id` is the only upgrade path; anything else is rejected at
/// the router level (no route registered, axum's 404 destroys the socket
/// attempt before the upgrade completes).
async fn session_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(handle) = state.sessions.get(&id).await else {
        return error_response(StatusCode::NOT_FOUND, "unknown session", Some("NOT_FOUND"));
    };
    ws.on_upgrade(move |socket| handle_session_socket(socket, handle))
}

async fn handle_session_socket(mut socket: WebSocket, handle: elisa_core::session_store::SessionHandle) {
    let hello = WsHello { kind: "session_started", session_id: handle.id.clone() };
    let Ok(hello_json) = serde_json::to_string(&hello) else { return };
    if socket.send(WsMessage::Text(hello_json.into())).await.is_err() {
        return;
    }

    let mut rx = handle.bus.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                        if event.kind == event_kind::SESSION_COMPLETE || event.kind == event_kind::ERROR {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_request_token_reads_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(extract_request_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn extract_request_token_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_request_token(&headers), None);
    }
}
