use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use chainflow_core::error::ChainflowError;
use chainflow_core::types::SessionId;
use chainflow_engine::{EngineRequest, EngineResponse, GraphDefinition};

use crate::state::AppState;

fn status_for(response: &EngineResponse) -> StatusCode {
    match response {
        EngineResponse::Success { .. } => StatusCode::OK,
        EngineResponse::Failure { error_kind, .. } => match error_kind.as_str() {
            "GraphValidationError" | "CycleError" | "TypeMismatchError" | "UnknownTypeError" => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn error_body(err: &ChainflowError) -> Json<serde_json::Value> {
    Json(serde_json::to_value(EngineResponse::from_error(err)).unwrap_or_default())
}

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bind": state.config.bind,
        "nodeTypes": state.runner.engine().registry().len(),
    }))
}

// GET /api/node-types
pub async fn node_types(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let schemas = state.runner.engine().registry().schemas();
    Json(serde_json::json!({ "nodeTypes": schemas }))
}

// POST /api/validate
pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(graph): Json<GraphDefinition>,
) -> Response {
    match state.runner.engine().validate(&graph) {
        Ok((_, plan)) => Json(serde_json::json!({
            "order": plan.order,
            "terminal": plan.terminal,
        }))
        .into_response(),
        Err(e) => {
            debug!(error = %e, "Graph rejected");
            (StatusCode::BAD_REQUEST, error_body(&e)).into_response()
        }
    }
}

// POST /api/prediction (SSE frames when `streaming`)
pub async fn prediction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EngineRequest>,
) -> Response {
    if request.streaming {
        return match state.runner.stream(request).await {
            Ok((session, receiver)) => {
                info!(session_id = %session, "Streaming prediction");
                // Dropping the body on disconnect drops the receiver, which cancels the run.
                let frames = receiver.map(|frame| {
                    Ok::<_, Infallible>(Event::default().json_data(&frame).unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to encode stream frame");
                        Event::default().comment("encoding error")
                    }))
                });
                let mut response = Sse::new(frames).keep_alive(KeepAlive::default()).into_response();
                if let Ok(value) = session.as_str().parse() {
                    response.headers_mut().insert("x-session-id", value);
                }
                response
            }
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(&e)).into_response(),
        };
    }

    let (session, response) = state.runner.handle(request).await;
    let status = status_for(&response);
    let mut body = serde_json::to_value(&response).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("sessionId".into(), serde_json::json!(session));
    }
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/sessions/{id}/history?limit=50
pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let session_id = SessionId::from_string(&id);
    match state.runner.store().load_history(&session_id, q.limit).await {
        Ok(messages) => Ok(Json(serde_json::json!({ "messages": messages }))),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Failed to load history");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// DELETE /api/sessions/{id}
pub async fn forget_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let session_id = SessionId::from_string(&id);
    match state.runner.forget(&session_id).await {
        Ok(evicted) => {
            info!(session_id = %session_id, evicted, "Session forgotten");
            Ok(Json(serde_json::json!({ "sessionId": session_id, "evicted": evicted })))
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Failed to forget session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
