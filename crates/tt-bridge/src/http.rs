use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;

use tt_core::store::{SessionDetail, SessionRow};

use crate::state::ApiState;
use crate::ws;

/// Build the observer-facing router: the WebSocket endpoint plus the REST
/// read surface consumed by the HTTP layer.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /api/sessions: the session history index.
async fn list_sessions(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<SessionRow>>, ApiError> {
    let rows = state
        .store
        .list_sessions()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(rows))
}

/// GET /api/sessions/{id}: one session's full detail.
async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<SessionDetail>, ApiError> {
    match state.store.fetch_session(id).await {
        Ok(Some(detail)) => Ok(Json(detail)),
        Ok(None) => Err(ApiError::NotFound(format!("session {id} not found"))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the REST read surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_status_codes() {
        let response = ApiError::NotFound("session 9 not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::Internal("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
