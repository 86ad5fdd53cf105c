use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::error::{engine_error, validate_len, MAX_NAME, MAX_SECRET};
use crate::AppState;

/// Admin-only surface: log inspection and secret-vault management. Secret
/// values go in, never come out.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/logs", get(list_logs))
        .route("/secrets", get(list_secrets))
        .route("/secret", put(put_secret))
        .route("/secret", delete(delete_secret))
        .with_state(state)
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = match params.get("uri") {
        Some(uri) => state.logs.list_for_uri(uri).await,
        None => state.logs.list_all().await,
    };
    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => engine_error("list_logs", e),
    }
}

async fn list_secrets(State(state): State<Arc<AppState>>) -> Response {
    match state.secrets.list_identifiers().await {
        Ok(identifiers) => Json(json!({ "identifiers": identifiers })).into_response(),
        Err(e) => engine_error("list_secrets", e),
    }
}

#[derive(Deserialize)]
struct PutSecretBody {
    identifier: String,
    value: String,
}

async fn put_secret(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PutSecretBody>,
) -> Response {
    if let Some(r) = validate_len("identifier", &body.identifier, MAX_NAME) {
        return r;
    }
    if let Some(r) = validate_len("value", &body.value, MAX_SECRET) {
        return r;
    }
    if body.identifier.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "identifier must not be empty" })),
        )
            .into_response();
    }
    match state.secrets.put(&body.identifier, &body.value).await {
        Ok(()) => Json(json!({ "stored": body.identifier })).into_response(),
        Err(e) => engine_error("put_secret", e),
    }
}

async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(identifier) = params.get("id") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "id query parameter required" })),
        )
            .into_response();
    };
    match state.secrets.delete(identifier).await {
        Ok(true) => Json(json!({ "deleted": identifier })).into_response(),
        Ok(false) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
        }
        Err(e) => engine_error("delete_secret", e),
    }
}
