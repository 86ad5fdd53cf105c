use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Extension, Json, Router};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use super::error::{engine_error, validate_len, MAX_NAME, MAX_URI};
use crate::auth::UserContext;
use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/assets", get(list_assets))
        .route("/asset", get(get_asset))
        .route("/asset", put(upsert_asset))
        .route("/asset", delete(delete_asset))
        .with_state(state)
}

/// Asset management requires ownership of the owning script (or admin).
async fn authorize(
    state: &Arc<AppState>,
    user: &UserContext,
    script_uri: &str,
) -> Result<(), Response> {
    if user.is_admin {
        return Ok(());
    }
    let is_owner = match &user.user_id {
        Some(id) => state.scripts.is_owner(script_uri, id).await.unwrap_or(false),
        None => false,
    };
    if is_owner {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Script owner or admin required" })),
        )
            .into_response())
    }
}

async fn list_assets(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match params.get("script") {
        Some(script_uri) => match state.assets.list_for_script(script_uri).await {
            Ok(assets) => Json(assets).into_response(),
            Err(e) => engine_error("list_assets", e),
        },
        None if user.is_admin => match state.assets.list_all().await {
            Ok(assets) => Json(assets).into_response(),
            Err(e) => engine_error("list_assets", e),
        },
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "script query parameter required" })),
        )
            .into_response(),
    }
}

async fn get_asset(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(uri) = params.get("uri") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "uri query parameter required" })),
        )
            .into_response();
    };
    match state.assets.get_by_uri(uri).await {
        Ok(asset) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, asset.mimetype)],
            asset.content,
        )
            .into_response(),
        Err(e) => engine_error("get_asset", e),
    }
}

#[derive(Deserialize)]
struct UpsertAssetBody {
    #[serde(rename = "scriptUri")]
    script_uri: String,
    name: String,
    mimetype: String,
    #[serde(rename = "contentBase64")]
    content_base64: String,
}

async fn upsert_asset(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<UpsertAssetBody>,
) -> Response {
    if let Some(r) = validate_len("scriptUri", &body.script_uri, MAX_URI) {
        return r;
    }
    if let Some(r) = validate_len("name", &body.name, MAX_NAME) {
        return r;
    }
    if let Err(r) = authorize(&state, &user, &body.script_uri).await {
        return r;
    }

    let content = match base64::engine::general_purpose::STANDARD.decode(&body.content_base64) {
        Ok(content) => content,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid base64 content: {e}") })),
            )
                .into_response();
        }
    };

    match state
        .assets
        .upsert(&body.script_uri, &body.name, &body.mimetype, &content)
        .await
    {
        Ok(uri) => Json(json!({ "uri": uri })).into_response(),
        Err(e) => engine_error("upsert_asset", e),
    }
}

#[derive(Deserialize)]
struct DeleteAssetBody {
    #[serde(rename = "scriptUri")]
    script_uri: String,
    name: String,
}

async fn delete_asset(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<DeleteAssetBody>,
) -> Response {
    if let Err(r) = authorize(&state, &user, &body.script_uri).await {
        return r;
    }
    match state.assets.delete(&body.script_uri, &body.name).await {
        Ok(()) => Json(json!({ "deleted": body.name })).into_response(),
        Err(e) => engine_error("delete_asset", e),
    }
}
