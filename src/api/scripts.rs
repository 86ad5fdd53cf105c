use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::error::{engine_error, validate_len, MAX_NAME, MAX_SOURCE, MAX_URI};
use crate::auth::UserContext;
use crate::engine;
use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/scripts", get(list_scripts))
        .route("/script", get(get_script))
        .route("/script", put(upsert_script))
        .route("/script", delete(delete_script))
        .route("/script/owners", get(list_owners))
        .route("/script/owners", post(add_owner))
        .route("/script/owners", delete(remove_owner))
        .with_state(state)
}

async fn list_scripts(State(state): State<Arc<AppState>>) -> Response {
    match state.scripts.list().await {
        Ok(scripts) => Json(scripts).into_response(),
        Err(e) => engine_error("list_scripts", e),
    }
}

async fn get_script(
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
    match state.scripts.get(uri).await {
        Ok(row) => {
            let status = {
                let sandboxes = state.sandboxes.read().expect("sandbox table poisoned");
                sandboxes.get(uri).map(|h| h.init_status())
            };
            Json(json!({
                "uri": row.uri,
                "name": row.name,
                "sourceText": row.source_text,
                "privileged": row.privileged,
                "createdAt": row.created_at,
                "updatedAt": row.updated_at,
                "initialized": status.as_ref().map(|s| s.completed && s.error.is_none()),
                "lastInitError": status.and_then(|s| s.error),
            }))
            .into_response()
        }
        Err(e) => engine_error("get_script", e),
    }
}

#[derive(Deserialize)]
struct UpsertScriptBody {
    uri: String,
    source: String,
    name: Option<String>,
    privileged: Option<bool>,
}

async fn upsert_script(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<UpsertScriptBody>,
) -> Response {
    if let Some(r) = validate_len("uri", &body.uri, MAX_URI) {
        return r;
    }
    if let Some(r) = validate_len("source", &body.source, MAX_SOURCE) {
        return r;
    }
    if let Some(name) = &body.name {
        if let Some(r) = validate_len("name", name, MAX_NAME) {
            return r;
        }
    }

    match engine::upsert_script(
        &state,
        &body.uri,
        &body.source,
        body.name.as_deref(),
        body.privileged,
        &user,
    )
    .await
    {
        Ok(()) => {
            let init = {
                let sandboxes = state.sandboxes.read().expect("sandbox table poisoned");
                sandboxes.get(&body.uri).map(|h| h.init_status())
            };
            Json(json!({
                "uri": body.uri,
                "initialized": init.as_ref().map(|s| s.error.is_none()).unwrap_or(false),
                "lastInitError": init.and_then(|s| s.error),
            }))
            .into_response()
        }
        Err(e) => engine_error("upsert_script", e),
    }
}

async fn delete_script(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(uri) = params.get("uri") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "uri query parameter required" })),
        )
            .into_response();
    };
    match engine::delete_script(&state, uri, &user).await {
        Ok(()) => Json(json!({ "deleted": uri })).into_response(),
        Err(e) => engine_error("delete_script", e),
    }
}

async fn list_owners(
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
    match state.scripts.list_owners(uri).await {
        Ok(owners) => Json(json!({ "uri": uri, "owners": owners })).into_response(),
        Err(e) => engine_error("list_owners", e),
    }
}

#[derive(Deserialize)]
struct OwnerBody {
    uri: String,
    #[serde(rename = "userId")]
    user_id: String,
}

/// Owner management requires ownership (or admin), like upsert.
async fn authorize_owner_change(
    state: &Arc<AppState>,
    user: &UserContext,
    uri: &str,
) -> Result<(), Response> {
    if user.is_admin {
        return Ok(());
    }
    let is_owner = match &user.user_id {
        Some(id) => state.scripts.is_owner(uri, id).await.unwrap_or(false),
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

async fn add_owner(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<OwnerBody>,
) -> Response {
    if let Err(r) = authorize_owner_change(&state, &user, &body.uri).await {
        return r;
    }
    match state.scripts.add_owner(&body.uri, &body.user_id).await {
        Ok(()) => Json(json!({ "added": body.user_id })).into_response(),
        Err(e) => engine_error("add_owner", e),
    }
}

async fn remove_owner(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<OwnerBody>,
) -> Response {
    if let Err(r) = authorize_owner_change(&state, &user, &body.uri).await {
        return r;
    }
    match state.scripts.remove_owner(&body.uri, &body.user_id).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => engine_error("remove_owner", e),
    }
}
