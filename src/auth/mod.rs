pub mod sessions;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::AppState;

/// Authenticated-user context for one invocation. Derived externally (the
/// OAuth layer writes users + sessions); the runtime only reads it. Injected
/// into each sandbox invocation as the `auth` global; immutable per request.
#[derive(Debug, Clone, Serialize)]
pub struct UserContext {
    #[serde(rename = "isAuthenticated")]
    pub is_authenticated: bool,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self {
            is_authenticated: false,
            is_admin: false,
            user_id: None,
            email: None,
            name: None,
            provider: None,
        }
    }

    /// Context scheduled handlers run under: the owning script's first owner
    /// with admin scope.
    pub fn script_owner(user_id: Option<String>) -> Self {
        Self {
            is_authenticated: true,
            is_admin: true,
            user_id,
            email: None,
            name: None,
            provider: Some("scheduler".into()),
        }
    }

    pub fn from_session(user: sessions::SessionUser) -> Self {
        Self {
            is_authenticated: true,
            is_admin: user.is_admin,
            user_id: Some(user.user_id),
            email: user.email,
            name: user.display_name,
            provider: user.provider,
        }
    }
}

fn session_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let cookie_header = headers.get("cookie").and_then(|v| v.to_str().ok())?;
    cookie_header.split(';').find_map(|c| {
        c.trim()
            .strip_prefix(sessions::cookie_name())
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// Resolve the user context for a request. An absent or invalid session
/// yields the anonymous context — script routes decide for themselves
/// (via `auth.requireAuth()`) whether that is acceptable.
pub async fn resolve_user_context(state: &AppState, headers: &HeaderMap) -> UserContext {
    let Some(token) = session_token_from_headers(headers) else {
        return UserContext::anonymous();
    };
    match sessions::validate_session(&state.db, token).await {
        Ok(user) => UserContext::from_session(user),
        Err(_) => UserContext::anonymous(),
    }
}

/// Middleware: require a valid session on control-plane routes.
pub async fn session_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let user = resolve_user_context(&state, req.headers()).await;
    if !user.is_authenticated {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Authentication required" })),
        )
            .into_response());
    }
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Middleware: require admin role (must be chained after session_auth_middleware).
pub async fn admin_only_middleware(req: Request, next: Next) -> Result<Response, Response> {
    let user = req.extensions().get::<UserContext>().ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Authentication required" })),
        )
            .into_response()
    })?;

    if !user.is_admin {
        return Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Admin access required" })),
        )
            .into_response());
    }

    Ok(next.run(req).await)
}
