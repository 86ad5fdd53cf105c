pub mod admin;
pub mod assets;
pub mod error;
pub mod scripts;

use std::sync::Arc;

use axum::middleware;
use axum::Router;

use crate::auth::admin_only_middleware;
use crate::AppState;

/// Control-plane REST routes, nested under `/engine`. Session auth is layered
/// on by the caller; admin-only routes add their own layer here.
pub fn routes(state: Arc<AppState>) -> Router {
    let admin_routes = admin::routes(state.clone()).layer(middleware::from_fn(admin_only_middleware));

    Router::new()
        .merge(scripts::routes(state.clone()))
        .merge(assets::routes(state))
        .merge(admin_routes)
}
