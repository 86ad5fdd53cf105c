mod api;
mod assets;
mod auth;
mod capabilities;
mod config;
mod convert;
mod db;
mod engine;
mod error;
mod fetch;
mod graphql;
mod logs;
mod pipeline;
mod registry;
mod sandbox;
mod scheduler;
mod scripts;
mod secrets;
mod storage;

#[cfg(test)]
mod engine_tests;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::HeaderMap;
use axum::middleware;
use axum::routing::post;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::assets::AssetStore;
use crate::auth::resolve_user_context;
use crate::config::AppConfig;
use crate::db::Database;
use crate::fetch::FetchService;
use crate::graphql::{GraphQlDepth, GraphQlRegistry};
use crate::logs::LogStore;
use crate::registry::{ListenerRegistry, RouteRegistry, StreamHub};
use crate::sandbox::SandboxHandle;
use crate::scheduler::Scheduler;
use crate::scripts::ScriptStore;
use crate::secrets::SecretVault;
use crate::storage::StorageBridge;

/// Shared application state available to all handlers, background tasks and
/// sandbox workers.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub scripts: ScriptStore,
    pub routes: RouteRegistry,
    pub streams: StreamHub,
    pub listeners: ListenerRegistry,
    pub graphql: GraphQlRegistry,
    pub scheduler: Scheduler,
    pub assets: AssetStore,
    pub storage: StorageBridge,
    pub logs: LogStore,
    pub secrets: SecretVault,
    pub fetch: FetchService,
    /// One live sandbox per loaded script, keyed by URI.
    pub sandboxes: RwLock<HashMap<String, SandboxHandle>>,
}

impl AppState {
    pub fn new(config: AppConfig, db: Database) -> Self {
        let secrets = SecretVault::new(db.clone(), config.secrets_encryption_key.clone());
        let fetch = FetchService::new(&config, secrets.clone());
        Self {
            scripts: ScriptStore::new(db.clone()),
            routes: RouteRegistry::new(),
            streams: StreamHub::new(config.sse_per_connection_buffer),
            listeners: ListenerRegistry::new(),
            graphql: GraphQlRegistry::new(),
            scheduler: Scheduler::new(),
            assets: AssetStore::new(db.clone()),
            storage: StorageBridge::new(db.clone()),
            logs: LogStore::new(db.clone()),
            secrets,
            fetch,
            sandboxes: RwLock::new(HashMap::new()),
            config,
            db,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aiwebengine=info,tower_http=info".into()),
        )
        .init();

    info!("Starting AIWebEngine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database initialized");

    // Re-encrypt secret values if an encryption key is configured
    if let Some(ref key) = config.secrets_encryption_key {
        let old_key = config.secrets_encryption_key_old.as_deref();
        if let Err(e) = db::crypto::migrate_plaintext_secrets(&db, key, old_key).await {
            error!(error = %e, "Failed to migrate secrets to encrypted form");
        }
    }

    // Build shared state
    let state = Arc::new(AppState::new(config.clone(), db));

    // Seed scripts on an empty store (first run / demo setups)
    if let Err(e) = seed_bootstrap_scripts(&state).await {
        warn!(error = %e, "Bootstrap script seeding failed");
    }

    // Instantiate a sandbox for every stored script and run init
    engine::load_all(&state).await;

    // Start the scheduler dispatch loop
    engine::spawn_scheduler_loop(state.clone());

    // Spawn hourly session cleanup
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                if let Ok(n) = auth::sessions::cleanup_expired(&db).await {
                    if n > 0 {
                        info!(deleted = n, "Cleaned up expired sessions");
                    }
                }
            }
        });
    }

    // Build router
    let app = build_router(state.clone());

    // Start server
    let addr = config.listen_addr.parse::<SocketAddr>()?;
    info!("Starting HTTP server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    // Control-plane REST routes (session auth required)
    let engine_routes = api::routes(state.clone()).layer(middleware::from_fn_with_state(
        state.clone(),
        auth::session_auth_middleware,
    ));

    Router::new()
        .route("/graphql", post(graphql_handler))
        // Everything else belongs to script routes, asset routes and streams.
        .fallback(pipeline::dispatch)
        .with_state(state.clone())
        .nest("/engine", engine_routes)
        .layer(DefaultBodyLimit::max(state.config.http_max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// The external GraphQL endpoint: executes against the merged schema of all
/// `external` operations.
async fn graphql_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: GraphQLRequest,
) -> GraphQLResponse {
    let auth = resolve_user_context(&state, &headers).await;

    let schema = match graphql::schema(&state, false) {
        Ok(schema) => schema,
        Err(e) => {
            error!(error = %e, "GraphQL schema build failed");
            return async_graphql::Response::from_errors(vec![async_graphql::ServerError::new(
                "schema unavailable",
                None,
            )])
            .into();
        }
    };

    let request = request.into_inner().data(auth).data(GraphQlDepth(0));
    schema.execute(request).await.into()
}

/// On an empty script store, install every `.js` file found in
/// `BOOTSTRAP_SCRIPT_DIR` as a privileged engine script.
async fn seed_bootstrap_scripts(state: &Arc<AppState>) -> Result<()> {
    let Some(dir) = state.config.bootstrap_script_dir.clone() else {
        return Ok(());
    };
    if !state.scripts.list().await?.is_empty() {
        return Ok(());
    }

    let mut seeded = 0u32;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("js") {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script")
            .to_string();
        let source = std::fs::read_to_string(&path)?;
        let uri = format!("engine://bootstrap/{stem}");
        state
            .scripts
            .upsert(&uri, &source, Some(&stem), Some(true))
            .await?;
        seeded += 1;
    }

    if seeded > 0 {
        info!(count = seeded, dir = %dir, "Seeded bootstrap scripts");
    }
    Ok(())
}
