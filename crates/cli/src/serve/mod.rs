//! `stategraph serve` -- Terraform HTTP backend plus management API.
//!
//! Endpoints:
//! - GET  /health                     - Server status
//! - *    /tfstate/{guid}             - state document (see [`tfstate`])
//! - *    /tfstate/{guid}/lock        - acquire lock
//! - *    /tfstate/{guid}/unlock      - release lock
//! - *    /api/v1/...                 - JSON management API (see [`api`])
//!
//! All error responses use Content-Type: application/json.

mod api;
mod handlers;
mod state;
mod tfstate;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use stategraph_core::{EdgeJobConfig, Engine, EngineConfig, PolicyLabelValidator};
use stategraph_store_sqlite::SqliteStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

use self::handlers::{handle_health, handle_not_found};
use self::state::{AppState, TfstateMethods};
use self::tfstate::{handle_lock, handle_state, handle_unlock};

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Open the configured store, creating the schema if needed.
pub(crate) fn open_store(config: &Config) -> Result<SqliteStore, Box<dyn std::error::Error>> {
    let store = if config.database.is_in_memory() {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(&config.database.store_config())?
    };
    Ok(store)
}

fn build_state(config: &Config, store: SqliteStore) -> Result<AppState, Box<dyn std::error::Error>> {
    let engine_config = EngineConfig {
        base_url: config.server.base_url(),
        edge_job: EdgeJobConfig {
            timeout: config.edges.update_timeout(),
        },
    };
    let engine = Engine::new(Arc::new(store), engine_config).with_label_validator(Arc::new(
        PolicyLabelValidator::new(config.labels.clone()),
    ));
    Ok(AppState {
        engine,
        methods: TfstateMethods::from_config(&config.tfstate)?,
    })
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    // Custom verbs (LOCK, UNLOCK) have to be allowed explicitly.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tfstate/{guid}", any(handle_state))
        .route("/tfstate/{guid}/lock", any(handle_lock))
        .route("/tfstate/{guid}/unlock", any(handle_unlock))
        .nest("/api/v1", api::routes())
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Start the HTTP server described by `config` and run until Ctrl+C.
pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config)?;
    if config.database.is_in_memory() {
        tracing::warn!("using an in-memory database; state is lost on exit");
    }
    let state = Arc::new(build_state(&config, store)?);
    let app = build_router(state, config.server.max_body_bytes);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        %addr,
        database = %config.database.path.display(),
        base_url = %config.server.base_url(),
        "stategraph listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("received shutdown signal");
}
