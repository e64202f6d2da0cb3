use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

use super::api::{self, AppState, SharedState};
use super::db::{BoardDb, DbHandle};
use super::ws;
use crate::config::{AuthSection, CrewboardConfig};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Configuration for the board server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub auth: AuthSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4150,
            db_path: PathBuf::from(".crewboard/crewboard.db"),
            dev_mode: false,
            auth: AuthSection::default(),
        }
    }
}

impl From<&CrewboardConfig> for ServerConfig {
    fn from(config: &CrewboardConfig) -> Self {
        Self {
            host: config.toml.server.host.clone(),
            port: config.toml.server.port,
            db_path: config.db_path(),
            dev_mode: config.toml.server.dev_mode,
            auth: config.toml.auth.clone(),
        }
    }
}

/// Build the full application router: JSON API, WebSocket and request
/// tracing, plus permissive CORS in dev mode.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn(request_tracing))
        .with_state(state);

    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Wrap each request in an `http.request` span and echo its request id.
/// A caller-supplied `x-request-id` is reused; otherwise one is generated.
async fn request_tracing(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = request.method().to_string();
    let route = request.uri().path().to_string();

    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %method,
        route = %route,
    );

    let started = std::time::Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;
    span.in_scope(|| {
        tracing::info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
    });

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Open the database and assemble the shared state.
pub fn open_state(config: &ServerConfig) -> Result<SharedState> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = BoardDb::new(&config.db_path).context("Failed to initialize board database")?;
    let purged = db.purge_expired_sessions()?;
    if purged > 0 {
        tracing::info!(purged, "Removed expired sessions");
    }
    let (ws_tx, _rx) = broadcast::channel::<String>(256);

    Ok(Arc::new(AppState {
        db: DbHandle::new(db),
        ws_tx,
        auth: config.auth.clone(),
    }))
}

/// Start the board server and run until Ctrl+C. `on_ready` is called with
/// the bound address once the listener is up.
pub async fn start_server(
    config: ServerConfig,
    on_ready: impl FnOnce(SocketAddr) + Send,
) -> Result<()> {
    let state = open_state(&config)?;
    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db = %config.db_path.display(),
        dev_mode = config.dev_mode,
        "crewboard listening"
    );
    on_ready(local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received");
}
