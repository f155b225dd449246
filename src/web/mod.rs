//! Local HTTP control API.

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::drafts::DraftStore;
use crate::posting::JobCoordinator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: JobCoordinator,
    pub drafts: Arc<DraftStore>,
    pub db: Database,
    pub config: Arc<Config>,
}

/// Serve the control API until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the address is invalid or the server fails.
pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.web_host, state.config.web_port)
        .parse()
        .context("Invalid web server address")?;

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind web server")?;

    info!(addr = %addr, "Starting control API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Web server error")?;

    Ok(())
}

/// Build the router with all routes and middleware.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
