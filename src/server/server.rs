use anyhow::{Context, Result};
use std::time::Duration;

use axum::{extract::State, middleware, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::background_jobs::AdminController;

use super::metrics::metrics_handler;
use super::scheduler_routes::scheduler_routes;
use super::state::ServerState;
use super::{log_requests, ServerConfig};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub scheduler_running: bool,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> Json<ServerStats> {
    Json(ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        scheduler_running: state.admin.is_running(),
    })
}

pub fn make_app(config: ServerConfig, admin: AdminController) -> Router {
    let state = ServerState::new(config, admin);

    Router::new()
        .route("/", get(home))
        .nest("/v1/scheduler", scheduler_routes())
        .layer(middleware::from_fn_with_state(state.config.clone(), log_requests))
        .with_state(state)
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn serve(app: Router, port: u16, shutdown_token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;
    Ok(())
}

/// Serve the admin API until the token is cancelled.
pub async fn run_server(
    config: ServerConfig,
    admin: AdminController,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let app = make_app(config, admin);
    info!("Ready to serve at port {}!", port);
    serve(app, port, shutdown_token).await
}

/// Serve Prometheus metrics on a dedicated port until the token is cancelled.
pub async fn run_metrics_server(port: u16, shutdown_token: CancellationToken) -> Result<()> {
    info!("Metrics available at port {}!", port);
    serve(make_metrics_app(), port, shutdown_token).await
}
