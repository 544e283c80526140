//! Admin routes over the job scheduler.
//!
//! - GET /status - Scheduler status with all jobs and metrics
//! - GET /health - Health report, degraded when thresholds are crossed
//! - GET /metrics - Aggregate execution metrics
//! - GET /jobs - List jobs
//! - POST /jobs - Add or update a job
//! - GET /jobs/{id} - Job detail with recent executions
//! - DELETE /jobs/{id} - Remove a job
//! - POST /jobs/{id}/pause, /jobs/{id}/resume, /jobs/{id}/trigger

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

use crate::background_jobs::{check_interval, AdminController, JobDefinition};
use crate::job_store::Tier;

use super::state::ServerState;

#[derive(Debug, Deserialize)]
struct AddJobBody {
    id: String,
    name: Option<String>,
    tier: Option<String>,
    handler: String,
    interval_secs: Option<u64>,
    #[serde(default)]
    paused: bool,
}

fn store_error(action: &str, err: anyhow::Error) -> Response {
    error!("Failed to {}: {:#}", action, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Failed to {}", action),
    )
        .into_response()
}

fn found_response(result: anyhow::Result<bool>, action: &str) -> Response {
    match result {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => store_error(action, err),
    }
}

async fn get_status(State(admin): State<AdminController>) -> Response {
    match admin.get_status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => store_error("read scheduler status", err),
    }
}

/// Always 200; a degraded scheduler is reported in the body.
async fn get_health(State(admin): State<AdminController>) -> Response {
    match admin.health().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => store_error("compute health", err),
    }
}

async fn get_metrics(State(admin): State<AdminController>) -> Response {
    match admin.get_metrics().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => store_error("compute metrics", err),
    }
}

async fn list_jobs(State(admin): State<AdminController>) -> Response {
    match admin.list().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => store_error("list jobs", err),
    }
}

async fn add_job(State(admin): State<AdminController>, Json(body): Json<AddJobBody>) -> Response {
    if body.id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Job id must not be empty").into_response();
    }
    if let Some(secs) = body.interval_secs {
        if let Err(err) = check_interval("interval_secs", Duration::from_secs(secs)) {
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    }
    if !admin.has_handler(&body.handler) {
        return (
            StatusCode::BAD_REQUEST,
            format!("No handler registered for '{}'", body.handler),
        )
            .into_response();
    }

    let definition = JobDefinition {
        name: body.name.unwrap_or_else(|| body.id.clone()),
        id: body.id,
        tier: Tier::parse(body.tier.as_deref().unwrap_or("medium")),
        handler_ref: body.handler,
        interval: body.interval_secs.map(Duration::from_secs),
        paused: body.paused,
    };

    match admin.add_job(&definition).await {
        Ok(_) => match admin.get(&definition.id).await {
            Ok(Some(detail)) => (StatusCode::CREATED, Json(detail.summary)).into_response(),
            Ok(None) => StatusCode::NOT_FOUND.into_response(),
            Err(err) => store_error("read job", err),
        },
        Err(err) => store_error("add job", err),
    }
}

async fn get_job(State(admin): State<AdminController>, Path(id): Path<String>) -> Response {
    match admin.get(&id).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => store_error("read job", err),
    }
}

async fn delete_job(State(admin): State<AdminController>, Path(id): Path<String>) -> Response {
    found_response(admin.remove_job(&id).await, "remove job")
}

async fn pause_job(State(admin): State<AdminController>, Path(id): Path<String>) -> Response {
    found_response(admin.pause(&id).await, "pause job")
}

async fn resume_job(State(admin): State<AdminController>, Path(id): Path<String>) -> Response {
    found_response(admin.resume(&id).await, "resume job")
}

async fn trigger_job(State(admin): State<AdminController>, Path(id): Path<String>) -> Response {
    found_response(admin.trigger_now(&id).await, "trigger job")
}

pub fn scheduler_routes() -> Router<ServerState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/jobs", get(list_jobs).post(add_job))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/pause", post(pause_job))
        .route("/jobs/{id}/resume", post(resume_job))
        .route("/jobs/{id}/trigger", post(trigger_job))
}
