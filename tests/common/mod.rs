//! Common test infrastructure
//!
//! Spawns a complete scheduler (SQLite store on a temp dir, handler registry,
//! scheduler loop and admin router) and drives the router in-process.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestService, COUNT_HANDLER};
//!
//! #[tokio::test]
//! async fn test_job_runs() {
//!     let service = TestService::spawn(vec![common::job("a", COUNT_HANDLER)]).await;
//!     service.wait_for_runs(1).await;
//!     service.stop().await;
//! }
//! ```

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tiered_scheduler::background_jobs::{
    create_scheduler, HandlerRegistry, JobDefinition, JobError, SchedulerSettings, TierPolicies,
    TierPolicy,
};
use tiered_scheduler::job_store::{SqliteJobStore, Tier};
use tiered_scheduler::server::{make_app, RequestsLoggingLevel, ServerConfig};
use tiered_scheduler::AdminController;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const COUNT_HANDLER: &str = "count";
pub const FAIL_HANDLER: &str = "fail";
pub const SLOW_HANDLER: &str = "slow";

/// How long a slow handler takes
pub const SLOW_HANDLER_MS: u64 = 300;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared counters incremented by the test handlers.
#[derive(Default)]
pub struct Counters {
    pub runs: AtomicUsize,
    pub failures: AtomicUsize,
    pub slow_finished: AtomicUsize,
}

pub fn job(id: &str, handler: &str) -> JobDefinition {
    JobDefinition::new(id, Tier::High, handler)
}

fn test_tiers() -> TierPolicies {
    let mut tiers = TierPolicies::default();
    tiers
        .set(
            Tier::High,
            TierPolicy {
                interval: Duration::from_secs(300),
                max_retries: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                backoff_base: 2.0,
                jitter_enabled: false,
            },
        )
        .expect("valid tier");
    tiers
}

fn test_settings() -> SchedulerSettings {
    SchedulerSettings {
        tick_interval: Duration::from_millis(20),
        startup_stagger: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(5),
        alert_threshold: 2,
        ..Default::default()
    }
}

fn test_registry(counters: Arc<Counters>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    let c = counters.clone();
    registry.register_fn(COUNT_HANDLER, move |_ctx| {
        let c = c.clone();
        async move {
            c.runs.fetch_add(1, Ordering::SeqCst);
            Ok::<u64, JobError>(1)
        }
    });

    let c = counters.clone();
    registry.register_fn(FAIL_HANDLER, move |ctx| {
        let c = c.clone();
        async move {
            c.failures.fetch_add(1, Ordering::SeqCst);
            Err::<u64, JobError>(JobError::ExecutionFailed(format!(
                "attempt {} failed",
                ctx.attempt
            )))
        }
    });

    let c = counters;
    registry.register_fn(SLOW_HANDLER, move |_ctx| {
        let c = c.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(SLOW_HANDLER_MS)).await;
            c.slow_finished.fetch_add(1, Ordering::SeqCst);
            Ok::<u64, JobError>(1)
        }
    });

    registry
}

/// A running scheduler with its admin router.
///
/// Call [`TestService::stop`] to shut the loop down and get the database
/// directory back for a restart.
pub struct TestService {
    pub app: Router,
    pub admin: AdminController,
    pub counters: Arc<Counters>,
    db_dir: TempDir,
    shutdown_token: CancellationToken,
    scheduler_task: JoinHandle<()>,
}

impl TestService {
    pub async fn spawn(jobs: Vec<JobDefinition>) -> Self {
        Self::spawn_in(TempDir::new().expect("Failed to create temp dir"), jobs).await
    }

    /// Spawns a service on an existing database directory.
    pub async fn spawn_in(db_dir: TempDir, jobs: Vec<JobDefinition>) -> Self {
        let store = Arc::new(
            SqliteJobStore::new(db_dir.path().join("scheduler.db"))
                .expect("Failed to open job store"),
        );
        let counters = Arc::new(Counters::default());
        let shutdown_token = CancellationToken::new();

        let (mut scheduler, admin) = create_scheduler(
            store,
            Arc::new(test_registry(counters.clone())),
            test_tiers(),
            test_settings(),
            shutdown_token.clone(),
        );
        let now = chrono::Utc::now();
        for definition in &jobs {
            scheduler
                .register_job(definition, now)
                .expect("Failed to register job");
        }

        let scheduler_task = tokio::spawn(async move { scheduler.run().await });

        let config = ServerConfig {
            requests_logging_level: RequestsLoggingLevel::None,
            ..Default::default()
        };
        let app = make_app(config, admin.clone());

        Self {
            app,
            admin,
            counters,
            db_dir,
            shutdown_token,
            scheduler_task,
        }
    }

    /// Cancels the scheduler, waits for it to drain and returns the database dir.
    pub async fn stop(self) -> TempDir {
        self.shutdown_token.cancel();
        tokio::time::timeout(WAIT_TIMEOUT, self.scheduler_task)
            .await
            .expect("Scheduler did not stop in time")
            .expect("Scheduler task panicked");
        self.db_dir
    }

    pub fn runs(&self) -> usize {
        self.counters.runs.load(Ordering::SeqCst)
    }

    pub async fn wait_for_runs(&self, expected: usize) {
        let counters = self.counters.clone();
        wait_until(move || {
            let counters = counters.clone();
            async move { counters.runs.load(Ordering::SeqCst) >= expected }
        })
        .await;
    }

    pub async fn request(&self, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }
}

/// Polls `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while !condition().await {
        if start.elapsed() > WAIT_TIMEOUT {
            panic!("Condition not met within {:?}", WAIT_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
