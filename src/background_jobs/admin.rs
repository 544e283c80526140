use super::executor::ExecutionRecord;
use super::failure_tracker::FailureTracker;
use super::handler::HandlerRegistry;
use super::metrics::{HealthReport, MetricsAggregator, MetricsSnapshot};
use super::scheduler::{upsert_definition, JobDefinition, SharedSchedulerState};
use super::tier::TierPolicies;
use crate::job_store::{Job, JobStore, Trigger};
use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Information about a job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub tier: String,
    pub trigger: Trigger,
    pub next_run_time: String,
    pub paused: bool,
    pub running: bool,
    pub consecutive_failures: u32,
}

/// Serializable execution record.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecordInfo {
    pub start_time: String,
    pub end_time: String,
    pub duration_ms: u64,
    pub success: bool,
    pub retries_used: u32,
    pub error: Option<String>,
    pub result_count: u64,
}

impl From<&ExecutionRecord> for ExecutionRecordInfo {
    fn from(record: &ExecutionRecord) -> Self {
        ExecutionRecordInfo {
            start_time: format_timestamp(&record.start_time),
            end_time: format_timestamp(&record.end_time),
            duration_ms: record.duration().as_millis() as u64,
            success: record.success,
            retries_used: record.retries_used,
            error: record.error.clone(),
            result_count: record.result_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    /// Newest first.
    pub recent_executions: Vec<ExecutionRecordInfo>,
    pub success_rate_last_10: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_jobs: usize,
    pub jobs: Vec<JobSummary>,
    pub metrics: MetricsSnapshot,
}

/// Control-plane operations over a running scheduler.
///
/// Cloned into HTTP handlers. Not-found is reported as `Ok(false)` / `Ok(None)`;
/// errors only come from the job store.
#[derive(Clone)]
pub struct AdminController {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    tiers: Arc<TierPolicies>,
    tracker: Arc<FailureTracker>,
    aggregator: Arc<MetricsAggregator>,
    shared_state: Arc<SharedSchedulerState>,
}

impl AdminController {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        tiers: Arc<TierPolicies>,
        tracker: Arc<FailureTracker>,
        aggregator: Arc<MetricsAggregator>,
        shared_state: Arc<SharedSchedulerState>,
    ) -> Self {
        Self {
            store,
            registry,
            tiers,
            tracker,
            aggregator,
            shared_state,
        }
    }

    pub async fn pause(&self, job_id: &str) -> Result<bool> {
        let found = self.store.set_paused(job_id, true)?;
        if found {
            info!("Paused job {}", job_id);
        }
        Ok(found)
    }

    pub async fn resume(&self, job_id: &str) -> Result<bool> {
        let found = self.store.set_paused(job_id, false)?;
        if found {
            info!("Resumed job {}", job_id);
        }
        Ok(found)
    }

    /// Make a job due immediately. Its interval is unchanged, so the run after
    /// this one lands one interval after the triggered dispatch.
    pub async fn trigger_now(&self, job_id: &str) -> Result<bool> {
        self.trigger_at(job_id, Utc::now()).await
    }

    pub async fn trigger_at(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let found = self.store.update_next_run_time(job_id, at)?;
        if found {
            info!("Triggered job {} for {}", job_id, at);
        }
        Ok(found)
    }

    /// Add or update a job. A new job is due on the next tick.
    pub async fn add_job(&self, definition: &JobDefinition) -> Result<Job> {
        if !self.registry.contains(&definition.handler_ref) {
            bail!(
                "Cannot add job {}: no handler registered for '{}'",
                definition.id,
                definition.handler_ref
            );
        }
        let job = upsert_definition(self.store.as_ref(), &self.tiers, definition, Utc::now())?;
        info!("Added job {} ({})", job.id, job.trigger);
        Ok(job)
    }

    /// Remove a job. An execution already in flight runs to completion.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let removed = self.store.remove_job(job_id)?;
        if removed {
            self.tracker.forget(job_id);
            info!("Removed job {}", job_id);
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<JobSummary>> {
        let jobs = self.store.list_jobs()?;
        let in_flight = self.shared_state.in_flight.read().await;
        Ok(jobs
            .iter()
            .map(|job| self.summarize(job, in_flight.contains(&job.id)))
            .collect())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobDetail>> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(None);
        };
        let running = self.shared_state.is_in_flight(job_id).await;
        let status = self.tracker.status(job_id);

        Ok(Some(JobDetail {
            summary: self.summarize(&job, running),
            recent_executions: status
                .recent_executions
                .iter()
                .map(ExecutionRecordInfo::from)
                .collect(),
            success_rate_last_10: status.success_rate_last_10,
        }))
    }

    pub async fn get_status(&self) -> Result<SchedulerStatus> {
        let jobs = self.list().await?;
        let metrics = self.aggregator.snapshot()?;
        Ok(SchedulerStatus {
            running: self.shared_state.is_running(),
            total_jobs: jobs.len(),
            jobs,
            metrics,
        })
    }

    pub async fn get_metrics(&self) -> Result<MetricsSnapshot> {
        self.aggregator.snapshot()
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.aggregator.health(self.shared_state.is_running())
    }

    pub fn is_running(&self) -> bool {
        self.shared_state.is_running()
    }

    pub fn has_handler(&self, handler_ref: &str) -> bool {
        self.registry.contains(handler_ref)
    }

    fn summarize(&self, job: &Job, running: bool) -> JobSummary {
        JobSummary {
            id: job.id.clone(),
            name: job.name.clone(),
            tier: job.tier.to_string(),
            trigger: job.trigger,
            next_run_time: format_timestamp(&job.next_run_time),
            paused: job.paused,
            running,
            consecutive_failures: self.tracker.consecutive_failures(&job.id),
        }
    }
}
