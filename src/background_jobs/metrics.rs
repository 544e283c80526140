//! Read-only rollups over the failure tracker and the job store.

use super::executor::{ExecutionObserver, ExecutionRecord};
use super::failure_tracker::FailureTracker;
use crate::job_store::{Job, JobStore};
use crate::server::metrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Degraded below this overall success rate.
    pub min_success_rate: f64,
    /// Degraded at or above this many jobs with consecutive failures.
    pub max_jobs_with_issues: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.7,
            max_jobs_with_issues: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_jobs: usize,
    pub total_executions: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub jobs_with_issues: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub running: bool,
    pub success_rate: f64,
    pub jobs_with_issues: usize,
    pub total_jobs: usize,
    pub reasons: Vec<String>,
}

pub struct MetricsAggregator {
    store: Arc<dyn JobStore>,
    tracker: Arc<FailureTracker>,
    thresholds: HealthThresholds,
}

impl MetricsAggregator {
    pub fn new(
        store: Arc<dyn JobStore>,
        tracker: Arc<FailureTracker>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            store,
            tracker,
            thresholds,
        }
    }

    pub fn snapshot(&self) -> Result<MetricsSnapshot> {
        let jobs = self.store.list_jobs()?;
        let totals = self.tracker.totals();
        let jobs_with_issues = jobs
            .iter()
            .filter(|job| self.tracker.consecutive_failures(&job.id) > 0)
            .count();
        let success_rate = if totals.executions == 0 {
            1.0
        } else {
            totals.successes as f64 / totals.executions as f64
        };

        Ok(MetricsSnapshot {
            total_jobs: jobs.len(),
            total_executions: totals.executions,
            total_successes: totals.successes,
            total_failures: totals.failures,
            success_rate,
            jobs_with_issues,
        })
    }

    pub fn health(&self, running: bool) -> Result<HealthReport> {
        let snapshot = self.snapshot()?;
        let mut reasons = Vec::new();

        if !running {
            reasons.push("scheduler is not running".to_string());
        }
        if snapshot.success_rate < self.thresholds.min_success_rate {
            reasons.push(format!(
                "success rate {:.2} is below {:.2}",
                snapshot.success_rate, self.thresholds.min_success_rate
            ));
        }
        if snapshot.jobs_with_issues >= self.thresholds.max_jobs_with_issues {
            reasons.push(format!(
                "{} jobs are failing (limit {})",
                snapshot.jobs_with_issues, self.thresholds.max_jobs_with_issues
            ));
        }

        let status = if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Ok(HealthReport {
            status,
            running,
            success_rate: snapshot.success_rate,
            jobs_with_issues: snapshot.jobs_with_issues,
            total_jobs: snapshot.total_jobs,
            reasons,
        })
    }

    fn export(&self, job: &Job, record: &ExecutionRecord) {
        metrics::record_job_execution(
            &job.id,
            job.tier.as_str(),
            record.success,
            record.duration(),
            record.retries_used,
        );
        metrics::set_consecutive_failures(&job.id, self.tracker.consecutive_failures(&job.id));
    }
}

impl ExecutionObserver for MetricsAggregator {
    fn on_success(&self, job: &Job, record: &ExecutionRecord) {
        self.export(job, record);
    }

    fn on_failure(&self, job: &Job, record: &ExecutionRecord) {
        self.export(job, record);
    }

    fn on_missed(&self, job: &Job, _scheduled_for: DateTime<Utc>) {
        metrics::record_missed_run(&job.id);
    }
}
