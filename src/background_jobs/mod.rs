//! Tiered background job scheduling and execution.
//!
//! Jobs are persisted in a [`JobStore`](crate::job_store::JobStore) and run by
//! name through a [`HandlerRegistry`]. The [`JobScheduler`] tick loop
//! dispatches due jobs to the [`ExecutionEngine`], which retries failures with
//! the backoff of the job's tier.

mod admin;
mod executor;
mod failure_tracker;
mod handler;
pub mod jobs;
mod metrics;
mod retry_policy;
mod scheduler;
mod tier;

pub use admin::{AdminController, ExecutionRecordInfo, JobDetail, JobSummary, SchedulerStatus};
pub use executor::{ExecutionEngine, ExecutionObserver, ExecutionRecord};
pub use failure_tracker::{ExecutionTotals, FailureTracker, JobFailureStatus};
pub use handler::{HandlerRegistry, JobContext, JobError, JobHandler};
pub use metrics::{HealthReport, HealthStatus, HealthThresholds, MetricsAggregator, MetricsSnapshot};
pub use retry_policy::RetryPolicy;
pub use scheduler::{
    create_scheduler, create_scheduler_with_observers, JobDefinition, JobScheduler,
    SchedulerSettings, SharedSchedulerState,
};
pub use tier::{check_interval, TierPolicies, TierPolicy};
