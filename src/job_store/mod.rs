mod models;
mod schema;
mod sqlite_job_store;

pub use models::{Job, Tier, Trigger, MAX_INTERVAL_SECS};
pub use schema::JOB_STORE_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Durable record of job definitions and their next run times.
///
/// Every mutating call has reached the backing store by the time it returns `Ok`.
/// Calls addressing an unknown id return `Ok(false)` instead of an error.
pub trait JobStore: Send + Sync {
    /// Insert a job, replacing any existing job with the same id.
    fn add_job(&self, job: &Job) -> Result<()>;
    fn get_job(&self, id: &str) -> Result<Option<Job>>;
    /// Snapshot of all jobs, sorted by id.
    fn list_jobs(&self) -> Result<Vec<Job>>;
    fn remove_job(&self, id: &str) -> Result<bool>;
    fn set_paused(&self, id: &str, paused: bool) -> Result<bool>;
    fn update_next_run_time(&self, id: &str, next_run_time: DateTime<Utc>) -> Result<bool>;
    /// Like `update_next_run_time`, but leaves a paused job untouched.
    /// Returns `Ok(false)` when the job is missing or paused.
    fn advance_next_run_time(&self, id: &str, next_run_time: DateTime<Utc>) -> Result<bool>;
    /// Push buffered writes into the main database file.
    fn flush(&self) -> Result<()>;
}
