//! Tiered job scheduler library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod background_jobs;
pub mod config;
pub mod job_store;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use background_jobs::{create_scheduler, AdminController, HandlerRegistry, JobScheduler};
pub use job_store::{JobStore, SqliteJobStore};
pub use server::{run_metrics_server, run_server, RequestsLoggingLevel};
