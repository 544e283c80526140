use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors a job attempt can end with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("No handler registered for '{0}'")]
    HandlerNotRegistered(String),
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Read-only information handed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub handler_ref: String,
    /// 0 for the first attempt, incremented per retry.
    pub attempt: u32,
}

impl JobContext {
    pub fn new(job_id: &str, handler_ref: &str, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            handler_ref: handler_ref.to_string(),
            attempt,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }
}

/// The body of a job.
///
/// Returns the number of work units completed. Any error counts as a failed
/// attempt and is retried according to the job's tier.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<u64, JobError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, JobError>> + Send + 'static,
{
    async fn run(&self, ctx: &JobContext) -> Result<u64, JobError> {
        (self.f)(ctx.clone()).await
    }
}

/// Maps durable handler names to in-process job bodies.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            tracing::warn!("Handler '{}' registered twice, keeping the latest", name);
        }
    }

    pub fn register_fn<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u64, JobError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
