use super::handler::{HandlerRegistry, JobContext, JobError, JobHandler};
use super::retry_policy::RetryPolicy;
use super::tier::TierPolicies;
use crate::job_store::{Job, Tier};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of one dispatch of a job, covering every attempt made for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub job_id: String,
    pub tier: Tier,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub retries_used: u32,
    pub error: Option<String>,
    /// Units of work reported by the successful attempt.
    pub result_count: u64,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Receives execution outcomes. Called synchronously by the engine, so
/// implementations must not block.
pub trait ExecutionObserver: Send + Sync {
    fn on_success(&self, job: &Job, record: &ExecutionRecord);
    fn on_failure(&self, job: &Job, record: &ExecutionRecord);
    /// A run that should have happened while the scheduler was down.
    fn on_missed(&self, _job: &Job, _scheduled_for: DateTime<Utc>) {}
}

/// Runs a single job dispatch with retries and backoff.
pub struct ExecutionEngine {
    registry: Arc<HandlerRegistry>,
    tiers: Arc<TierPolicies>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<HandlerRegistry>, tiers: Arc<TierPolicies>) -> Self {
        Self {
            registry,
            tiers,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Execute `job` until it succeeds or its tier's retries are exhausted.
    ///
    /// Never fails: every outcome is reported through the returned record and
    /// the registered observers.
    pub async fn execute(&self, job: &Job) -> ExecutionRecord {
        let start_time = Utc::now();
        let started = tokio::time::Instant::now();

        let (outcome, retries_used) = match self.registry.get(&job.handler_ref) {
            Some(handler) => self.run_with_retries(job, handler).await,
            None => (
                Err(JobError::HandlerNotRegistered(job.handler_ref.clone())),
                0,
            ),
        };

        let elapsed = started.elapsed();
        let end_time = start_time
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        let record = match outcome {
            Ok(result_count) => {
                info!(
                    "Job {} completed in {:?} ({} retries, {} units)",
                    job.id, elapsed, retries_used, result_count
                );
                ExecutionRecord {
                    job_id: job.id.clone(),
                    tier: job.tier.clone(),
                    start_time,
                    end_time,
                    success: true,
                    retries_used,
                    error: None,
                    result_count,
                }
            }
            Err(e) => {
                error!(
                    "Job {} failed after {} retries in {:?}: {}",
                    job.id, retries_used, elapsed, e
                );
                ExecutionRecord {
                    job_id: job.id.clone(),
                    tier: job.tier.clone(),
                    start_time,
                    end_time,
                    success: false,
                    retries_used,
                    error: Some(e.to_string()),
                    result_count: 0,
                }
            }
        };

        for observer in &self.observers {
            if record.success {
                observer.on_success(job, &record);
            } else {
                observer.on_failure(job, &record);
            }
        }
        record
    }

    /// Report a missed run to every observer.
    pub fn notify_missed(&self, job: &Job, scheduled_for: DateTime<Utc>) {
        for observer in &self.observers {
            observer.on_missed(job, scheduled_for);
        }
    }

    async fn run_with_retries(
        &self,
        job: &Job,
        handler: Arc<dyn JobHandler>,
    ) -> (Result<u64, JobError>, u32) {
        let retry_policy = RetryPolicy::from(&self.tiers.policy_for(&job.tier));
        let mut retries_used = 0;

        loop {
            let ctx = JobContext::new(&job.id, &job.handler_ref, retries_used);
            match run_attempt(Arc::clone(&handler), ctx).await {
                Ok(count) => return (Ok(count), retries_used),
                Err(e) if retry_policy.should_retry(retries_used) => {
                    retries_used += 1;
                    let delay = retry_policy.delay_for(retries_used, &mut rand::rng());
                    warn!(
                        "Job {} attempt {} failed: {}. Retrying in {:?}",
                        job.id, retries_used, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), retries_used),
            }
        }
    }
}

/// Run one attempt on its own task so a panic is contained.
async fn run_attempt(handler: Arc<dyn JobHandler>, ctx: JobContext) -> Result<u64, JobError> {
    let task = tokio::spawn(async move { handler.run(&ctx).await });
    match task.await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobError::Panicked(message))
        }
        Err(join_error) => Err(JobError::ExecutionFailed(join_error.to_string())),
    }
}
