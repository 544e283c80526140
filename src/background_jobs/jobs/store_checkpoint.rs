use crate::background_jobs::handler::{JobContext, JobError, JobHandler};
use crate::job_store::JobStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Checkpoints the job database so its write-ahead log does not grow unbounded.
pub struct StoreCheckpointHandler {
    store: Arc<dyn JobStore>,
}

impl StoreCheckpointHandler {
    pub const NAME: &'static str = "job_store_checkpoint";

    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for StoreCheckpointHandler {
    async fn run(&self, ctx: &JobContext) -> Result<u64, JobError> {
        let store = Arc::clone(&self.store);
        // SQLite I/O is blocking
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?
            .map_err(|e| JobError::ExecutionFailed(format!("{:#}", e)))?;
        debug!("Job {} checkpointed the job store", ctx.job_id);
        Ok(1)
    }
}
