use crate::background_jobs::handler::{JobContext, JobError, JobHandler};
use async_trait::async_trait;
use tracing::info;

/// Logs a liveness line. Useful to confirm the scheduler keeps ticking.
pub struct HeartbeatHandler;

impl HeartbeatHandler {
    pub const NAME: &'static str = "heartbeat";
}

#[async_trait]
impl JobHandler for HeartbeatHandler {
    async fn run(&self, ctx: &JobContext) -> Result<u64, JobError> {
        info!("Heartbeat from job {}", ctx.job_id);
        Ok(1)
    }
}
