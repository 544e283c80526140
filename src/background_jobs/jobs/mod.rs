//! Built-in maintenance handlers.
//!
//! Registered under fixed names so configuration can reference them as a
//! job's `handler`.

pub mod heartbeat;
pub mod store_checkpoint;

pub use heartbeat::HeartbeatHandler;
pub use store_checkpoint::StoreCheckpointHandler;

use super::handler::HandlerRegistry;
use crate::job_store::JobStore;
use std::sync::Arc;

/// Register every built-in handler.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, store: Arc<dyn JobStore>) {
    registry.register(HeartbeatHandler::NAME, Arc::new(HeartbeatHandler));
    registry.register(
        StoreCheckpointHandler::NAME,
        Arc::new(StoreCheckpointHandler::new(store)),
    );
}
