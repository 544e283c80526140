pub mod config;
pub mod metrics;
mod requests_logging;
mod scheduler_routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use requests_logging::{log_requests, RequestsLoggingLevel};
pub use server::{make_app, make_metrics_app, run_metrics_server, run_server};
