use axum::extract::FromRef;
use std::time::Instant;

use crate::background_jobs::AdminController;

use super::ServerConfig;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub admin: AdminController,
}

impl ServerState {
    pub fn new(config: ServerConfig, admin: AdminController) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            admin,
        }
    }
}

impl FromRef<ServerState> for AdminController {
    fn from_ref(input: &ServerState) -> Self {
        input.admin.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
