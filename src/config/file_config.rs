use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,

    pub scheduler: Option<SchedulerConfig>,
    pub health: Option<HealthConfig>,
    /// Keyed by tier name: high, medium, low or any custom name
    pub tiers: HashMap<String, TierConfig>,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: Option<u64>,
    pub startup_stagger_secs: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
    pub alert_threshold: Option<u32>,
    pub history_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub min_success_rate: Option<f64>,
    pub max_jobs_with_issues: Option<usize>,
}

/// Overrides for one tier. Unset fields keep the built-in value.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct TierConfig {
    pub interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
    pub backoff_base: Option<f64>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub id: String,
    pub name: Option<String>,
    /// Defaults to "medium"
    pub tier: Option<String>,
    pub handler: String,
    pub interval_secs: Option<u64>,
    pub paused: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
