mod file_config;

pub use file_config::{FileConfig, HealthConfig, JobConfig, SchedulerConfig, TierConfig};

use crate::background_jobs::{
    check_interval, HealthThresholds, JobDefinition, SchedulerSettings, TierPolicies, TierPolicy,
};
use crate::job_store::Tier;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,

    pub scheduler: SchedulerSettings,
    pub tiers: TierPolicies,
    /// Jobs to register at startup
    pub jobs: Vec<JobDefinition>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let scheduler = resolve_scheduler(
            file.scheduler.unwrap_or_default(),
            file.health.unwrap_or_default(),
        )?;
        let tiers = resolve_tiers(&file.tiers)?;
        let jobs = resolve_jobs(&file.jobs, &tiers)?;

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            scheduler,
            tiers,
            jobs,
        })
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.db_dir.join("scheduler.db")
    }
}

fn resolve_scheduler(file: SchedulerConfig, health: HealthConfig) -> Result<SchedulerSettings> {
    let defaults = SchedulerSettings::default();

    let tick_interval = file
        .tick_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(defaults.tick_interval);
    if tick_interval.is_zero() {
        bail!("scheduler.tick_interval_ms must be greater than zero");
    }

    let alert_threshold = file.alert_threshold.unwrap_or(defaults.alert_threshold);
    if alert_threshold == 0 {
        bail!("scheduler.alert_threshold must be at least 1");
    }

    let history_capacity = file.history_capacity.unwrap_or(defaults.history_capacity);
    if history_capacity == 0 {
        bail!("scheduler.history_capacity must be at least 1");
    }

    let min_success_rate = health
        .min_success_rate
        .unwrap_or(defaults.health.min_success_rate);
    if !(0.0..=1.0).contains(&min_success_rate) {
        bail!(
            "health.min_success_rate must be between 0 and 1, got {}",
            min_success_rate
        );
    }

    Ok(SchedulerSettings {
        tick_interval,
        startup_stagger: file
            .startup_stagger_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.startup_stagger),
        shutdown_timeout: file
            .shutdown_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout),
        alert_threshold,
        history_capacity,
        health: HealthThresholds {
            min_success_rate,
            max_jobs_with_issues: health
                .max_jobs_with_issues
                .unwrap_or(defaults.health.max_jobs_with_issues),
        },
    })
}

fn secs_to_duration(field: &str, tier: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("tiers.{}.{} is not a valid duration: {}", tier, field, secs))
}

fn resolve_tiers(file_tiers: &std::collections::HashMap<String, TierConfig>) -> Result<TierPolicies> {
    let mut policies = TierPolicies::default();

    let mut names: Vec<&String> = file_tiers.keys().collect();
    names.sort();
    for name in names {
        let overrides = &file_tiers[name];
        let tier = Tier::parse(name);
        // Custom tiers start from the medium policy
        let base = policies.policy_for(&tier);

        let policy = TierPolicy {
            interval: overrides
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(base.interval),
            max_retries: overrides.max_retries.unwrap_or(base.max_retries),
            initial_delay: match overrides.initial_delay_secs {
                Some(secs) => secs_to_duration("initial_delay_secs", name, secs)?,
                None => base.initial_delay,
            },
            max_delay: match overrides.max_delay_secs {
                Some(secs) => secs_to_duration("max_delay_secs", name, secs)?,
                None => base.max_delay,
            },
            backoff_base: overrides.backoff_base.unwrap_or(base.backoff_base),
            jitter_enabled: overrides.jitter.unwrap_or(base.jitter_enabled),
        };
        policies
            .set(tier, policy)
            .with_context(|| format!("Invalid [tiers.{}] section", name))?;
    }

    Ok(policies)
}

fn resolve_jobs(jobs: &[JobConfig], tiers: &TierPolicies) -> Result<Vec<JobDefinition>> {
    let mut seen = HashSet::new();
    let mut definitions = Vec::with_capacity(jobs.len());

    for job in jobs {
        if job.id.trim().is_empty() {
            bail!("Job entries must have a non-empty id");
        }
        if !seen.insert(job.id.clone()) {
            bail!("Duplicate job id in config: {}", job.id);
        }
        if job.handler.trim().is_empty() {
            bail!("Job {} must name a handler", job.id);
        }
        if let Some(secs) = job.interval_secs {
            check_interval(&format!("Job {}", job.id), Duration::from_secs(secs))?;
        }

        let tier = Tier::parse(job.tier.as_deref().unwrap_or("medium"));
        if !tiers.contains(&tier) {
            warn!(
                "Job {} uses undeclared tier '{}', the medium policy applies",
                job.id, tier
            );
        }

        definitions.push(JobDefinition {
            id: job.id.clone(),
            name: job.name.clone().unwrap_or_else(|| job.id.clone()),
            tier,
            handler_ref: job.handler.clone(),
            interval: job.interval_secs.map(Duration::from_secs),
            paused: job.paused.unwrap_or(false),
        });
    }

    Ok(definitions)
}
