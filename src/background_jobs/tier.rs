//! Per-tier scheduling and retry policies.

use crate::job_store::{Tier, MAX_INTERVAL_SECS};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Job intervals run from one second up to [`MAX_INTERVAL_SECS`].
pub fn check_interval(owner: &str, interval: Duration) -> Result<()> {
    if interval < Duration::from_secs(1) {
        bail!("{}: interval must be at least 1 second, got {:?}", owner, interval);
    }
    if interval > Duration::from_secs(MAX_INTERVAL_SECS) {
        bail!(
            "{}: interval must not exceed {} seconds, got {}",
            owner,
            MAX_INTERVAL_SECS,
            interval.as_secs()
        );
    }
    Ok(())
}

/// Interval and retry parameters shared by all jobs of a tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPolicy {
    /// Default period between runs.
    pub interval: Duration,
    /// Retries after the first failed attempt, so at most `max_retries + 1` attempts.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Exponential growth factor applied to the delay per retry.
    pub backoff_base: f64,
    pub jitter_enabled: bool,
}

impl TierPolicy {
    pub fn high() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_base: 2.0,
            jitter_enabled: true,
        }
    }

    pub fn medium() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            max_retries: 2,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_base: 2.0,
            jitter_enabled: true,
        }
    }

    pub fn low() -> Self {
        Self {
            interval: Duration::from_secs(2 * 60 * 60),
            max_retries: 1,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(120),
            backoff_base: 2.0,
            jitter_enabled: true,
        }
    }

    pub fn validate(&self, tier: &str) -> Result<()> {
        check_interval(&format!("Tier '{}'", tier), self.interval)?;
        if self.backoff_base.is_nan() || self.backoff_base < 1.0 {
            bail!(
                "Tier '{}': backoff_base must be >= 1.0, got {}",
                tier,
                self.backoff_base
            );
        }
        if self.max_delay < self.initial_delay {
            bail!(
                "Tier '{}': max_delay ({:?}) must not be smaller than initial_delay ({:?})",
                tier,
                self.max_delay,
                self.initial_delay
            );
        }
        Ok(())
    }
}

/// Lookup table from tier to policy. Always contains the medium tier.
#[derive(Debug, Clone)]
pub struct TierPolicies {
    policies: HashMap<Tier, TierPolicy>,
}

impl TierPolicies {
    /// Replace (or add) the policy for a tier after validating it.
    pub fn set(&mut self, tier: Tier, policy: TierPolicy) -> Result<()> {
        policy.validate(tier.as_str())?;
        self.policies.insert(tier, policy);
        Ok(())
    }

    /// Policy for `tier`, falling back to the medium policy for unknown tiers.
    pub fn policy_for(&self, tier: &Tier) -> TierPolicy {
        self.policies
            .get(tier)
            .or_else(|| self.policies.get(&Tier::Medium))
            .copied()
            .unwrap_or_else(TierPolicy::medium)
    }

    pub fn contains(&self, tier: &Tier) -> bool {
        self.policies.contains_key(tier)
    }

    /// Configured tiers ordered by dispatch priority, then name.
    pub fn tiers(&self) -> Vec<Tier> {
        let mut tiers: Vec<Tier> = self.policies.keys().cloned().collect();
        tiers.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.as_str().cmp(b.as_str()))
        });
        tiers
    }
}

impl Default for TierPolicies {
    fn default() -> Self {
        let policies = HashMap::from([
            (Tier::High, TierPolicy::high()),
            (Tier::Medium, TierPolicy::medium()),
            (Tier::Low, TierPolicy::low()),
        ]);
        Self { policies }
    }
}
