//! Job definitions persisted by the job store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Priority class of a job. Determines its default interval and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tier {
    High,
    Medium,
    Low,
    Custom(String),
}

impl Tier {
    pub fn as_str(&self) -> &str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
            Tier::Custom(name) => name.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => Tier::High,
            "medium" => Tier::Medium,
            "low" => Tier::Low,
            other => Tier::Custom(other.to_string()),
        }
    }

    /// Dispatch rank, lower runs first when due times tie.
    pub fn priority(&self) -> u8 {
        match self {
            Tier::High => 0,
            Tier::Medium => 1,
            Tier::Low => 2,
            Tier::Custom(_) => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Tier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Tier::parse(&s))
    }
}

/// Longest accepted job interval: ten years.
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// When a job recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Interval { seconds: u64 },
}

impl Trigger {
    /// Sub-second remainders round up to the next whole second.
    pub fn every(period: std::time::Duration) -> Self {
        let mut seconds = period.as_secs();
        if period.subsec_nanos() > 0 {
            seconds = seconds.saturating_add(1);
        }
        Trigger::Interval { seconds }
    }

    /// `None` when the interval does not fit a `chrono::Duration`.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval { seconds } => {
                Duration::try_seconds(i64::try_from(*seconds).ok()?)
            }
        }
    }

    /// `None` when the next run would overflow the calendar.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        from.checked_add_signed(self.period()?)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval { seconds } => write!(f, "every {}s", seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    pub trigger: Trigger,
    pub next_run_time: DateTime<Utc>,
    pub paused: bool,
    /// Key into the handler registry.
    pub handler_ref: String,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_run_time <= now
    }

    /// Order in which due jobs are dispatched within a tick:
    /// earliest due time, then tier priority, then id.
    pub fn dispatch_order(a: &Job, b: &Job) -> Ordering {
        a.next_run_time
            .cmp(&b.next_run_time)
            .then_with(|| a.tier.priority().cmp(&b.tier.priority()))
            .then_with(|| a.id.cmp(&b.id))
    }
}
