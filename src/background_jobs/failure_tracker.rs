//! Per-job consecutive failure counters and bounded execution history.

use super::executor::{ExecutionObserver, ExecutionRecord};
use crate::job_store::Job;
use crate::server::metrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::error;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_ALERT_THRESHOLD: u32 = 5;

/// Number of most recent executions the success rate is computed over.
const SUCCESS_RATE_WINDOW: usize = 10;

/// Lifetime totals, unaffected by history eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionTotals {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailureStatus {
    /// Newest first.
    pub recent_executions: Vec<ExecutionRecord>,
    /// `None` until the job has run at least once.
    pub success_rate_last_10: Option<f64>,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct TrackerState {
    history: HashMap<String, VecDeque<ExecutionRecord>>,
    consecutive_failures: HashMap<String, u32>,
    totals: ExecutionTotals,
}

pub struct FailureTracker {
    capacity: usize,
    alert_threshold: u32,
    state: Mutex<TrackerState>,
}

impl FailureTracker {
    pub fn new(capacity: usize, alert_threshold: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            alert_threshold,
            state: Mutex::new(TrackerState::default()),
        }
    }

    // The state stays consistent even if a holder panicked: every update is a
    // single insert or increment.
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an execution and return the job's new consecutive failure count.
    pub fn record(&self, record: ExecutionRecord) -> u32 {
        let job_id = record.job_id.clone();
        let success = record.success;

        let count = {
            let mut state = self.lock_state();
            state.totals.executions += 1;
            if success {
                state.totals.successes += 1;
            } else {
                state.totals.failures += 1;
            }

            let history = state.history.entry(job_id.clone()).or_default();
            history.push_back(record);
            while history.len() > self.capacity {
                history.pop_front();
            }

            let counter = state.consecutive_failures.entry(job_id.clone()).or_insert(0);
            if success {
                *counter = 0;
            } else {
                *counter += 1;
            }
            *counter
        };

        if !success && count == self.alert_threshold {
            error!(
                alert = "consecutive_failures",
                job_id = %job_id,
                consecutive_failures = count,
                "Job {} failed {} times in a row",
                job_id,
                count
            );
            metrics::record_failure_alert(&job_id);
        }
        count
    }

    pub fn consecutive_failures(&self, job_id: &str) -> u32 {
        self.lock_state()
            .consecutive_failures
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn status(&self, job_id: &str) -> JobFailureStatus {
        let state = self.lock_state();
        let recent_executions: Vec<ExecutionRecord> = state
            .history
            .get(job_id)
            .map(|history| history.iter().rev().cloned().collect())
            .unwrap_or_default();

        let window: Vec<&ExecutionRecord> =
            recent_executions.iter().take(SUCCESS_RATE_WINDOW).collect();
        let success_rate_last_10 = if window.is_empty() {
            None
        } else {
            let successes = window.iter().filter(|r| r.success).count();
            Some(successes as f64 / window.len() as f64)
        };

        JobFailureStatus {
            recent_executions,
            success_rate_last_10,
            consecutive_failures: state
                .consecutive_failures
                .get(job_id)
                .copied()
                .unwrap_or(0),
        }
    }

    pub fn totals(&self) -> ExecutionTotals {
        self.lock_state().totals
    }

    /// Drop history and counter of a removed job. Totals are kept.
    pub fn forget(&self, job_id: &str) {
        let mut state = self.lock_state();
        state.history.remove(job_id);
        state.consecutive_failures.remove(job_id);
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_ALERT_THRESHOLD)
    }
}

impl ExecutionObserver for FailureTracker {
    fn on_success(&self, _job: &Job, record: &ExecutionRecord) {
        self.record(record.clone());
    }

    fn on_failure(&self, _job: &Job, record: &ExecutionRecord) {
        self.record(record.clone());
    }
}
