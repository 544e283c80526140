use super::admin::AdminController;
use super::executor::{ExecutionEngine, ExecutionObserver};
use super::failure_tracker::{FailureTracker, DEFAULT_ALERT_THRESHOLD, DEFAULT_HISTORY_CAPACITY};
use super::handler::HandlerRegistry;
use super::metrics::{HealthThresholds, MetricsAggregator};
use super::tier::{check_interval, TierPolicies};
use crate::job_store::{Job, JobStore, Tier, Trigger};
use crate::server::metrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime knobs of the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Upper bound of the random delay applied to new and overdue jobs at startup.
    pub startup_stagger: Duration,
    pub shutdown_timeout: Duration,
    pub alert_threshold: u32,
    pub history_capacity: usize,
    pub health: HealthThresholds,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            startup_stagger: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            health: HealthThresholds::default(),
        }
    }
}

/// A job as declared in configuration, before it has a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    pub handler_ref: String,
    /// Overrides the tier interval when set.
    pub interval: Option<Duration>,
    /// Initial paused state. Ignored when the job already exists.
    pub paused: bool,
}

impl JobDefinition {
    pub fn new(id: &str, tier: Tier, handler_ref: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            tier,
            handler_ref: handler_ref.to_string(),
            interval: None,
            paused: false,
        }
    }

    fn trigger(&self, tiers: &TierPolicies) -> Trigger {
        Trigger::every(
            self.interval
                .unwrap_or_else(|| tiers.policy_for(&self.tier).interval),
        )
    }
}

/// Upsert a job definition. An existing job keeps its schedule and paused
/// flag; a new one is first due at `first_run`.
pub(crate) fn upsert_definition(
    store: &dyn JobStore,
    tiers: &TierPolicies,
    definition: &JobDefinition,
    first_run: DateTime<Utc>,
) -> Result<Job> {
    if let Some(interval) = definition.interval {
        check_interval(&format!("Job {}", definition.id), interval)?;
    }
    let (next_run_time, paused) = match store.get_job(&definition.id)? {
        Some(existing) => (existing.next_run_time, existing.paused),
        None => (first_run, definition.paused),
    };
    let job = Job {
        id: definition.id.clone(),
        name: definition.name.clone(),
        tier: definition.tier.clone(),
        trigger: definition.trigger(tiers),
        next_run_time,
        paused,
        handler_ref: definition.handler_ref.clone(),
    };
    store.add_job(&job)?;
    Ok(job)
}

/// Random offset in `[0, max]`, millisecond resolution.
fn random_stagger(max: Duration) -> chrono::Duration {
    let max_ms = max.as_millis().min(i64::MAX as u128) as i64;
    if max_ms == 0 {
        return chrono::Duration::zero();
    }
    chrono::Duration::milliseconds(rand::rng().random_range(0..=max_ms))
}

/// State shared between the scheduler loop, dispatched tasks and the admin controller.
#[derive(Default)]
pub struct SharedSchedulerState {
    /// Ids of jobs with an execution in progress.
    pub in_flight: RwLock<HashSet<String>>,
    pub running: AtomicBool,
}

impl SharedSchedulerState {
    pub async fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.read().await.contains(job_id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Drives due jobs into the execution engine.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    tiers: Arc<TierPolicies>,
    engine: Arc<ExecutionEngine>,

    /// Shared state accessible by AdminController
    shared_state: Arc<SharedSchedulerState>,

    /// Task handles of dispatched jobs (not shared, managed by scheduler loop)
    running_handles: HashMap<String, JoinHandle<()>>,

    settings: SchedulerSettings,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,
}

impl JobScheduler {
    /// Register a job from configuration.
    pub fn register_job(&self, definition: &JobDefinition, now: DateTime<Utc>) -> Result<Job> {
        if !self.registry.contains(&definition.handler_ref) {
            warn!(
                "Job {} references handler '{}' which is not registered",
                definition.id, definition.handler_ref
            );
        }
        let first_run = now + random_stagger(self.settings.startup_stagger);
        let job = upsert_definition(self.store.as_ref(), &self.tiers, definition, first_run)?;
        info!(
            "Registered job: {} ({}, tier {}, {}), next run at {}",
            job.id, job.name, job.tier, job.trigger, job.next_run_time
        );
        Ok(job)
    }

    pub async fn job_count(&self) -> usize {
        self.store.list_jobs().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn shared_state(&self) -> Arc<SharedSchedulerState> {
        Arc::clone(&self.shared_state)
    }

    /// Reconcile persisted jobs with `now` and mark the scheduler running.
    ///
    /// Overdue jobs are not fired in a burst: each gets a random delay within
    /// the startup stagger. Returns the number of missed runs.
    pub fn start(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self.store.list_jobs()?;
        let mut missed = 0;

        for job in &jobs {
            if !self.registry.contains(&job.handler_ref) {
                warn!(
                    "Job {} references handler '{}' which is not registered, its runs will fail",
                    job.id, job.handler_ref
                );
            }
            if job.paused || job.next_run_time >= now {
                continue;
            }

            missed += 1;
            self.engine.notify_missed(job, job.next_run_time);
            let rescheduled = now + random_stagger(self.settings.startup_stagger);
            match self.store.update_next_run_time(&job.id, rescheduled) {
                Ok(_) => info!(
                    "Job {} missed its run at {}, rescheduled to {}",
                    job.id, job.next_run_time, rescheduled
                ),
                Err(e) => {
                    error!("Failed to reschedule missed job {}: {:#}", job.id, e);
                    metrics::record_store_write_failure("reconcile");
                }
            }
        }

        metrics::set_registered_jobs(jobs.len());
        self.shared_state.running.store(true, Ordering::SeqCst);
        info!(
            "Scheduler started with {} jobs ({} missed runs)",
            jobs.len(),
            missed
        );
        Ok(missed)
    }

    /// Dispatch every job due at `now`. Returns the dispatched ids in order.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.cleanup_completed_jobs().await;

        let jobs = match self.store.list_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to list jobs: {:#}", e);
                return Vec::new();
            }
        };
        metrics::set_registered_jobs(jobs.len());

        let mut due: Vec<Job> = {
            let in_flight = self.shared_state.in_flight.read().await;
            jobs.into_iter()
                .filter(|job| job.is_due(now) && !in_flight.contains(&job.id))
                .collect()
        };
        due.sort_by(Job::dispatch_order);

        let mut dispatched = Vec::with_capacity(due.len());
        for job in due {
            if !self
                .shared_state
                .in_flight
                .write()
                .await
                .insert(job.id.clone())
            {
                continue;
            }

            let Some(next_run_time) = job.trigger.next_after(now) else {
                error!(
                    "Job {} has an out of range trigger {:?}, skipping this run",
                    job.id, job.trigger
                );
                metrics::record_store_write_failure("reschedule");
                self.shared_state.in_flight.write().await.remove(&job.id);
                continue;
            };
            // Conditional on the job still being unpaused, so a pause issued
            // after the snapshot wins.
            match self.store.advance_next_run_time(&job.id, next_run_time) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Job {} was removed or paused before dispatch", job.id);
                    self.shared_state.in_flight.write().await.remove(&job.id);
                    continue;
                }
                Err(e) => {
                    error!(
                        "Failed to reschedule job {}, skipping this run: {:#}",
                        job.id, e
                    );
                    metrics::record_store_write_failure("reschedule");
                    self.shared_state.in_flight.write().await.remove(&job.id);
                    continue;
                }
            }

            debug!(
                "Dispatching job {} (tier {}), next run at {}",
                job.id, job.tier, next_run_time
            );
            dispatched.push(job.id.clone());
            self.spawn_job(job);
        }
        dispatched
    }

    fn spawn_job(&mut self, job: Job) {
        let engine = Arc::clone(&self.engine);
        let shared_state = Arc::clone(&self.shared_state);
        let job_id = job.id.clone();

        metrics::record_job_dispatch(job.tier.as_str());
        metrics::set_job_running(&job.id, true);

        let handle = tokio::spawn(async move {
            engine.execute(&job).await;
            metrics::set_job_running(&job.id, false);
            shared_state.in_flight.write().await.remove(&job.id);
        });
        self.running_handles.insert(job_id, handle);
    }

    /// Clean up handles for completed jobs.
    async fn cleanup_completed_jobs(&mut self) {
        let completed: Vec<String> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in completed {
            if let Some(handle) = self.running_handles.remove(&job_id) {
                if let Err(e) = handle.await {
                    error!("Dispatch task of job {} ended abnormally: {}", job_id, e);
                }
            }
        }
    }

    /// Wait for every dispatched execution to finish. Returns false on timeout.
    pub async fn wait_for_running_jobs(&mut self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> =
            self.running_handles.drain().map(|(_, h)| h).collect();
        tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok()
    }

    /// Main scheduler loop. Returns after the shutdown token is cancelled and
    /// in-flight executions have drained.
    pub async fn run(&mut self) {
        if let Err(e) = self.start(Utc::now()) {
            error!("Startup reconciliation failed: {:#}", e);
            self.shared_state.running.store(true, Ordering::SeqCst);
        }

        let mut heartbeat = tokio::time::interval(self.settings.tick_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown().await;
        info!("Job scheduler stopped");
    }

    /// Stop dispatching, drain in-flight executions and flush the store.
    pub async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");
        self.shared_state.running.store(false, Ordering::SeqCst);

        let (job_ids, handles): (Vec<String>, Vec<JoinHandle<()>>) =
            self.running_handles.drain().unzip();
        if !handles.is_empty() {
            info!(
                "Waiting up to {:?} for {} in-flight jobs: {}",
                self.settings.shutdown_timeout,
                handles.len(),
                job_ids.join(", ")
            );
        }
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(
            self.settings.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await
        .is_err()
        {
            warn!(
                "In-flight jobs did not finish within {:?}, aborting them",
                self.settings.shutdown_timeout
            );
            for abort_handle in abort_handles {
                abort_handle.abort();
            }
            self.shared_state.in_flight.write().await.clear();
        }

        if let Err(e) = self.store.flush() {
            error!("Failed to flush job store: {:#}", e);
        }
        info!("Scheduler shutdown complete");
    }
}

/// Create a scheduler and its admin controller.
pub fn create_scheduler(
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    tiers: TierPolicies,
    settings: SchedulerSettings,
    shutdown_token: CancellationToken,
) -> (JobScheduler, AdminController) {
    create_scheduler_with_observers(store, registry, tiers, settings, shutdown_token, Vec::new())
}

/// Like [`create_scheduler`], with extra observers notified after the
/// failure tracker and metrics aggregator.
pub fn create_scheduler_with_observers(
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    tiers: TierPolicies,
    settings: SchedulerSettings,
    shutdown_token: CancellationToken,
    observers: Vec<Arc<dyn ExecutionObserver>>,
) -> (JobScheduler, AdminController) {
    let tiers = Arc::new(tiers);
    let tracker = Arc::new(FailureTracker::new(
        settings.history_capacity,
        settings.alert_threshold,
    ));
    let aggregator = Arc::new(MetricsAggregator::new(
        Arc::clone(&store),
        Arc::clone(&tracker),
        settings.health,
    ));

    // The tracker goes first so the aggregator exports the updated counter
    let mut engine = ExecutionEngine::new(Arc::clone(&registry), Arc::clone(&tiers))
        .with_observer(tracker.clone())
        .with_observer(aggregator.clone());
    for observer in observers {
        engine = engine.with_observer(observer);
    }

    let shared_state = Arc::new(SharedSchedulerState::default());

    let controller = AdminController::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&tiers),
        tracker,
        aggregator,
        Arc::clone(&shared_state),
    );

    let scheduler = JobScheduler {
        store,
        registry,
        tiers,
        engine: Arc::new(engine),
        shared_state,
        running_handles: HashMap::new(),
        settings,
        shutdown_token,
    };

    (scheduler, controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::executor::ExecutionRecord;
    use crate::background_jobs::handler::{JobContext, JobError};
    use crate::background_jobs::tier::TierPolicy;
    use crate::job_store::SqliteJobStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Store wrapper whose next-run-time writes can be made to fail, and
    /// which can pause a job right after handing out a listing.
    struct FlakyStore {
        inner: SqliteJobStore,
        fail_reschedule: AtomicBool,
        pause_after_list: Mutex<Option<String>>,
    }

    impl FlakyStore {
        fn new(fail_reschedule: bool) -> Self {
            Self {
                inner: SqliteJobStore::in_memory().unwrap(),
                fail_reschedule: AtomicBool::new(fail_reschedule),
                pause_after_list: Mutex::new(None),
            }
        }
    }

    impl JobStore for FlakyStore {
        fn add_job(&self, job: &Job) -> Result<()> {
            self.inner.add_job(job)
        }
        fn get_job(&self, id: &str) -> Result<Option<Job>> {
            self.inner.get_job(id)
        }
        fn list_jobs(&self) -> Result<Vec<Job>> {
            let jobs = self.inner.list_jobs()?;
            if let Some(id) = self.pause_after_list.lock().unwrap().take() {
                self.inner.set_paused(&id, true)?;
            }
            Ok(jobs)
        }
        fn remove_job(&self, id: &str) -> Result<bool> {
            self.inner.remove_job(id)
        }
        fn set_paused(&self, id: &str, paused: bool) -> Result<bool> {
            self.inner.set_paused(id, paused)
        }
        fn update_next_run_time(&self, id: &str, next_run_time: DateTime<Utc>) -> Result<bool> {
            if self.fail_reschedule.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.update_next_run_time(id, next_run_time)
        }
        fn advance_next_run_time(&self, id: &str, next_run_time: DateTime<Utc>) -> Result<bool> {
            if self.fail_reschedule.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.advance_next_run_time(id, next_run_time)
        }
        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    #[derive(Default)]
    struct MissedObserver {
        missed: Mutex<Vec<(String, DateTime<Utc>)>>,
    }

    impl ExecutionObserver for MissedObserver {
        fn on_success(&self, _job: &Job, _record: &ExecutionRecord) {}
        fn on_failure(&self, _job: &Job, _record: &ExecutionRecord) {}
        fn on_missed(&self, job: &Job, scheduled_for: DateTime<Utc>) {
            self.missed
                .lock()
                .unwrap()
                .push((job.id.clone(), scheduled_for));
        }
    }

    fn counting_registry(counter: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("count", move |_ctx: JobContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, JobError>(1)
            }
        });
        registry.register_fn("fail", |_ctx: JobContext| async {
            Err::<u64, JobError>(JobError::ExecutionFailed("nope".to_string()))
        });
        registry
    }

    fn no_stagger() -> SchedulerSettings {
        SchedulerSettings {
            startup_stagger: Duration::ZERO,
            ..SchedulerSettings::default()
        }
    }

    fn make_job(id: &str, tier: Tier, handler: &str, next_run_time: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            name: id.to_string(),
            tier,
            trigger: Trigger::Interval { seconds: 300 },
            next_run_time,
            paused: false,
            handler_ref: handler.to_string(),
        }
    }

    fn setup(
        registry: HandlerRegistry,
    ) -> (JobScheduler, AdminController, Arc<SqliteJobStore>) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let (scheduler, controller) = create_scheduler(
            store.clone(),
            Arc::new(registry),
            TierPolicies::default(),
            no_stagger(),
            CancellationToken::new(),
        );
        (scheduler, controller, store)
    }

    #[tokio::test]
    async fn test_due_job_is_dispatched_and_rescheduled() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (mut scheduler, _controller, store) = setup(counting_registry(counter.clone()));
        let now = Utc::now();
        store
            .add_job(&make_job("a", Tier::High, "count", now))
            .unwrap();

        let dispatched = scheduler.tick(now).await;
        assert_eq!(dispatched, vec!["a"]);
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let job = store.get_job("a").unwrap().unwrap();
        assert_eq!(job.next_run_time, now + chrono::Duration::seconds(300));
        assert!(!scheduler.shared_state.is_in_flight("a").await);
    }

    #[tokio::test]
    async fn test_future_and_paused_jobs_are_skipped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (mut scheduler, _controller, store) = setup(counting_registry(counter.clone()));
        let now = Utc::now();
        let overdue = now - chrono::Duration::hours(1);
        store
            .add_job(&make_job(
                "future",
                Tier::High,
                "count",
                now + chrono::Duration::seconds(1),
            ))
            .unwrap();
        let mut paused = make_job("paused", Tier::High, "count", overdue);
        paused.paused = true;
        store.add_job(&paused).unwrap();

        assert!(scheduler.tick(now).await.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get_job("paused").unwrap().unwrap().next_run_time,
            overdue
        );
    }

    #[tokio::test]
    async fn test_dispatch_order() {
        let (mut scheduler, _controller, store) =
            setup(counting_registry(Arc::new(AtomicUsize::new(0))));
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);
        store
            .add_job(&make_job("low-b", Tier::Low, "count", now))
            .unwrap();
        store
            .add_job(&make_job("low-a", Tier::Low, "count", now))
            .unwrap();
        store
            .add_job(&make_job("high", Tier::High, "count", now))
            .unwrap();
        store
            .add_job(&make_job("medium", Tier::Medium, "count", now))
            .unwrap();
        store
            .add_job(&make_job("oldest", Tier::Low, "count", earlier))
            .unwrap();

        let dispatched = scheduler.tick(now).await;
        assert_eq!(
            dispatched,
            vec!["oldest", "high", "medium", "low-a", "low-b"]
        );
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_no_double_dispatch_while_in_flight() {
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            registry.register_fn("slow", move |_ctx: JobContext| {
                let release = Arc::clone(&release);
                let started = Arc::clone(&started);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<u64, JobError>(1)
                }
            });
        }
        let (mut scheduler, _controller, store) = setup(registry);
        let now = Utc::now();
        let mut job = make_job("slow", Tier::High, "slow", now);
        job.trigger = Trigger::Interval { seconds: 1 };
        store.add_job(&job).unwrap();

        assert_eq!(scheduler.tick(now).await, vec!["slow"]);
        // The job is due again, but still running
        let later = now + chrono::Duration::seconds(5);
        assert!(scheduler.tick(later).await.is_empty());
        assert!(scheduler.shared_state.is_in_flight("slow").await);

        // Reschedule-before-completion: the next run derives from dispatch time
        assert_eq!(
            store.get_job("slow").unwrap().unwrap().next_run_time,
            now + chrono::Duration::seconds(1)
        );

        release.notify_one();
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.tick(later).await, vec!["slow"]);
        release.notify_one();
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_failure_skips_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FlakyStore::new(true));
        let (mut scheduler, _controller) = create_scheduler(
            store.clone(),
            Arc::new(counting_registry(counter.clone())),
            TierPolicies::default(),
            no_stagger(),
            CancellationToken::new(),
        );
        let now = Utc::now();
        store
            .add_job(&make_job("a", Tier::High, "count", now))
            .unwrap();

        assert!(scheduler.tick(now).await.is_empty());
        assert!(!scheduler.shared_state.is_in_flight("a").await);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Once the store recovers the job runs on the next tick
        store.fail_reschedule.store(false, Ordering::SeqCst);
        assert_eq!(scheduler.tick(now).await, vec!["a"]);
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_paused_during_tick_is_not_dispatched() {
        let counter = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FlakyStore::new(false));
        let (mut scheduler, _controller) = create_scheduler(
            store.clone(),
            Arc::new(counting_registry(counter.clone())),
            TierPolicies::default(),
            no_stagger(),
            CancellationToken::new(),
        );
        let now = Utc::now();
        store
            .add_job(&make_job("a", Tier::High, "count", now))
            .unwrap();
        store
            .add_job(&make_job("b", Tier::High, "count", now))
            .unwrap();
        // "a" is unpaused in the listing but paused before its reschedule
        *store.pause_after_list.lock().unwrap() = Some("a".to_string());

        assert_eq!(scheduler.tick(now).await, vec!["b"]);
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let paused = store.get_job("a").unwrap().unwrap();
        assert!(paused.paused);
        assert_eq!(paused.next_run_time, now);
        assert!(!scheduler.shared_state.is_in_flight("a").await);
    }

    #[tokio::test]
    async fn test_out_of_range_interval_skips_job_without_panicking() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (mut scheduler, _controller, store) = setup(counting_registry(counter.clone()));
        let now = Utc::now();
        let mut huge = make_job("huge", Tier::High, "count", now);
        huge.trigger = Trigger::Interval {
            seconds: 10u64.pow(13),
        };
        store.add_job(&huge).unwrap();
        let mut wrapping = make_job("wrapping", Tier::High, "count", now);
        wrapping.trigger = Trigger::Interval { seconds: u64::MAX };
        store.add_job(&wrapping).unwrap();
        store
            .add_job(&make_job("normal", Tier::High, "count", now))
            .unwrap();

        assert_eq!(scheduler.tick(now).await, vec!["normal"]);
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        for id in ["huge", "wrapping"] {
            assert_eq!(store.get_job(id).unwrap().unwrap().next_run_time, now);
            assert!(!scheduler.shared_state.is_in_flight(id).await);
        }
    }

    #[tokio::test]
    async fn test_repeated_failures_counted_per_dispatch() {
        let mut tiers = TierPolicies::default();
        tiers
            .set(
                Tier::Medium,
                TierPolicy {
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    ..TierPolicy::medium()
                },
            )
            .unwrap();
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let (mut scheduler, controller) = create_scheduler(
            store.clone(),
            Arc::new(counting_registry(Arc::new(AtomicUsize::new(0)))),
            tiers,
            no_stagger(),
            CancellationToken::new(),
        );
        let now = Utc::now();
        store
            .add_job(&make_job("f", Tier::Medium, "fail", now))
            .unwrap();

        // Three failed attempts inside one dispatch count once
        scheduler.tick(now).await;
        assert!(scheduler.wait_for_running_jobs(Duration::from_secs(5)).await);

        let detail = controller.get("f").await.unwrap().unwrap();
        assert_eq!(detail.summary.consecutive_failures, 1);
        assert_eq!(detail.recent_executions.len(), 1);
        assert_eq!(detail.recent_executions[0].retries_used, 2);
    }

    #[tokio::test]
    async fn test_register_job_preserves_schedule() {
        let (scheduler, _controller, store) =
            setup(counting_registry(Arc::new(AtomicUsize::new(0))));
        let now = Utc::now();

        let definition = JobDefinition::new("sync", Tier::High, "count");
        let job = scheduler.register_job(&definition, now).unwrap();
        assert_eq!(job.next_run_time, now);
        assert_eq!(job.trigger, Trigger::Interval { seconds: 300 });

        let later = now + chrono::Duration::minutes(42);
        store.set_paused("sync", true).unwrap();
        store.update_next_run_time("sync", later).unwrap();

        let renamed = JobDefinition {
            name: "Sync everything".to_string(),
            interval: Some(Duration::from_secs(60)),
            ..definition
        };
        let job = scheduler
            .register_job(&renamed, now + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(job.name, "Sync everything");
        assert_eq!(job.trigger, Trigger::Interval { seconds: 60 });
        assert_eq!(job.next_run_time, later);
        assert!(job.paused);
    }

    #[tokio::test]
    async fn test_new_job_first_run_within_stagger() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let (scheduler, _controller) = create_scheduler(
            store,
            Arc::new(HandlerRegistry::new()),
            TierPolicies::default(),
            SchedulerSettings::default(),
            CancellationToken::new(),
        );
        let now = Utc::now();

        let job = scheduler
            .register_job(&JobDefinition::new("x", Tier::Low, "missing"), now)
            .unwrap();
        assert!(job.next_run_time >= now);
        assert!(job.next_run_time <= now + chrono::Duration::seconds(60));
        assert_eq!(job.trigger, Trigger::Interval { seconds: 7200 });
    }

    #[tokio::test]
    async fn test_startup_reconciliation_staggers_overdue_jobs() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let observer = Arc::new(MissedObserver::default());
        let (scheduler, _controller) = create_scheduler_with_observers(
            store.clone(),
            Arc::new(HandlerRegistry::new()),
            TierPolicies::default(),
            SchedulerSettings::default(),
            CancellationToken::new(),
            vec![observer.clone()],
        );
        let now = Utc::now();
        let overdue = now - chrono::Duration::hours(5);
        let future = now + chrono::Duration::hours(1);
        store
            .add_job(&make_job("overdue", Tier::High, "count", overdue))
            .unwrap();
        store
            .add_job(&make_job("future", Tier::High, "count", future))
            .unwrap();

        assert_eq!(scheduler.start(now).unwrap(), 1);
        assert!(scheduler.shared_state.is_running());

        let rescheduled = store.get_job("overdue").unwrap().unwrap().next_run_time;
        assert!(rescheduled >= now);
        assert!(rescheduled <= now + chrono::Duration::seconds(60));
        assert_eq!(
            store.get_job("future").unwrap().unwrap().next_run_time,
            future
        );
        assert_eq!(
            *observer.missed.lock().unwrap(),
            vec![("overdue".to_string(), overdue)]
        );
    }

    #[tokio::test]
    async fn test_restart_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("scheduler.db");
        let now = Utc::now();

        {
            let store = Arc::new(SqliteJobStore::new(&db_path).unwrap());
            let (scheduler, controller) = create_scheduler(
                store,
                Arc::new(counting_registry(Arc::new(AtomicUsize::new(0)))),
                TierPolicies::default(),
                no_stagger(),
                CancellationToken::new(),
            );
            for (id, tier) in [("a", Tier::High), ("b", Tier::Medium), ("c", Tier::Low)] {
                scheduler
                    .register_job(&JobDefinition::new(id, tier, "count"), now)
                    .unwrap();
            }
            assert!(controller.pause("b").await.unwrap());
        }

        let store = SqliteJobStore::new(&db_path).unwrap();
        let jobs = store.list_jobs().unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|job| job.next_run_time == now));
        let paused: Vec<&str> = jobs
            .iter()
            .filter(|job| job.paused)
            .map(|job| job.id.as_str())
            .collect();
        assert_eq!(paused, vec!["b"]);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let token = CancellationToken::new();
        let (mut scheduler, controller) = create_scheduler(
            store.clone(),
            Arc::new(counting_registry(counter.clone())),
            TierPolicies::default(),
            SchedulerSettings {
                tick_interval: Duration::from_millis(10),
                ..no_stagger()
            },
            token.clone(),
        );
        store
            .add_job(&make_job("a", Tier::High, "count", Utc::now()))
            .unwrap();

        let task = tokio::spawn(async move { scheduler.run().await });

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(controller.get_status().await.unwrap().running);

        token.cancel();
        task.await.unwrap();
        assert!(!controller.get_status().await.unwrap().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_timeout() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("stuck", |_ctx: JobContext| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<u64, JobError>(1)
        });
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let (mut scheduler, _controller) = create_scheduler(
            store.clone(),
            Arc::new(registry),
            TierPolicies::default(),
            SchedulerSettings {
                shutdown_timeout: Duration::from_secs(2),
                ..no_stagger()
            },
            CancellationToken::new(),
        );
        store
            .add_job(&make_job("stuck", Tier::High, "stuck", Utc::now()))
            .unwrap();

        scheduler.tick(Utc::now()).await;
        let started = tokio::time::Instant::now();
        scheduler.shutdown().await;

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert!(!scheduler.shared_state.is_in_flight("stuck").await);
    }
}
