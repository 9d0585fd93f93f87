//! Proactive cache warming.
//!
//! [`CacheWarmingService`] holds a list of [`WarmingSchedule`]s and a
//! registry of [`DataFetcher`]s keyed `<provider>_<service_type>`. Each
//! cycle selects the due schedules (plus any the cache manager flagged for
//! refresh-ahead), then processes them one priority tier at a time in small
//! concurrent batches with pauses in between, so warming never bursts a
//! provider's rate limit.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use muninn::{Muninn, ServiceType, WarmingPriority, WarmingSchedule};
//! # use muninn::warming::fetcher_fn;
//! # use serde_json::json;
//! # async fn example() -> muninn::Result<()> {
//! let services = Muninn::builder().build()?;
//! let warming = services.warming();
//!
//! warming.register_fetcher("aws", ServiceType::Compute, fetcher_fn(|region, _| async move {
//!     Ok(json!({ "region": region, "services": [] }))
//! }));
//! warming.add_schedule(WarmingSchedule::new(
//!     "aws", ServiceType::Compute, "us-east-1", WarmingPriority::Critical, 30,
//! ))?;
//!
//! let report = warming.run_warming_cycle().await;
//! assert_eq!(report.succeeded, 1);
//! # Ok(())
//! # }
//! ```

mod fetcher;
mod report;
mod schedule;

pub use fetcher::{DataFetcher, fetcher_fn, fetcher_key};
pub use report::{
    CycleReport, PriorityStatus, ScheduleChange, ScheduleOptimizationReport, TierReport,
    WarmingStatus,
};
pub use schedule::{
    CRITICAL_LEAD, WarmingOutcome, WarmingPriority, WarmingSchedule, WarmingState,
    default_schedules,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::manager::UnifiedCacheManager;
use crate::{MuninnError, Result, telemetry};

/// Configuration for [`CacheWarmingService`].
///
/// ```rust
/// # use muninn::WarmingConfig;
/// # use std::time::Duration;
/// let config = WarmingConfig::new()
///     .cycle_interval(Duration::from_secs(300))
///     .pauses(Duration::ZERO, Duration::ZERO, Duration::ZERO);
/// ```
#[derive(Debug, Clone)]
pub struct WarmingConfig {
    /// Concurrent warmings per batch for critical schedules. Default: 5.
    pub critical_batch_size: usize,
    /// Concurrent warmings per batch otherwise. Default: 3.
    pub batch_size: usize,
    /// Pause between critical batches. Default: 2 seconds.
    pub critical_batch_pause: Duration,
    /// Pause between other batches. Default: 5 seconds.
    pub batch_pause: Duration,
    /// Pause between priority tiers. Default: 10 seconds.
    pub tier_pause: Duration,
    /// Lower bound for optimized frequencies. Default: 15 minutes.
    pub min_frequency_minutes: u32,
    /// Upper bound for optimized frequencies. Default: 240 minutes.
    pub max_frequency_minutes: u32,
    /// Hit rate above which a schedule is warmed less often. Default: 95%.
    pub relax_above_hit_rate: f64,
    /// Hit rate below which a schedule is warmed more often. Default: 70%.
    pub tighten_below_hit_rate: f64,
    /// Interval of the background loop. Default: 15 minutes.
    pub cycle_interval: Duration,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            critical_batch_size: 5,
            batch_size: 3,
            critical_batch_pause: Duration::from_secs(2),
            batch_pause: Duration::from_secs(5),
            tier_pause: Duration::from_secs(10),
            min_frequency_minutes: 15,
            max_frequency_minutes: 240,
            relax_above_hit_rate: 95.0,
            tighten_below_hit_rate: 70.0,
            cycle_interval: Duration::from_secs(15 * 60),
        }
    }
}

impl WarmingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set batch sizes for critical and other tiers.
    pub fn batch_sizes(mut self, critical: usize, other: usize) -> Self {
        self.critical_batch_size = critical.max(1);
        self.batch_size = other.max(1);
        self
    }

    /// Set the critical batch pause, the other batch pause and the tier pause.
    pub fn pauses(mut self, critical_batch: Duration, batch: Duration, tier: Duration) -> Self {
        self.critical_batch_pause = critical_batch;
        self.batch_pause = batch;
        self.tier_pause = tier;
        self
    }

    /// Set the bounds applied by schedule optimization.
    pub fn frequency_bounds(mut self, min_minutes: u32, max_minutes: u32) -> Self {
        self.min_frequency_minutes = min_minutes.min(max_minutes);
        self.max_frequency_minutes = max_minutes.max(min_minutes);
        self
    }

    pub fn cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    fn batch_size_for(&self, priority: WarmingPriority) -> usize {
        match priority {
            WarmingPriority::Critical => self.critical_batch_size,
            _ => self.batch_size,
        }
        .max(1)
    }

    fn batch_pause_for(&self, priority: WarmingPriority) -> Duration {
        match priority {
            WarmingPriority::Critical => self.critical_batch_pause,
            _ => self.batch_pause,
        }
    }
}

type WarmResult = Result<(DateTime<Utc>, Duration)>;

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Resets the cycle flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Scheduler that keeps hot cache entries warm.
pub struct CacheWarmingService {
    manager: Arc<UnifiedCacheManager>,
    config: WarmingConfig,
    fetchers: RwLock<HashMap<String, Arc<dyn DataFetcher>>>,
    schedules: Mutex<Vec<WarmingSchedule>>,
    cycle_running: AtomicBool,
    cycles_completed: AtomicU64,
    last_cycle: Mutex<Option<CycleReport>>,
    runner: Mutex<Option<Runner>>,
}

impl CacheWarmingService {
    pub fn new(manager: Arc<UnifiedCacheManager>, config: WarmingConfig) -> Self {
        Self {
            manager,
            config,
            fetchers: RwLock::new(HashMap::new()),
            schedules: Mutex::new(Vec::new()),
            cycle_running: AtomicBool::new(false),
            cycles_completed: AtomicU64::new(0),
            last_cycle: Mutex::new(None),
            runner: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<UnifiedCacheManager> {
        &self.manager
    }

    pub fn config(&self) -> &WarmingConfig {
        &self.config
    }

    // ========================================================================
    // Fetchers and schedules
    // ========================================================================

    /// Register (or replace) the fetcher for `(provider, service_type)`.
    pub fn register_fetcher(
        &self,
        provider: &str,
        service_type: crate::ServiceType,
        fetcher: Arc<dyn DataFetcher>,
    ) {
        let key = fetcher_key(provider, service_type);
        debug!(fetcher = %key, "registered fetcher");
        self.fetchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, fetcher);
    }

    pub fn has_fetcher(&self, key: &str) -> bool {
        self.fetchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Add a schedule, replacing any with the same id.
    ///
    /// Fails with [`MuninnError::UnknownFetcher`] if no fetcher is registered
    /// for the schedule's provider and service type.
    pub fn add_schedule(&self, schedule: WarmingSchedule) -> Result<()> {
        let key = schedule.fetcher_key();
        if !self.has_fetcher(&key) {
            return Err(MuninnError::UnknownFetcher(key));
        }
        self.upsert(schedule);
        Ok(())
    }

    /// Add schedules without checking for fetchers. Due schedules whose
    /// fetcher is missing are skipped by cycles.
    pub fn extend_schedules(&self, schedules: impl IntoIterator<Item = WarmingSchedule>) {
        for schedule in schedules {
            self.upsert(schedule);
        }
    }

    /// Remove a schedule by id. Returns whether it existed.
    pub fn remove_schedule(&self, id: &str) -> bool {
        let mut schedules = self.lock_schedules();
        let before = schedules.len();
        schedules.retain(|s| s.id() != id);
        schedules.len() != before
    }

    pub fn schedule(&self, id: &str) -> Option<WarmingSchedule> {
        self.lock_schedules().iter().find(|s| s.id() == id).cloned()
    }

    /// Snapshot of all schedules in list order.
    pub fn schedules(&self) -> Vec<WarmingSchedule> {
        self.lock_schedules().clone()
    }

    // ========================================================================
    // Warming
    // ========================================================================

    /// Warm a single schedule now, regardless of whether it is due.
    ///
    /// Returns `Ok(false)` without side effects when no fetcher is registered,
    /// and `Ok(false)` after recording the error when the warming fails.
    pub async fn warm_one(&self, id: &str) -> Result<bool> {
        let schedule = self
            .schedule(id)
            .ok_or_else(|| MuninnError::ScheduleNotFound(id.to_string()))?;

        let Some(fetcher) = self.fetcher(&schedule.fetcher_key()) else {
            debug!(schedule = id, "no fetcher registered, not warming");
            return Ok(false);
        };

        self.mark_warming(&[id]);
        let joined = self.spawn_warm(fetcher, schedule.clone()).await;
        Ok(self.apply_outcome(id, schedule.priority, joined))
    }

    /// Run one warming cycle.
    ///
    /// Returns a report with `overlapped = true` and nothing done if another
    /// cycle is already running.
    pub async fn run_warming_cycle(&self) -> CycleReport {
        let Some(_guard) = CycleGuard::acquire(&self.cycle_running) else {
            debug!("warming cycle already running");
            return CycleReport::overlapped();
        };

        let started = Instant::now();
        let now = Utc::now();
        let mut report = CycleReport::new(now);

        let refresh: HashSet<String> = self
            .manager
            .take_refresh_requests()
            .into_iter()
            .map(|r| r.key)
            .collect();
        report.refresh_requests = refresh.len();

        let mut tiers: BTreeMap<WarmingPriority, Vec<WarmingSchedule>> = BTreeMap::new();
        for schedule in self.lock_schedules().iter() {
            if schedule.should_warm_at(now) || refresh.contains(&schedule.id()) {
                tiers
                    .entry(schedule.priority)
                    .or_default()
                    .push(schedule.clone());
            }
        }

        let tier_count = tiers.len();
        for (n, (priority, due)) in tiers.into_iter().enumerate() {
            let tier = self.warm_tier(priority, due).await;
            let warmed_any = tier.processed > 0;
            report.add_tier(tier);

            if warmed_any && n + 1 < tier_count && !self.config.tier_pause.is_zero() {
                tokio::time::sleep(self.config.tier_pause).await;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "warming cycle complete"
        );

        *self
            .last_cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    async fn warm_tier(&self, priority: WarmingPriority, due: Vec<WarmingSchedule>) -> TierReport {
        let mut tier = TierReport::new(priority);

        let mut runnable = Vec::with_capacity(due.len());
        for schedule in due {
            match self.fetcher(&schedule.fetcher_key()) {
                Some(fetcher) => runnable.push((schedule, fetcher)),
                None => {
                    debug!(schedule = %schedule.id(), "no fetcher registered, skipping");
                    metrics::counter!(
                        telemetry::WARMING_ATTEMPTS_TOTAL,
                        "priority" => priority.as_str(),
                        "status" => "skipped"
                    )
                    .increment(1);
                    tier.skipped += 1;
                }
            }
        }

        let batch_size = self.config.batch_size_for(priority);
        let pause = self.config.batch_pause_for(priority);

        for (n, batch) in runnable.chunks(batch_size).enumerate() {
            if n > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let ids: Vec<String> = batch.iter().map(|(s, _)| s.id()).collect();
            self.mark_warming(&ids);

            let handles = batch
                .iter()
                .map(|(schedule, fetcher)| self.spawn_warm(Arc::clone(fetcher), schedule.clone()));
            let results = join_all(handles).await;

            for (id, joined) in ids.iter().zip(results) {
                tier.processed += 1;
                if self.apply_outcome(id, priority, joined) {
                    tier.succeeded += 1;
                } else {
                    tier.failed += 1;
                }
            }
        }

        debug!(
            priority = %priority,
            processed = tier.processed,
            failed = tier.failed,
            "warming tier complete"
        );
        tier
    }

    fn spawn_warm(
        &self,
        fetcher: Arc<dyn DataFetcher>,
        schedule: WarmingSchedule,
    ) -> JoinHandle<WarmResult> {
        tokio::spawn(warm(Arc::clone(&self.manager), fetcher, schedule))
    }

    fn apply_outcome(
        &self,
        id: &str,
        priority: WarmingPriority,
        joined: std::result::Result<WarmResult, JoinError>,
    ) -> bool {
        let result = match joined {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) if e.is_panic() => Err("fetcher panicked".to_string()),
            Err(e) => Err(format!("warming task failed: {e}")),
        };

        let mut schedules = self.lock_schedules();
        let schedule = schedules.iter_mut().find(|s| s.id() == id);

        match result {
            Ok((warmed_at, elapsed)) => {
                debug!(schedule = id, elapsed_ms = elapsed.as_millis() as u64, "warmed");
                metrics::counter!(
                    telemetry::WARMING_ATTEMPTS_TOTAL,
                    "priority" => priority.as_str(),
                    "status" => "ok"
                )
                .increment(1);
                metrics::histogram!(
                    telemetry::WARMING_DURATION_SECONDS,
                    "priority" => priority.as_str()
                )
                .record(elapsed.as_secs_f64());
                if let Some(schedule) = schedule {
                    schedule.record_success(warmed_at, elapsed);
                }
                true
            }
            Err(error) => {
                warn!(schedule = id, error = %error, "warming failed");
                metrics::counter!(
                    telemetry::WARMING_ATTEMPTS_TOTAL,
                    "priority" => priority.as_str(),
                    "status" => "error"
                )
                .increment(1);
                if let Some(schedule) = schedule {
                    schedule.record_failure(error);
                }
                false
            }
        }
    }

    // ========================================================================
    // Background loop
    // ========================================================================

    /// Start running cycles every `cycle_interval`, the first immediately.
    /// Returns `false` if the loop is already running.
    pub fn start(self: &Arc<Self>, cycle_interval: Duration) -> bool {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let service: Weak<Self> = Arc::downgrade(self);
        let period = cycle_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(service) = service.upgrade() else { break };
                        service.run_warming_cycle().await;
                    }
                }
            }
            debug!("warming loop exited");
        });

        info!(interval_secs = period.as_secs(), "warming service started");
        *runner = Some(Runner { shutdown, handle });
        true
    }

    /// Start with the configured cycle interval.
    pub fn start_default(self: &Arc<Self>) -> bool {
        self.start(self.config.cycle_interval)
    }

    /// Stop the loop and wait for an in-flight cycle to finish.
    /// Returns `false` if the loop was not running.
    pub async fn stop(&self) -> bool {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Runner { shutdown, handle }) = runner else {
            return false;
        };

        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "warming loop ended abnormally");
        }
        info!("warming service stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_cycle_running(&self) -> bool {
        self.cycle_running.load(Ordering::Acquire)
    }

    // ========================================================================
    // Optimization and status
    // ========================================================================

    /// Adjust schedule frequencies from observed hit rates.
    ///
    /// Pairs with a hit rate above [`WarmingConfig::relax_above_hit_rate`]
    /// are warmed half as often (up to the maximum frequency); pairs below
    /// [`WarmingConfig::tighten_below_hit_rate`] twice as often (down to the
    /// minimum). Schedules already outside the bounds are never moved
    /// further inside them by the opposite rule.
    pub fn optimize_schedules(&self) -> ScheduleOptimizationReport {
        let report = self.manager.optimization_report();
        let (min, max) = (
            self.config.min_frequency_minutes,
            self.config.max_frequency_minutes,
        );
        let mut outcome = ScheduleOptimizationReport::default();

        for schedule in self.lock_schedules().iter_mut() {
            let Some(hit_rate) = report.hit_rate(&schedule.provider, schedule.service_type) else {
                continue;
            };
            let old = schedule.frequency_minutes;

            let (new, reason) = if hit_rate > self.config.relax_above_hit_rate && old < max {
                (
                    old.saturating_mul(2).min(max),
                    format!("hit rate {hit_rate:.1}% is high, warming less often"),
                )
            } else if hit_rate < self.config.tighten_below_hit_rate && old > min {
                (
                    (old / 2).max(min),
                    format!("hit rate {hit_rate:.1}% is low, warming more often"),
                )
            } else {
                continue;
            };

            schedule.frequency_minutes = new;
            outcome.recommendations.push(ScheduleChange {
                schedule_id: schedule.id(),
                provider: schedule.provider.clone(),
                service_type: schedule.service_type,
                region: schedule.region.clone(),
                hit_rate,
                old_frequency_minutes: old,
                new_frequency_minutes: new,
                reason,
            });
        }

        outcome.optimizations_made = outcome.recommendations.len();
        if outcome.optimizations_made > 0 {
            info!(changes = outcome.optimizations_made, "optimized warming schedules");
        }
        outcome
    }

    /// Read-only snapshot for health and metrics endpoints.
    pub fn status(&self) -> WarmingStatus {
        let now = Utc::now();
        let schedules = self.schedules();

        let by_priority = WarmingPriority::ALL
            .into_iter()
            .map(|priority| {
                let tier = schedules.iter().filter(|s| s.priority == priority);
                PriorityStatus {
                    priority,
                    schedules: tier.clone().count(),
                    due: tier.clone().filter(|s| s.should_warm_at(now)).count(),
                    warming_count: tier.clone().map(|s| s.warming_count).sum(),
                    error_count: tier.map(|s| s.error_count).sum(),
                }
            })
            .collect::<Vec<_>>();

        let mut registered_fetchers: Vec<String> = self
            .fetchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        registered_fetchers.sort();

        WarmingStatus {
            running: self.is_running(),
            cycle_in_progress: self.is_cycle_running(),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            total_schedules: schedules.len(),
            due_now: by_priority.iter().map(|p| p.due).sum(),
            total_warmings: by_priority.iter().map(|p| p.warming_count).sum(),
            total_errors: by_priority.iter().map(|p| p.error_count).sum(),
            registered_fetchers,
            by_priority,
            last_cycle: self
                .last_cycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            schedules,
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock_schedules(&self) -> MutexGuard<'_, Vec<WarmingSchedule>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetcher(&self, key: &str) -> Option<Arc<dyn DataFetcher>> {
        self.fetchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn upsert(&self, schedule: WarmingSchedule) {
        let id = schedule.id();
        let mut schedules = self.lock_schedules();
        match schedules.iter_mut().find(|s| s.id() == id) {
            Some(existing) => *existing = schedule,
            None => schedules.push(schedule),
        }
    }

    fn mark_warming<S: AsRef<str>>(&self, ids: &[S]) {
        let mut schedules = self.lock_schedules();
        for schedule in schedules.iter_mut() {
            let id = schedule.id();
            if ids.iter().any(|i| i.as_ref() == id) {
                schedule.state = WarmingState::Warming;
            }
        }
    }
}

/// Fetch one schedule's data and write it through the manager.
async fn warm(
    manager: Arc<UnifiedCacheManager>,
    fetcher: Arc<dyn DataFetcher>,
    schedule: WarmingSchedule,
) -> WarmResult {
    let started = Instant::now();
    let value = fetcher
        .fetch(&schedule.region, schedule.params.as_ref())
        .await?;

    let warmed_at = Utc::now();
    let tags = [
        format!("warmed:{}", warmed_at.to_rfc3339()),
        format!("priority:{}", schedule.priority),
    ];
    let stored = manager
        .set_cached_data(
            &schedule.provider,
            schedule.service_type,
            &schedule.region,
            &value,
            schedule.params.as_ref(),
            &tags,
        )
        .await;
    if !stored {
        return Err(MuninnError::ConnectionUnavailable(
            "warmed value was not stored".to_string(),
        ));
    }

    Ok((warmed_at, started.elapsed()))
}
