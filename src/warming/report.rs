//! Snapshots produced by the warming service.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::schedule::{WarmingPriority, WarmingSchedule};
use crate::types::ServiceType;

/// Outcome of one priority tier within a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierReport {
    pub priority: WarmingPriority,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Due schedules without a registered fetcher.
    pub skipped: usize,
}

impl TierReport {
    pub(crate) fn new(priority: WarmingPriority) -> Self {
        Self {
            priority,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }
}

/// Outcome of one warming cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Refresh-ahead requests drained from the cache manager.
    pub refresh_requests: usize,
    pub by_priority: Vec<TierReport>,
    /// Another cycle was already running; nothing was done.
    pub overlapped: bool,
}

impl CycleReport {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration_ms: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            refresh_requests: 0,
            by_priority: Vec::new(),
            overlapped: false,
        }
    }

    pub(crate) fn overlapped() -> Self {
        Self {
            overlapped: true,
            ..Self::new(Utc::now())
        }
    }

    pub(crate) fn add_tier(&mut self, tier: TierReport) {
        self.processed += tier.processed;
        self.succeeded += tier.succeeded;
        self.failed += tier.failed;
        self.skipped += tier.skipped;
        self.by_priority.push(tier);
    }

    /// Report of one tier, if it had due schedules.
    pub fn tier(&self, priority: WarmingPriority) -> Option<&TierReport> {
        self.by_priority.iter().find(|t| t.priority == priority)
    }
}

/// One frequency change made by schedule optimization.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleChange {
    pub schedule_id: String,
    pub provider: String,
    pub service_type: ServiceType,
    pub region: String,
    pub hit_rate: f64,
    pub old_frequency_minutes: u32,
    pub new_frequency_minutes: u32,
    pub reason: String,
}

/// Result of [`CacheWarmingService::optimize_schedules`](super::CacheWarmingService::optimize_schedules).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleOptimizationReport {
    pub optimizations_made: usize,
    pub recommendations: Vec<ScheduleChange>,
}

/// Per-priority schedule counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityStatus {
    pub priority: WarmingPriority,
    pub schedules: usize,
    pub due: usize,
    pub warming_count: u64,
    pub error_count: u64,
}

/// Read-only snapshot of the warming service.
#[derive(Debug, Clone, Serialize)]
pub struct WarmingStatus {
    pub running: bool,
    pub cycle_in_progress: bool,
    pub cycles_completed: u64,
    pub total_schedules: usize,
    pub due_now: usize,
    pub total_warmings: u64,
    pub total_errors: u64,
    pub registered_fetchers: Vec<String>,
    pub by_priority: Vec<PriorityStatus>,
    pub last_cycle: Option<CycleReport>,
    pub schedules: Vec<WarmingSchedule>,
}
