//! Warming schedules: what to refresh, how often and how urgently.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fetcher::fetcher_key;
use crate::MuninnError;
use crate::types::{CacheKey, Params, ServiceType};

/// Share of the frequency after which a critical schedule is already due.
pub const CRITICAL_LEAD: f64 = 0.8;

/// Warming priority. Orders `Critical` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl WarmingPriority {
    pub const ALL: [WarmingPriority; 4] = [
        WarmingPriority::Critical,
        WarmingPriority::High,
        WarmingPriority::Medium,
        WarmingPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WarmingPriority::Critical => "critical",
            WarmingPriority::High => "high",
            WarmingPriority::Medium => "medium",
            WarmingPriority::Low => "low",
        }
    }
}

impl fmt::Display for WarmingPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarmingPriority {
    type Err = MuninnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WarmingPriority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| MuninnError::Configuration(format!("unknown warming priority: {s}")))
    }
}

/// Where a schedule is in its warming cycle.
///
/// Only the in-progress half lives here. The result of the last attempt is
/// kept in [`WarmingSchedule::last_outcome`], so the full cycle
/// `Pending -> Warming -> Success | Failed -> Pending` spans both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingState {
    #[default]
    Pending,
    Warming,
}

/// Result of the most recent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingOutcome {
    Success,
    Failed,
}

/// A recurring warming job for one cache key.
///
/// ```rust
/// # use muninn::{ServiceType, WarmingPriority, WarmingSchedule};
/// let schedule = WarmingSchedule::new("aws", ServiceType::Compute, "us-east-1", WarmingPriority::Critical, 30);
/// assert!(schedule.should_warm());
/// assert_eq!(schedule.fetcher_key(), "aws_compute");
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct WarmingSchedule {
    pub provider: String,
    pub service_type: ServiceType,
    pub region: String,
    pub params: Option<Params>,
    pub priority: WarmingPriority,
    pub frequency_minutes: u32,
    pub last_warmed: Option<DateTime<Utc>>,
    pub warming_count: u64,
    pub error_count: u64,
    pub avg_warming_time_ms: f64,
    pub state: WarmingState,
    pub last_outcome: Option<WarmingOutcome>,
    pub last_error: Option<String>,
}

impl WarmingSchedule {
    pub fn new(
        provider: impl Into<String>,
        service_type: ServiceType,
        region: impl Into<String>,
        priority: WarmingPriority,
        frequency_minutes: u32,
    ) -> Self {
        Self {
            provider: provider.into(),
            service_type,
            region: region.into(),
            params: None,
            priority,
            frequency_minutes,
            last_warmed: None,
            warming_count: 0,
            error_count: 0,
            avg_warming_time_ms: 0.0,
            state: WarmingState::Pending,
            last_outcome: None,
            last_error: None,
        }
    }

    /// Attach request parameters. Empty maps are dropped.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = (!params.is_empty()).then_some(params);
        self
    }

    /// Schedule identity: the cache key it keeps warm.
    pub fn id(&self) -> String {
        CacheKey::new(
            &self.provider,
            self.service_type,
            &self.region,
            self.params.as_ref(),
        )
        .into_string()
    }

    pub fn fetcher_key(&self) -> String {
        fetcher_key(&self.provider, self.service_type)
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_secs(u64::from(self.frequency_minutes) * 60)
    }

    /// Whether the schedule is due now.
    pub fn should_warm(&self) -> bool {
        self.should_warm_at(Utc::now())
    }

    /// Whether the schedule is due at `now`: never warmed, or a full
    /// frequency has elapsed (80% of it for critical schedules).
    pub fn should_warm_at(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_warmed else {
            return true;
        };
        let Ok(elapsed) = (now - last).to_std() else {
            return false;
        };

        let frequency = self.frequency().as_secs_f64();
        let threshold = match self.priority {
            WarmingPriority::Critical => frequency * CRITICAL_LEAD,
            _ => frequency,
        };
        elapsed.as_secs_f64() >= threshold
    }

    pub(crate) fn record_success(&mut self, at: DateTime<Utc>, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_warming_time_ms = (self.avg_warming_time_ms * self.warming_count as f64 + ms)
            / (self.warming_count + 1) as f64;
        self.warming_count += 1;
        self.last_warmed = Some(at);
        self.state = WarmingState::Pending;
        self.last_outcome = Some(WarmingOutcome::Success);
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, error: String) {
        self.error_count += 1;
        self.state = WarmingState::Pending;
        self.last_outcome = Some(WarmingOutcome::Failed);
        self.last_error = Some(error);
    }
}

const AWS_REGIONS: &[&str] = &["us-east-1", "us-west-2", "eu-west-1"];
const AZURE_REGIONS: &[&str] = &["eastus", "westeurope"];
const GCP_REGIONS: &[&str] = &["us-central1", "europe-west1"];

/// Built-in schedules: each major provider across representative regions,
/// plus the global Terraform catalogs.
pub fn default_schedules() -> Vec<WarmingSchedule> {
    let tiers = [
        (ServiceType::Pricing, WarmingPriority::Critical, 30),
        (ServiceType::Compute, WarmingPriority::Critical, 30),
        (ServiceType::Storage, WarmingPriority::High, 60),
        (ServiceType::Database, WarmingPriority::High, 60),
        (ServiceType::AiMl, WarmingPriority::Medium, 240),
    ];

    let mut schedules = Vec::new();
    for (provider, regions) in [
        ("aws", AWS_REGIONS),
        ("azure", AZURE_REGIONS),
        ("gcp", GCP_REGIONS),
    ] {
        for region in regions {
            for (service_type, priority, minutes) in tiers {
                schedules.push(WarmingSchedule::new(
                    provider,
                    service_type,
                    *region,
                    priority,
                    minutes,
                ));
            }
        }
    }

    for service_type in [ServiceType::TerraformProviders, ServiceType::TerraformModules] {
        schedules.push(WarmingSchedule::new(
            "terraform",
            service_type,
            "global",
            WarmingPriority::Low,
            24 * 60,
        ));
    }
    schedules
}
