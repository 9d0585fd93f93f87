//! Rolling hit/miss metrics and the optimization report built from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{CachePolicy, CacheStrategy, ServiceType};

/// Weight of each new observation in the moving averages.
pub const EMA_WEIGHT: f64 = 0.1;

/// Below this hit rate a service gets a "raise TTL or warm it" recommendation.
pub const LOW_HIT_RATE: f64 = 50.0;

/// Above this hit rate a short TTL gets a "double it" recommendation.
pub const HIGH_HIT_RATE: f64 = 90.0;

/// TTLs shorter than this are candidates for doubling.
pub const DOUBLE_TTL_BELOW: Duration = Duration::from_secs(2 * 3600);

/// Upper bound for a recommended TTL.
pub const MAX_RECOMMENDED_TTL: Duration = Duration::from_secs(4 * 3600);

/// Rolling cache effectiveness for one `(provider, service_type)` pair.
///
/// Rates are percentages kept as exponential moving averages. The first
/// observation seeds the average directly, so a pair that has only ever
/// hit reads as 100% rather than ramping up from zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizationMetrics {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub optimization_score: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl OptimizationMetrics {
    /// Fold one lookup outcome into the averages.
    pub fn record(&mut self, hit: bool) {
        let (hit_sample, miss_sample) = if hit { (100.0, 0.0) } else { (0.0, 100.0) };

        if self.observations() == 0 {
            self.hit_rate = hit_sample;
            self.miss_rate = miss_sample;
        } else {
            self.hit_rate = self.hit_rate * (1.0 - EMA_WEIGHT) + hit_sample * EMA_WEIGHT;
            self.miss_rate = self.miss_rate * (1.0 - EMA_WEIGHT) + miss_sample * EMA_WEIGHT;
        }

        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }

        self.optimization_score =
            (self.hit_rate * 0.7 + (100.0 - self.miss_rate) * 0.3).clamp(0.0, 100.0);
        self.last_updated = Some(Utc::now());
    }

    /// Total lookups observed.
    pub fn observations(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Metrics of one tracked pair together with its effective policy.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub provider: String,
    pub service_type: ServiceType,
    #[serde(flatten)]
    pub metrics: OptimizationMetrics,
    pub ttl_secs: u64,
    pub strategy: CacheStrategy,
}

/// What a recommendation suggests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    /// Hit rate is low: raise the TTL or add a warming schedule.
    IncreaseTtlOrWarm,
    /// Hit rate is high and the TTL short: the TTL can safely be doubled.
    DoubleTtl,
}

/// A tuning suggestion for one `(provider, service_type)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub provider: String,
    pub service_type: ServiceType,
    pub action: RecommendationAction,
    pub hit_rate: f64,
    pub current_ttl_secs: u64,
    pub suggested_ttl_secs: Option<u64>,
    pub message: String,
}

/// Snapshot of cache effectiveness across all tracked pairs.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    /// Mean optimization score over tracked pairs (0 when none are tracked).
    pub overall_score: f64,
    pub services: Vec<ServiceMetrics>,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl OptimizationReport {
    pub(crate) fn build(services: Vec<ServiceMetrics>) -> Self {
        let overall_score = if services.is_empty() {
            0.0
        } else {
            services
                .iter()
                .map(|s| s.metrics.optimization_score)
                .sum::<f64>()
                / services.len() as f64
        };

        let recommendations = services.iter().filter_map(recommend).collect();

        Self {
            overall_score,
            services,
            recommendations,
            generated_at: Utc::now(),
        }
    }

    /// Metrics for one pair, if tracked.
    pub fn service(&self, provider: &str, service_type: ServiceType) -> Option<&ServiceMetrics> {
        self.services
            .iter()
            .find(|s| s.provider == provider && s.service_type == service_type)
    }

    /// Hit rate for one pair, if tracked.
    pub fn hit_rate(&self, provider: &str, service_type: ServiceType) -> Option<f64> {
        self.service(provider, service_type)
            .map(|s| s.metrics.hit_rate)
    }
}

fn recommend(service: &ServiceMetrics) -> Option<Recommendation> {
    let hit_rate = service.metrics.hit_rate;
    let ttl = Duration::from_secs(service.ttl_secs);

    if hit_rate < LOW_HIT_RATE {
        return Some(Recommendation {
            provider: service.provider.clone(),
            service_type: service.service_type,
            action: RecommendationAction::IncreaseTtlOrWarm,
            hit_rate,
            current_ttl_secs: service.ttl_secs,
            suggested_ttl_secs: None,
            message: format!(
                "{}/{} hit rate is {hit_rate:.1}%: raise the TTL or add a warming schedule",
                service.provider, service.service_type
            ),
        });
    }

    if hit_rate > HIGH_HIT_RATE && ttl < DOUBLE_TTL_BELOW {
        let suggested = (ttl * 2).min(MAX_RECOMMENDED_TTL);
        return Some(Recommendation {
            provider: service.provider.clone(),
            service_type: service.service_type,
            action: RecommendationAction::DoubleTtl,
            hit_rate,
            current_ttl_secs: service.ttl_secs,
            suggested_ttl_secs: Some(suggested.as_secs()),
            message: format!(
                "{}/{} hit rate is {hit_rate:.1}%: TTL can grow from {}s to {}s",
                service.provider,
                service.service_type,
                ttl.as_secs(),
                suggested.as_secs()
            ),
        });
    }

    None
}

pub(crate) fn service_metrics(
    provider: &str,
    service_type: ServiceType,
    metrics: &OptimizationMetrics,
    policy: CachePolicy,
) -> ServiceMetrics {
    ServiceMetrics {
        provider: provider.to_string(),
        service_type,
        metrics: metrics.clone(),
        ttl_secs: policy.ttl.as_secs(),
        strategy: policy.strategy,
    }
}
