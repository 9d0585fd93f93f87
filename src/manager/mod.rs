//! Policy layer over the [`CacheStore`].
//!
//! [`UnifiedCacheManager`] maps `(provider, service_type, region, params)`
//! to a cache key and a [`CachePolicy`], tags everything it stores, tracks
//! rolling hit/miss metrics per `(provider, service_type)` and queues
//! refresh-ahead entries for the warming service.

mod metrics;
mod policy;

pub use metrics::{
    EMA_WEIGHT, OptimizationMetrics, OptimizationReport, Recommendation, RecommendationAction,
    ServiceMetrics,
};
pub use policy::PolicyTable;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheStats, CacheStore};
use crate::telemetry;
use crate::types::{
    CacheKey, CachePolicy, CacheStrategy, Params, ServiceType, provider_pattern, service_pattern,
};

/// Default share of the TTL after which a refresh-ahead entry is flagged.
pub const DEFAULT_REFRESH_AHEAD_FRACTION: f64 = 0.8;

/// Configuration for [`UnifiedCacheManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub policies: PolicyTable,
    /// Fraction of the TTL after which a refresh-ahead read is flagged.
    /// Default: 0.8.
    pub refresh_ahead_fraction: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            policies: PolicyTable::default(),
            refresh_ahead_fraction: DEFAULT_REFRESH_AHEAD_FRACTION,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Set the refresh-ahead fraction, clamped to `0.0..=1.0`.
    pub fn refresh_ahead_fraction(mut self, fraction: f64) -> Self {
        self.refresh_ahead_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}

/// A value served from the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CachedData {
    pub key: String,
    pub value: Value,
    pub age: Duration,
    pub ttl: Duration,
    /// The entry is past its TTL (only served when stale reads are allowed).
    pub stale: bool,
    /// The entry is a refresh-ahead candidate; a refresh has been queued.
    pub needs_refresh: bool,
}

/// A refresh-ahead entry waiting for the warming service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshRequest {
    pub key: String,
    pub provider: String,
    pub service_type: ServiceType,
    pub region: String,
    pub params: Option<Params>,
    pub requested_at: DateTime<Utc>,
}

impl RefreshRequest {
    /// Whether this request refers to the given lookup tuple.
    pub fn matches(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
    ) -> bool {
        self.key == CacheKey::new(provider, service_type, region, params).as_str()
    }
}

/// Store statistics plus the manager's own counters.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    #[serde(flatten)]
    pub store: CacheStats,
    pub tracked_services: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    pub pending_refreshes: usize,
}

type MetricsKey = (String, ServiceType);

/// Policy-aware cache front end.
pub struct UnifiedCacheManager {
    store: Arc<CacheStore>,
    config: ManagerConfig,
    metrics: Mutex<HashMap<MetricsKey, OptimizationMetrics>>,
    refresh_queue: Mutex<BTreeMap<String, RefreshRequest>>,
}

impl UnifiedCacheManager {
    pub fn new(store: Arc<CacheStore>, config: ManagerConfig) -> Self {
        Self {
            store,
            config,
            metrics: Mutex::new(HashMap::new()),
            refresh_queue: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Effective policy for a service type.
    pub fn policy(&self, service_type: ServiceType) -> CachePolicy {
        self.config.policies.get(service_type)
    }

    pub fn cache_key(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
    ) -> CacheKey {
        CacheKey::new(provider, service_type, region, params)
    }

    /// Look up cached data with its freshness details.
    ///
    /// A stale entry counts as a miss unless `allow_stale` is set. Every call
    /// updates the hit/miss metrics of `(provider, service_type)`; a hit is
    /// recorded only when data is returned.
    pub async fn lookup(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
        allow_stale: bool,
    ) -> Option<CachedData> {
        let key = self.cache_key(provider, service_type, region, params);
        let policy = self.policy(service_type);

        let found = match self.store.get(key.as_str()).await {
            Some(entry) => {
                let age = entry.age();
                let stale = age > entry.ttl;
                if stale && !allow_stale {
                    debug!(key = %key, age_secs = age.as_secs(), "stale entry treated as miss");
                    None
                } else {
                    let needs_refresh = policy.strategy == CacheStrategy::RefreshAhead
                        && entry.ttl_fraction_elapsed() >= self.config.refresh_ahead_fraction;
                    if needs_refresh {
                        self.queue_refresh(&key, provider, service_type, region, params);
                    }
                    Some(CachedData {
                        key: key.to_string(),
                        value: entry.value,
                        age,
                        ttl: entry.ttl,
                        stale,
                        needs_refresh,
                    })
                }
            }
            None => None,
        };

        self.record_access(provider, service_type, found.is_some());
        found
    }

    /// Look up just the cached value.
    pub async fn get_cached_data(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
        allow_stale: bool,
    ) -> Option<Value> {
        self.lookup(provider, service_type, region, params, allow_stale)
            .await
            .map(|data| data.value)
    }

    /// Store data under the policy TTL, tagged with the caller's tags plus
    /// `provider:<p>`, `service_type:<t>` and `region:<r>`.
    pub async fn set_cached_data<S: AsRef<str>>(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        data: &Value,
        params: Option<&Params>,
        tags: &[S],
    ) -> bool {
        let key = self.cache_key(provider, service_type, region, params);
        let policy = self.policy(service_type);

        let tags = tags
            .iter()
            .map(|t| t.as_ref().to_string())
            .chain([
                format!("provider:{provider}"),
                format!("service_type:{service_type}"),
                format!("region:{region}"),
            ]);

        let stored = self
            .store
            .set(key.as_str(), data, Some(policy.ttl), tags)
            .await;
        if stored {
            self.refresh_queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key.as_str());
        }
        stored
    }

    /// Drop every entry of one service, optionally in one region only.
    pub async fn invalidate_service_cache(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: Option<&str>,
    ) -> usize {
        let pattern = service_pattern(provider, service_type, region);
        self.store.invalidate_by_pattern(&pattern).await
    }

    /// Drop every entry of one provider.
    pub async fn invalidate_provider_cache(&self, provider: &str) -> usize {
        self.store
            .invalidate_by_pattern(&provider_pattern(provider))
            .await
    }

    /// Invalidate each tag in turn and sum the removals. An entry carrying
    /// several of the tags is removed, and counted, once.
    pub async fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut total = 0;
        for tag in tags {
            total += self.store.invalidate_by_tag(tag.as_ref()).await;
        }
        total
    }

    /// Fold one lookup outcome into the metrics for a pair.
    pub fn record_access(&self, provider: &str, service_type: ServiceType, hit: bool) {
        let name = if hit {
            telemetry::CACHE_HITS_TOTAL
        } else {
            telemetry::CACHE_MISSES_TOTAL
        };
        ::metrics::counter!(
            name,
            "provider" => provider.to_string(),
            "service_type" => service_type.as_str()
        )
        .increment(1);

        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((provider.to_string(), service_type))
            .or_default()
            .record(hit);
    }

    /// Current metrics for a pair, if it has been looked up at least once.
    pub fn metrics_for(
        &self,
        provider: &str,
        service_type: ServiceType,
    ) -> Option<OptimizationMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(provider.to_string(), service_type))
            .cloned()
    }

    /// Per-pair metrics, overall score and tuning recommendations.
    pub fn optimization_report(&self) -> OptimizationReport {
        let mut services: Vec<ServiceMetrics> = {
            let metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics
                .iter()
                .map(|((provider, service_type), m)| {
                    metrics::service_metrics(provider, *service_type, m, self.policy(*service_type))
                })
                .collect()
        };
        services.sort_by(|a, b| {
            (a.provider.as_str(), a.service_type).cmp(&(b.provider.as_str(), b.service_type))
        });
        OptimizationReport::build(services)
    }

    /// Drain the queued refresh-ahead requests.
    pub fn take_refresh_requests(&self) -> Vec<RefreshRequest> {
        std::mem::take(&mut *self.refresh_queue.lock().unwrap_or_else(PoisonError::into_inner))
            .into_values()
            .collect()
    }

    pub fn pending_refreshes(&self) -> usize {
        self.refresh_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn cache_stats(&self) -> ManagerStats {
        let store = self.store.stats().await;
        let (tracked_services, total_hits, total_misses) = {
            let metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics.values().fold((metrics.len(), 0, 0), |(n, h, m), s| {
                (n, h + s.hits, m + s.misses)
            })
        };
        ManagerStats {
            store,
            tracked_services,
            total_hits,
            total_misses,
            pending_refreshes: self.pending_refreshes(),
        }
    }

    fn queue_refresh(
        &self,
        key: &CacheKey,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
    ) {
        let mut queue = self
            .refresh_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if queue.contains_key(key.as_str()) {
            return;
        }
        debug!(key = %key, "queued refresh-ahead");
        ::metrics::counter!(
            telemetry::REFRESH_AHEAD_TOTAL,
            "provider" => provider.to_string(),
            "service_type" => service_type.as_str()
        )
        .increment(1);
        queue.insert(
            key.to_string(),
            RefreshRequest {
                key: key.to_string(),
                provider: provider.to_string(),
                service_type,
                region: region.to_string(),
                params: params.filter(|p| !p.is_empty()).cloned(),
                requested_at: Utc::now(),
            },
        );
    }
}
