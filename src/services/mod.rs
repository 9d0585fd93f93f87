//! Service container
//!
//! [`CacheServices`] owns one instance of each component, constructed once by
//! [`MuninnBuilder`] and shared with consumers through `Arc`s.

mod builder;

pub use builder::{MEMORY_URL_SCHEME, Muninn, MuninnBuilder};

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::CacheStore;
use crate::manager::{ManagerStats, OptimizationReport, UnifiedCacheManager};
use crate::ratelimit::RateLimiter;
use crate::types::{Params, ServiceType};
use crate::warming::{CacheWarmingService, DataFetcher, WarmingStatus};
use crate::{MuninnError, Result};

/// Where [`CacheServices::fetch_through`] got its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Fresh cached data.
    Cache,
    /// Fetched live and written back.
    Live,
    /// Stale cached data, served because the live API was rate limited.
    Stale,
}

/// Data returned by [`CacheServices::fetch_through`].
#[derive(Debug, Clone, Serialize)]
pub struct FetchedData {
    pub value: Value,
    pub source: DataSource,
}

/// The caching subsystem: store, manager, rate limiter and warming service.
pub struct CacheServices {
    store: Arc<CacheStore>,
    manager: Arc<UnifiedCacheManager>,
    rate_limiter: Arc<RateLimiter>,
    warming: Arc<CacheWarmingService>,
}

impl CacheServices {
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<UnifiedCacheManager> {
        &self.manager
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn warming(&self) -> &Arc<CacheWarmingService> {
        &self.warming
    }

    pub async fn cache_stats(&self) -> ManagerStats {
        self.manager.cache_stats().await
    }

    pub fn optimization_report(&self) -> OptimizationReport {
        self.manager.optimization_report()
    }

    pub fn warming_status(&self) -> WarmingStatus {
        self.warming.status()
    }

    /// Serve from cache, or fetch live within the rate limit and cache the result.
    ///
    /// When the rate limit is reached, stale cached data is served if any is
    /// retained; otherwise [`MuninnError::RateLimited`] is returned. Fetch
    /// errors are returned as-is and nothing is cached.
    pub async fn fetch_through(
        &self,
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
        fetcher: &dyn DataFetcher,
    ) -> Result<FetchedData> {
        if let Some(value) = self
            .manager
            .get_cached_data(provider, service_type, region, params, false)
            .await
        {
            return Ok(FetchedData {
                value,
                source: DataSource::Cache,
            });
        }

        let status = self
            .rate_limiter
            .check_rate_limit(provider, service_type.as_str())
            .await;
        if !status.allowed {
            let key = self.manager.cache_key(provider, service_type, region, params);
            if let Some(entry) = self.store.get(key.as_str()).await {
                debug!(key = %key, "rate limited, serving stale data");
                return Ok(FetchedData {
                    value: entry.value,
                    source: DataSource::Stale,
                });
            }
            return Err(MuninnError::RateLimited {
                retry_after: status.retry_after,
            });
        }

        let value = fetcher.fetch(region, params).await?;
        self.manager
            .set_cached_data(provider, service_type, region, &value, params, &[] as &[&str])
            .await;

        Ok(FetchedData {
            value,
            source: DataSource::Live,
        })
    }

    /// Stop background work. Waits for an in-flight warming cycle.
    pub async fn close(&self) {
        self.warming.stop().await;
    }
}
