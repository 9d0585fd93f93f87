//! Builder for wiring the caching services together

use std::sync::Arc;

use tracing::info;

use super::CacheServices;
use crate::cache::{CacheBackend, CacheStore, MemoryBackend, StoreConfig};
use crate::config::Config;
use crate::manager::{ManagerConfig, UnifiedCacheManager};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::warming::{CacheWarmingService, WarmingConfig, default_schedules};
use crate::{MuninnError, Result};

/// Scheme of the built-in in-process backend.
pub const MEMORY_URL_SCHEME: &str = "memory://";

/// Main entry point for creating a [`CacheServices`] container.
pub struct Muninn;

impl Muninn {
    /// Create a new builder with default configuration.
    pub fn builder() -> MuninnBuilder {
        MuninnBuilder::new()
    }
}

/// Builder for [`CacheServices`].
///
/// Settings come from a [`Config`] (defaults unless [`config`](Self::config)
/// is called); the component setters override the matching config section.
pub struct MuninnBuilder {
    config: Config,
    backend: Option<Arc<dyn CacheBackend>>,
    store: Option<StoreConfig>,
    manager: Option<ManagerConfig>,
    rate_limits: Option<RateLimitConfig>,
    warming: Option<WarmingConfig>,
    default_schedules: Option<bool>,
}

impl MuninnBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            backend: None,
            store: None,
            manager: None,
            rate_limits: None,
            warming: None,
            default_schedules: None,
        }
    }

    /// Use settings from a loaded configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom backend instead of the one named by `[store] url`.
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn store_config(mut self, store: StoreConfig) -> Self {
        self.store = Some(store);
        self
    }

    pub fn manager_config(mut self, manager: ManagerConfig) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = Some(rate_limits);
        self
    }

    pub fn warming_config(mut self, warming: WarmingConfig) -> Self {
        self.warming = Some(warming);
        self
    }

    /// Whether to load the built-in warming schedules.
    pub fn default_schedules(mut self, enabled: bool) -> Self {
        self.default_schedules = Some(enabled);
        self
    }

    /// Build the services.
    pub fn build(self) -> Result<CacheServices> {
        let config = self.config;
        config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => backend_from_url(&config.store.url, config.store.max_capacity_bytes)?,
        };

        let store_config = self.store.unwrap_or_else(|| config.store_config());
        let manager_config = match self.manager {
            Some(manager) => manager,
            None => config.manager_config()?,
        };
        let rate_limits = match self.rate_limits {
            Some(rate_limits) => rate_limits,
            None => config.rate_limit_config()?,
        };
        let warming_config = self.warming.unwrap_or_else(|| config.warming_config());

        let store = Arc::new(CacheStore::new(Arc::clone(&backend), store_config));
        let manager = Arc::new(UnifiedCacheManager::new(Arc::clone(&store), manager_config));
        let rate_limiter = Arc::new(RateLimiter::new(Arc::clone(&backend), rate_limits));
        let warming = Arc::new(CacheWarmingService::new(Arc::clone(&manager), warming_config));

        if self
            .default_schedules
            .unwrap_or(config.warming.default_schedules)
        {
            warming.extend_schedules(default_schedules());
        }

        info!(
            backend = backend.name(),
            schedules = warming.schedules().len(),
            "cache services ready"
        );

        Ok(CacheServices {
            store,
            manager,
            rate_limiter,
            warming,
        })
    }
}

impl Default for MuninnBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_from_url(url: &str, max_capacity_bytes: u64) -> Result<Arc<dyn CacheBackend>> {
    if url.starts_with(MEMORY_URL_SCHEME) {
        return Ok(Arc::new(MemoryBackend::with_max_capacity(max_capacity_bytes)));
    }
    Err(MuninnError::Configuration(format!(
        "unsupported store url {url:?}: only {MEMORY_URL_SCHEME} is built in, pass other backends to MuninnBuilder::backend"
    )))
}
