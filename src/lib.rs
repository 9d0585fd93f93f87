//! Muninn - Unified caching and cache warming for cloud API data
//!
//! This crate sits in front of cloud provider APIs (pricing, compute,
//! storage catalogs and the like) and keeps their responses cached under
//! per-service freshness policies:
//!
//! - [`CacheStore`] — TTL store with tag indexing, pattern invalidation and
//!   transparent compression, degrading to a no-op when its backend is down.
//! - [`UnifiedCacheManager`] — maps `(provider, service_type, region, params)`
//!   to keys and policies, tracks hit rates and flags refresh-ahead entries.
//! - [`RateLimiter`] — sliding-window limits per `(provider, service)`,
//!   failing open on backend outages.
//! - [`CacheWarmingService`] — prioritized, batched background refresh of
//!   hot entries through registered [`DataFetcher`]s.
//!
//! # Example
//!
//! ```rust,no_run
//! use muninn::{Muninn, ServiceType};
//! use muninn::warming::fetcher_fn;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> muninn::Result<()> {
//!     let services = Muninn::builder().build()?;
//!
//!     let pricing = fetcher_fn(|region, _params| async move {
//!         Ok(json!({ "region": region, "services": [] }))
//!     });
//!
//!     let data = services
//!         .fetch_through("aws", ServiceType::Pricing, "us-east-1", None, pricing.as_ref())
//!         .await?;
//!     println!("{} from {:?}", data.value, data.source);
//!
//!     services.close().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod ratelimit;
pub mod services;
pub mod telemetry;
pub mod types;
pub mod warming;

// Re-export main types at crate root
pub use config::Config;
pub use error::{MuninnError, Result};
pub use services::{CacheServices, DataSource, FetchedData, Muninn, MuninnBuilder};

pub use cache::{CacheBackend, CacheEntry, CacheStats, CacheStore, MemoryBackend, StoreConfig};
pub use manager::{
    CachedData, ManagerConfig, ManagerStats, OptimizationMetrics, OptimizationReport,
    PolicyTable, Recommendation, RefreshRequest, UnifiedCacheManager,
};
pub use ratelimit::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use types::{CacheKey, CachePolicy, CacheStrategy, Params, ServiceType};
pub use warming::{
    CacheWarmingService, CycleReport, DataFetcher, WarmingConfig, WarmingPriority,
    WarmingSchedule, WarmingStatus,
};
