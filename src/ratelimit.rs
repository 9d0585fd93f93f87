//! Sliding-window rate limiting for live cloud API calls.
//!
//! Each `(provider, service)` pair has its own window of request instants
//! over the trailing [`RateLimitConfig::window`] (60 s by default). Limits
//! resolve from the most specific configuration:
//!
//! 1. `provider:service` override
//! 2. per-provider default (`aws` and `gcp` are stricter than Azure's
//!    public pricing endpoint)
//! 3. global default
//!
//! When the backend is unavailable the limiter fails open: requests are
//! admitted with `remaining = -1` and `degraded = true`, so an outage of the
//! caching infrastructure never blocks legitimate API usage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheBackend, WindowState};
use crate::telemetry;

/// Built-in per-provider limits, in requests per minute.
pub const DEFAULT_PROVIDER_LIMITS: &[(&str, u32)] = &[
    ("aws", 100),
    ("gcp", 100),
    ("azure", 1000),
    ("terraform", 60),
];

/// Configuration for [`RateLimiter`].
///
/// ```rust
/// # use muninn::RateLimitConfig;
/// let config = RateLimitConfig::new()
///     .default_limit(30)
///     .provider_limit("aws", 50)
///     .service_limit("aws", "pricing", 10);
/// assert_eq!(config.limit_for("aws", "pricing"), 10);
/// assert_eq!(config.limit_for("aws", "compute"), 50);
/// assert_eq!(config.limit_for("oracle", "compute"), 30);
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Limit for providers without an explicit entry. Default: 60.
    pub default_limit: u32,
    /// Per-provider limits.
    pub providers: HashMap<String, u32>,
    /// Per `(provider, service)` limits.
    pub services: HashMap<(String, String), u32>,
    /// Length of the sliding window. Default: 60 seconds.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 60,
            providers: DEFAULT_PROVIDER_LIMITS
                .iter()
                .map(|(p, l)| (p.to_string(), *l))
                .collect(),
            services: HashMap::new(),
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Create a new config with the built-in provider limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback limit.
    pub fn default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    /// Set a provider-wide limit.
    pub fn provider_limit(mut self, provider: impl Into<String>, limit: u32) -> Self {
        self.providers.insert(provider.into(), limit);
        self
    }

    /// Set a limit for one service of a provider.
    pub fn service_limit(
        mut self,
        provider: impl Into<String>,
        service: impl Into<String>,
        limit: u32,
    ) -> Self {
        self.services.insert((provider.into(), service.into()), limit);
        self
    }

    /// Set the window length.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Resolve the limit for a `(provider, service)` pair.
    pub fn limit_for(&self, provider: &str, service: &str) -> u32 {
        self.services
            .get(&(provider.to_string(), service.to_string()))
            .or_else(|| self.providers.get(provider))
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Requests still available in the current window; `-1` when degraded.
    pub remaining: i64,
    pub limit: u32,
    /// Requests inside the window (including this one when admitted).
    pub current: u32,
    /// When the oldest request leaves the window.
    pub reset_at: Option<DateTime<Utc>>,
    /// How long until the oldest request leaves the window.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    /// The backend was unavailable and the check failed open.
    pub degraded: bool,
}

impl RateLimitStatus {
    fn from_window(limit: u32, state: WindowState) -> Self {
        let reset_at = state
            .oldest_expires_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        Self {
            allowed: state.allowed,
            remaining: i64::from(limit) - i64::from(state.count),
            limit,
            current: state.count,
            reset_at,
            retry_after: if state.allowed {
                None
            } else {
                state.oldest_expires_in
            },
            degraded: false,
        }
    }

    fn fail_open(limit: u32) -> Self {
        Self {
            allowed: true,
            remaining: -1,
            limit,
            current: 0,
            reset_at: None,
            retry_after: None,
            degraded: true,
        }
    }
}

/// Per-`(provider, service)` sliding-window limiter.
pub struct RateLimiter {
    backend: Arc<dyn CacheBackend>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn CacheBackend>, config: RateLimitConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The configured limit for a pair.
    pub fn limit_for(&self, provider: &str, service: &str) -> u32 {
        self.config.limit_for(provider, service)
    }

    /// Check and, if under the limit, record a request.
    pub async fn check_rate_limit(&self, provider: &str, service: &str) -> RateLimitStatus {
        let status = self.evaluate(provider, service, true).await;
        if !status.allowed {
            debug!(
                provider,
                service,
                limit = status.limit,
                retry_after = ?status.retry_after,
                "rate limit reached"
            );
            metrics::counter!(
                telemetry::RATE_LIMIT_REJECTIONS_TOTAL,
                "provider" => provider.to_string(),
                "service" => service.to_string()
            )
            .increment(1);
        }
        status
    }

    /// Report the window for a pair without recording a request.
    pub async fn rate_limit_status(&self, provider: &str, service: &str) -> RateLimitStatus {
        self.evaluate(provider, service, false).await
    }

    async fn evaluate(&self, provider: &str, service: &str, record: bool) -> RateLimitStatus {
        let limit = self.limit_for(provider, service);
        let key = window_key(provider, service);

        match self
            .backend
            .window_hit(&key, self.config.window, limit, record)
            .await
        {
            Ok(state) => RateLimitStatus::from_window(limit, state),
            Err(e) => {
                warn!(provider, service, error = %e, "rate limiter backend unavailable, failing open");
                metrics::counter!(
                    telemetry::RATE_LIMIT_FAIL_OPEN_TOTAL,
                    "provider" => provider.to_string()
                )
                .increment(1);
                RateLimitStatus::fail_open(limit)
            }
        }
    }
}

fn window_key(provider: &str, service: &str) -> String {
    format!("rate_limit:{provider}:{service}")
}
