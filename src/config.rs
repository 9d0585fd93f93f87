//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (e.g. `--config <path>`)
//! 2. `~/.muninn/config.toml` (user)
//! 3. `/etc/muninn/config.toml` (system)
//!
//! A few settings can be overridden from the environment:
//! `MUNINN_STORE_URL`, `MUNINN_DEFAULT_TTL_SECS`,
//! `MUNINN_COMPRESSION_THRESHOLD` and `MUNINN_WARMING_INTERVAL_MINUTES`.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::StoreConfig;
use crate::cache::backend::DEFAULT_MAX_CAPACITY_BYTES;
use crate::manager::{DEFAULT_REFRESH_AHEAD_FRACTION, ManagerConfig, PolicyTable};
use crate::ratelimit::RateLimitConfig;
use crate::types::{CacheStrategy, ServiceType};
use crate::warming::WarmingConfig;
use crate::{MuninnError, Result};

/// Environment variable overriding `[store] url`.
pub const ENV_STORE_URL: &str = "MUNINN_STORE_URL";
/// Environment variable overriding `[store] default_ttl_secs`.
pub const ENV_DEFAULT_TTL_SECS: &str = "MUNINN_DEFAULT_TTL_SECS";
/// Environment variable overriding `[store] compression_threshold_bytes`.
pub const ENV_COMPRESSION_THRESHOLD: &str = "MUNINN_COMPRESSION_THRESHOLD";
/// Environment variable overriding `[warming] cycle_interval_minutes`.
pub const ENV_WARMING_INTERVAL_MINUTES: &str = "MUNINN_WARMING_INTERVAL_MINUTES";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub rate_limits: RateLimitsSection,
    #[serde(default)]
    pub warming: WarmingSection,
}

/// Backing store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Backend URL (default: `memory://`).
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Memory budget of the in-process backend (default: 256 MiB).
    #[serde(default = "default_max_capacity")]
    pub max_capacity_bytes: u64,
    /// Entries larger than this are compressed (default: 1024).
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// TTL when none is given (default: 3600).
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// How long stale entries are kept for stale reads (default: 3600).
    #[serde(default = "default_ttl_secs")]
    pub stale_retention_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_capacity_bytes: default_max_capacity(),
            compression_threshold_bytes: default_compression_threshold(),
            default_ttl_secs: default_ttl_secs(),
            stale_retention_secs: default_ttl_secs(),
        }
    }
}

fn default_store_url() -> String {
    "memory://".to_string()
}

fn default_max_capacity() -> u64 {
    DEFAULT_MAX_CAPACITY_BYTES
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_ttl_secs() -> u64 {
    3600
}

/// Cache policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Share of the TTL after which refresh-ahead entries are flagged (default: 0.8).
    #[serde(default = "default_refresh_ahead_fraction")]
    pub refresh_ahead_fraction: f64,
    /// Per-service-type overrides, keyed by service type (e.g. `pricing`).
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            refresh_ahead_fraction: default_refresh_ahead_fraction(),
            policies: HashMap::new(),
        }
    }
}

fn default_refresh_ahead_fraction() -> f64 {
    DEFAULT_REFRESH_AHEAD_FRACTION
}

/// Override of one service type's policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub strategy: Option<CacheStrategy>,
}

/// Rate limit settings. Provider entries are merged over the built-in
/// provider limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitsSection {
    /// Limit for providers without an entry (default: 60).
    #[serde(default = "default_per_minute")]
    pub default_per_minute: u32,
    /// Sliding window length (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests per window by provider.
    #[serde(default)]
    pub providers: HashMap<String, u32>,
    /// Requests per window by `"provider:service"`.
    #[serde(default)]
    pub services: HashMap<String, u32>,
}

impl Default for RateLimitsSection {
    fn default() -> Self {
        Self {
            default_per_minute: default_per_minute(),
            window_secs: default_window_secs(),
            providers: HashMap::new(),
            services: HashMap::new(),
        }
    }
}

fn default_per_minute() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

/// Warming service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmingSection {
    /// Background cycle interval (default: 15).
    #[serde(default = "default_cycle_interval_minutes")]
    pub cycle_interval_minutes: u64,
    #[serde(default = "default_critical_batch_size")]
    pub critical_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_critical_batch_pause_secs")]
    pub critical_batch_pause_secs: u64,
    #[serde(default = "default_batch_pause_secs")]
    pub batch_pause_secs: u64,
    #[serde(default = "default_tier_pause_secs")]
    pub tier_pause_secs: u64,
    #[serde(default = "default_min_frequency")]
    pub min_frequency_minutes: u32,
    #[serde(default = "default_max_frequency")]
    pub max_frequency_minutes: u32,
    /// Load the built-in schedule set (default: true).
    #[serde(default = "default_true")]
    pub default_schedules: bool,
}

impl Default for WarmingSection {
    fn default() -> Self {
        Self {
            cycle_interval_minutes: default_cycle_interval_minutes(),
            critical_batch_size: default_critical_batch_size(),
            batch_size: default_batch_size(),
            critical_batch_pause_secs: default_critical_batch_pause_secs(),
            batch_pause_secs: default_batch_pause_secs(),
            tier_pause_secs: default_tier_pause_secs(),
            min_frequency_minutes: default_min_frequency(),
            max_frequency_minutes: default_max_frequency(),
            default_schedules: true,
        }
    }
}

fn default_cycle_interval_minutes() -> u64 {
    15
}

fn default_critical_batch_size() -> usize {
    5
}

fn default_batch_size() -> usize {
    3
}

fn default_critical_batch_pause_secs() -> u64 {
    2
}

fn default_batch_pause_secs() -> u64 {
    5
}

fn default_tier_pause_secs() -> u64 {
    10
}

fn default_min_frequency() -> u32 {
    15
}

fn default_max_frequency() -> u32 {
    240
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.muninn/config.toml`
    /// 3. `/etc/muninn/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?
            .ok_or_else(|| {
                MuninnError::Configuration(
                    "No config file found. Create ~/.muninn/config.toml or /etc/muninn/config.toml"
                        .to_string(),
                )
            })?;
        Self::load_from_file(&path)
    }

    /// Like [`Config::load`], but falls back to defaults when no file exists
    /// in the standard locations. An explicit path must still exist.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| MuninnError::Configuration(format!("Failed to parse config: {e}")))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MuninnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MuninnError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MuninnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".muninn").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/muninn/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = url;
        }
        if let Some(value) = lookup(ENV_DEFAULT_TTL_SECS) {
            self.store.default_ttl_secs = parse_env(ENV_DEFAULT_TTL_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_COMPRESSION_THRESHOLD) {
            self.store.compression_threshold_bytes = parse_env(ENV_COMPRESSION_THRESHOLD, &value)?;
        }
        if let Some(value) = lookup(ENV_WARMING_INTERVAL_MINUTES) {
            self.warming.cycle_interval_minutes = parse_env(ENV_WARMING_INTERVAL_MINUTES, &value)?;
        }
        Ok(self)
    }

    /// Check values that deserialization alone cannot.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cache.refresh_ahead_fraction) {
            return Err(MuninnError::Configuration(format!(
                "cache.refresh_ahead_fraction must be within 0.0..=1.0, got {}",
                self.cache.refresh_ahead_fraction
            )));
        }
        if self.rate_limits.window_secs == 0 {
            return Err(MuninnError::Configuration(
                "rate_limits.window_secs must be positive".to_string(),
            ));
        }
        if self.warming.cycle_interval_minutes == 0 {
            return Err(MuninnError::Configuration(
                "warming.cycle_interval_minutes must be positive".to_string(),
            ));
        }
        self.policy_table()?;
        self.rate_limit_config()?;
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new()
            .compression_threshold(self.store.compression_threshold_bytes)
            .default_ttl(Duration::from_secs(self.store.default_ttl_secs))
            .stale_retention(Duration::from_secs(self.store.stale_retention_secs))
    }

    pub fn policy_table(&self) -> Result<PolicyTable> {
        let mut table = PolicyTable::new();
        for (name, policy) in &self.cache.policies {
            let service_type = ServiceType::from_str(name)?;
            if let Some(ttl) = policy.ttl_secs {
                table = table.ttl(service_type, Duration::from_secs(ttl));
            }
            if let Some(strategy) = policy.strategy {
                table = table.strategy(service_type, strategy);
            }
        }
        Ok(table)
    }

    pub fn manager_config(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig::new()
            .policies(self.policy_table()?)
            .refresh_ahead_fraction(self.cache.refresh_ahead_fraction))
    }

    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        let limits = &self.rate_limits;
        let mut config = RateLimitConfig::new()
            .default_limit(limits.default_per_minute)
            .window(Duration::from_secs(limits.window_secs));

        for (provider, limit) in &limits.providers {
            config = config.provider_limit(provider.as_str(), *limit);
        }
        for (pair, limit) in &limits.services {
            let (provider, service) = pair.split_once(':').ok_or_else(|| {
                MuninnError::Configuration(format!(
                    "rate_limits.services key must be \"provider:service\", got {pair:?}"
                ))
            })?;
            config = config.service_limit(provider, service, *limit);
        }
        Ok(config)
    }

    pub fn warming_config(&self) -> WarmingConfig {
        let w = &self.warming;
        WarmingConfig::new()
            .batch_sizes(w.critical_batch_size, w.batch_size)
            .pauses(
                Duration::from_secs(w.critical_batch_pause_secs),
                Duration::from_secs(w.batch_pause_secs),
                Duration::from_secs(w.tier_pause_secs),
            )
            .frequency_bounds(w.min_frequency_minutes, w.max_frequency_minutes)
            .cycle_interval(Duration::from_secs(w.cycle_interval_minutes * 60))
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        MuninnError::Configuration(format!("Invalid value for {name}: {value:?} ({e})"))
    })
}
