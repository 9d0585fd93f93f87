//! Tagged TTL store on top of a [`CacheBackend`].
//!
//! The store never fails: backend errors are logged, counted under
//! [`telemetry::BACKEND_ERRORS_TOTAL`] and reported as a miss, `false` or a
//! zero count, so an outage makes the cache transparently absent.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::entry::CacheEntry;
use crate::{MuninnError, Result, telemetry};

/// Prefix of the backend sets that index keys by tag.
const TAG_SET_PREFIX: &str = "cache_tag:";

/// Configuration for [`CacheStore`].
///
/// ```rust
/// # use muninn::cache::StoreConfig;
/// # use std::time::Duration;
/// let config = StoreConfig::new()
///     .compression_threshold(4096)
///     .stale_retention(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Encoded entries larger than this many bytes are compressed. Default: 1 KiB.
    pub compression_threshold: usize,
    /// TTL applied when a caller gives none. Default: 1 hour.
    pub default_ttl: Duration,
    /// How long an entry is kept after it goes stale, so stale reads remain
    /// possible. Default: 1 hour.
    pub stale_retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
            default_ttl: Duration::from_secs(3600),
            stale_retention: Duration::from_secs(3600),
        }
    }
}

impl StoreConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compression threshold in bytes.
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Set the TTL used when none is given.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set how long stale entries are retained.
    pub fn stale_retention(mut self, retention: Duration) -> Self {
        self.stale_retention = retention;
        self
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub connected: bool,
    pub backend: String,
    pub total_keys: u64,
    pub memory_used_bytes: u64,
    pub tag_sets: u64,
    pub rate_windows: u64,
    pub compression_threshold_bytes: usize,
    pub default_ttl_secs: u64,
}

/// Key/value cache with TTLs, a tag index and pattern invalidation.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    config: StoreConfig,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether the backend currently answers a health check.
    pub async fn is_connected(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    /// Look up an entry.
    ///
    /// Returns `None` when the key is absent, physically expired, or the
    /// backend is unreachable. Stale-but-retained entries are returned; use
    /// [`CacheEntry::is_stale`] to tell them apart.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.degraded("get", &e);
                return None;
            }
        };

        match CacheEntry::decode(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key, error = %e, "dropping undecodable cache entry");
                if let Err(e) = self.backend.delete(key).await {
                    self.degraded("delete", &e);
                }
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl` (or the default TTL), indexed
    /// under every tag. Returns `false` if nothing was stored.
    pub async fn set<I, S>(&self, key: &str, value: &Value, ttl: Option<Duration>, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry::new(value.clone(), ttl, tags.into_iter().map(Into::into).collect());

        let bytes = match entry.encode(self.config.compression_threshold) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache entry");
                return false;
            }
        };
        let size = bytes.len();

        let previous_tags = match self.stored_tags(key).await {
            Ok(tags) => tags,
            Err(e) => {
                self.degraded("get", &e);
                return false;
            }
        };

        if let Err(e) = self
            .backend
            .set(key, bytes, ttl + self.config.stale_retention)
            .await
        {
            self.degraded("set", &e);
            return false;
        }

        for tag in previous_tags.difference(&entry.tags) {
            if let Err(e) = self.backend.set_remove(&tag_set(tag), key).await {
                self.degraded("set_remove", &e);
            }
        }
        for tag in &entry.tags {
            if let Err(e) = self.backend.set_add(&tag_set(tag), key).await {
                self.degraded("set_add", &e);
                return false;
            }
        }

        debug!(key, size, ttl_secs = ttl.as_secs(), "cached entry");
        true
    }

    /// Remove an entry and de-index it from its tags.
    pub async fn delete(&self, key: &str) -> bool {
        let tags = match self.stored_tags(key).await {
            Ok(tags) => tags,
            Err(e) => {
                self.degraded("get", &e);
                return false;
            }
        };

        let removed = match self.backend.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                self.degraded("delete", &e);
                return false;
            }
        };

        for tag in &tags {
            if let Err(e) = self.backend.set_remove(&tag_set(tag), key).await {
                self.degraded("set_remove", &e);
            }
        }
        removed
    }

    /// Remove every key matching a glob pattern such as
    /// `cloud_api:aws:compute:*:*`. Returns the number removed.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let keys = match self.backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                self.degraded("keys", &e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in &keys {
            if self.delete(key).await {
                removed += 1;
            }
        }

        debug!(pattern, removed, "invalidated by pattern");
        metrics::counter!(telemetry::INVALIDATIONS_TOTAL, "kind" => "pattern")
            .increment(removed as u64);
        removed
    }

    /// Remove every entry carrying `tag`, then clear the tag's index.
    ///
    /// Only entries actually removed are counted, so a key already removed
    /// through another tag is not counted twice. Index members whose entry
    /// is gone, or no longer carries the tag, are dropped from the index
    /// without touching the entry.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let set = tag_set(tag);
        let members = match self.backend.set_members(&set).await {
            Ok(members) => members,
            Err(e) => {
                self.degraded("set_members", &e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in &members {
            match self.stored_tags(key).await {
                Ok(tags) if tags.contains(tag) => {
                    if self.delete(key).await {
                        removed += 1;
                    }
                }
                Ok(_) => debug!(key, tag, "pruned stale tag index member"),
                Err(e) => self.degraded("get", &e),
            }
        }

        if let Err(e) = self.backend.set_delete(&set).await {
            self.degraded("set_delete", &e);
        }

        debug!(tag, removed, "invalidated by tag");
        metrics::counter!(telemetry::INVALIDATIONS_TOTAL, "kind" => "tag").increment(removed as u64);
        removed
    }

    /// Remove everything. Returns the number of entries removed.
    pub async fn clear(&self) -> u64 {
        match self.backend.flush().await {
            Ok(removed) => removed,
            Err(e) => {
                self.degraded("flush", &e);
                0
            }
        }
    }

    /// Current statistics; `connected` is `false` when the backend is down.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            backend: self.backend.name().to_string(),
            compression_threshold_bytes: self.config.compression_threshold,
            default_ttl_secs: self.config.default_ttl.as_secs(),
            ..CacheStats::default()
        };

        if let Err(e) = self.backend.ping().await {
            self.degraded("ping", &e);
            return stats;
        }

        match self.backend.info().await {
            Ok(info) => {
                stats.connected = true;
                stats.total_keys = info.keys;
                stats.memory_used_bytes = info.memory_used_bytes;
                stats.tag_sets = info.tag_sets;
                stats.rate_windows = info.rate_windows;
            }
            Err(e) => self.degraded("info", &e),
        }
        stats
    }

    /// Tags of the entry currently stored under `key`; empty when the key is
    /// absent or undecodable.
    async fn stored_tags(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .backend
            .get(key)
            .await?
            .and_then(|bytes| CacheEntry::decode(&bytes).ok())
            .map(|entry| entry.tags)
            .unwrap_or_default())
    }

    fn degraded(&self, operation: &'static str, err: &MuninnError) {
        warn!(
            backend = self.backend.name(),
            operation,
            error = %err,
            "cache backend error, continuing without cache"
        );
        metrics::counter!(telemetry::BACKEND_ERRORS_TOTAL, "operation" => operation).increment(1);
    }
}

fn tag_set(tag: &str) -> String {
    format!("{TAG_SET_PREFIX}{tag}")
}
