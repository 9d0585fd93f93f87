//! Storage backends for the cache store and rate limiter.
//!
//! [`CacheBackend`] is deliberately Redis-shaped: plain keys with per-key
//! expiry, string sets for the tag index, and an atomic sliding-window
//! primitive for rate limiting. [`MemoryBackend`] is the in-process
//! implementation, built on moka's future cache with per-entry expiry and a
//! byte weigher.
//!
//! Every method returns [`MuninnError::ConnectionUnavailable`] when the
//! store cannot be reached; callers above the store decide how to degrade.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;

use super::pattern::KeyPattern;
use crate::{MuninnError, Result};

/// Default byte budget for [`MemoryBackend`]: 256 MiB.
pub const DEFAULT_MAX_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;

/// Outcome of a sliding-window update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Whether the request was admitted (always `false` for read-only peeks
    /// at a full window, `true` otherwise).
    pub allowed: bool,
    /// Requests currently inside the window, including an admitted one.
    pub count: u32,
    /// Time until the oldest request leaves the window, if any are present.
    pub oldest_expires_in: Option<Duration>,
}

/// Backend size and health figures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendInfo {
    pub keys: u64,
    pub memory_used_bytes: u64,
    pub tag_sets: u64,
    pub rate_windows: u64,
}

/// Async key/value store used by [`CacheStore`](super::CacheStore) and
/// [`RateLimiter`](crate::RateLimiter).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logging and stats.
    fn name(&self) -> &str;

    /// Health check.
    async fn ping(&self) -> Result<()>;

    /// Fetch a blob. Expired keys are absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob that expires after `expire_in`.
    async fn set(&self, key: &str, value: Vec<u8>, expire_in: Duration) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live keys matching an invalidation pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add `member` to the set named `set`.
    async fn set_add(&self, set: &str, member: &str) -> Result<()>;

    /// Members of a set (empty if the set does not exist).
    async fn set_members(&self, set: &str) -> Result<Vec<String>>;

    /// Remove one member from a set.
    async fn set_remove(&self, set: &str, member: &str) -> Result<()>;

    /// Drop a whole set.
    async fn set_delete(&self, set: &str) -> Result<()>;

    /// Prune timestamps older than `window` from the window at `key`, then,
    /// if `record` is set and fewer than `limit` remain, append `now`.
    ///
    /// Prune, count and append happen as one atomic unit per key, so two
    /// concurrent callers cannot both be admitted past the limit.
    async fn window_hit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        record: bool,
    ) -> Result<WindowState>;

    /// Size figures.
    async fn info(&self) -> Result<BackendInfo>;

    /// Remove every key, set and window. Returns the number of keys removed.
    async fn flush(&self) -> Result<u64>;
}

/// Stored value plus its requested lifetime (read by [`BlobExpiry`]).
#[derive(Clone)]
struct Blob {
    bytes: Arc<Vec<u8>>,
    expire_in: Duration,
}

/// Per-entry expiry: each blob lives for its own `expire_in`, and an
/// overwrite restarts the clock with the new value's lifetime.
struct BlobExpiry;

impl Expiry<String, Blob> for BlobExpiry {
    fn expire_after_create(&self, _key: &String, value: &Blob, _created_at: Instant) -> Option<Duration> {
        Some(value.expire_in)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Blob,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expire_in)
    }
}

type SetMap = HashMap<String, HashSet<String>>;

/// In-process backend.
///
/// Blobs live in a bounded moka cache weighted by byte size. Tag sets and
/// rate-limit windows are small and kept in plain mutex-guarded maps; no
/// lock is held across an `.await`.
///
/// Set members are blob keys: when moka expires or evicts a blob, the key is
/// dropped from every set and sets left empty are removed.
pub struct MemoryBackend {
    entries: Cache<String, Blob>,
    sets: Arc<Mutex<SetMap>>,
    windows: Mutex<HashMap<String, VecDeque<tokio::time::Instant>>>,
}

impl MemoryBackend {
    /// Create a backend with the default byte budget.
    pub fn new() -> Self {
        Self::with_max_capacity(DEFAULT_MAX_CAPACITY_BYTES)
    }

    /// Create a backend holding at most `max_bytes` of keys and blobs.
    pub fn with_max_capacity(max_bytes: u64) -> Self {
        let sets: Arc<Mutex<SetMap>> = Arc::default();
        let index = Arc::clone(&sets);

        let entries = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, blob: &Blob| -> u32 {
                (key.len() + blob.bytes.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(BlobExpiry)
            .eviction_listener(move |key: Arc<String>, _blob: Blob, cause: RemovalCause| {
                if cause.was_evicted() {
                    let mut sets = index.lock().unwrap_or_else(PoisonError::into_inner);
                    remove_member_everywhere(&mut sets, &key);
                }
            })
            .build();
        Self {
            entries,
            sets,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock_sets(&self) -> Result<std::sync::MutexGuard<'_, SetMap>> {
        self.sets
            .lock()
            .map_err(|_| MuninnError::ConnectionUnavailable("tag index lock poisoned".into()))
    }

    fn lock_windows(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<tokio::time::Instant>>>> {
        self.windows
            .lock()
            .map_err(|_| MuninnError::ConnectionUnavailable("rate window lock poisoned".into()))
    }
}

fn remove_member_everywhere(sets: &mut SetMap, member: &str) {
    sets.retain(|_, members| {
        members.remove(member);
        !members.is_empty()
    });
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).await.map(|b| b.bytes.as_ref().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expire_in: Duration) -> Result<()> {
        let blob = Blob {
            bytes: Arc::new(value),
            expire_in,
        };
        self.entries.insert(key.to_string(), blob).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = KeyPattern::new(pattern)?;
        Ok(self
            .entries
            .iter()
            .filter(|(k, _)| pattern.is_match(k))
            .map(|(k, _)| String::clone(&k))
            .collect())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<()> {
        self.lock_sets()?
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .lock_sets()?
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        let mut sets = self.lock_sets()?;
        if let Some(members) = sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                sets.remove(set);
            }
        }
        Ok(())
    }

    async fn set_delete(&self, set: &str) -> Result<()> {
        self.lock_sets()?.remove(set);
        Ok(())
    }

    async fn window_hit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        record: bool,
    ) -> Result<WindowState> {
        let now = tokio::time::Instant::now();
        let mut windows = self.lock_windows()?;
        let stamps = windows.entry(key.to_string()).or_default();

        while stamps
            .front()
            .is_some_and(|&t| now.duration_since(t) >= window)
        {
            stamps.pop_front();
        }

        let under_limit = (stamps.len() as u64) < u64::from(limit);
        if record && under_limit {
            stamps.push_back(now);
        }

        let state = WindowState {
            allowed: under_limit,
            count: stamps.len().try_into().unwrap_or(u32::MAX),
            oldest_expires_in: stamps
                .front()
                .map(|&t| window.saturating_sub(now.duration_since(t))),
        };

        if stamps.is_empty() {
            windows.remove(key);
        }
        Ok(state)
    }

    async fn info(&self) -> Result<BackendInfo> {
        self.entries.run_pending_tasks().await;
        let tag_sets = self.lock_sets()?.len() as u64;
        let rate_windows = self.lock_windows()?.len() as u64;
        Ok(BackendInfo {
            keys: self.entries.entry_count(),
            memory_used_bytes: self.entries.weighted_size(),
            tag_sets,
            rate_windows,
        })
    }

    async fn flush(&self) -> Result<u64> {
        self.entries.run_pending_tasks().await;
        let removed = self.entries.entry_count();
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        self.lock_sets()?.clear();
        self.lock_windows()?.clear();
        Ok(removed)
    }
}
