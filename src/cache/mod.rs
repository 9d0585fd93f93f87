//! Caching subsystem.
//!
//! Layered bottom-up:
//!
//! - [`CacheBackend`] — Redis-shaped async storage trait (keys with expiry,
//!   tag sets, atomic sliding windows). [`MemoryBackend`] is the built-in
//!   implementation on top of moka.
//!
//! - [`CacheEntry`] — a JSON value with its storage time, TTL and tags,
//!   encoded compactly and compressed above a size threshold.
//!
//! - [`CacheStore`] — TTL store with a tag index and pattern invalidation.
//!   Backend outages degrade it to a no-op rather than an error.
//!
//! Policy (which TTL applies to which service) lives one level up in
//! [`UnifiedCacheManager`](crate::UnifiedCacheManager).

pub mod backend;
pub mod entry;
pub mod pattern;
pub mod store;

pub use backend::{BackendInfo, CacheBackend, MemoryBackend, WindowState};
pub use entry::CacheEntry;
pub use store::{CacheStats, CacheStore, StoreConfig};
