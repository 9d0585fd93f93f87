//! Public types shared across the cache, manager and warming layers.

mod key;
mod service;

pub use key::{CacheKey, KEY_PREFIX, Params, params, params_hash, provider_pattern, service_pattern};
pub use service::{CachePolicy, CacheStrategy, ServiceType};
