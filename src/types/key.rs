//! Cache key generation.
//!
//! Keys keep the textual layout existing deployments rely on:
//! `cloud_api:<provider>:<service_type>:<region>[:<param_hash>]`. The
//! parameter hash is a SHA-256 prefix over the parameters in key order, so
//! it is stable across processes (unlike `DefaultHasher`).

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use super::ServiceType;

/// Request parameters. A `BTreeMap` keeps them sorted by key, which is the
/// canonical order used for hashing.
pub type Params = BTreeMap<String, String>;

/// Namespace prefix of every cache key.
pub const KEY_PREFIX: &str = "cloud_api";

/// Length of the hex parameter hash appended to keys.
const PARAM_HASH_LEN: usize = 16;

/// Fully-qualified cache key for one logical cloud API request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for `(provider, service_type, region, params)`.
    ///
    /// An empty parameter map is treated the same as no parameters.
    pub fn new(
        provider: &str,
        service_type: ServiceType,
        region: &str,
        params: Option<&Params>,
    ) -> Self {
        let mut key = format!("{KEY_PREFIX}:{provider}:{}:{region}", service_type.as_str());
        if let Some(params) = params.filter(|p| !p.is_empty()) {
            key.push(':');
            key.push_str(&params_hash(params));
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hash a parameter set into a short hex digest.
///
/// Each key and value is length-prefixed so that `{"a": "b=c"}` and
/// `{"a=b": "c"}` hash differently.
pub fn params_hash(params: &Params) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in params {
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k.as_bytes());
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v.as_bytes());
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(PARAM_HASH_LEN);
    hex
}

/// Invalidation pattern for one service, optionally narrowed to a region.
pub fn service_pattern(provider: &str, service_type: ServiceType, region: Option<&str>) -> String {
    format!(
        "{KEY_PREFIX}:{provider}:{}:{}:*",
        service_type.as_str(),
        region.unwrap_or("*")
    )
}

/// Invalidation pattern covering every key of a provider.
pub fn provider_pattern(provider: &str) -> String {
    format!("{KEY_PREFIX}:{provider}:*")
}

/// Build a [`Params`] map from borrowed pairs.
pub fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
