//! Live data fetchers used by the warming service.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::types::{Params, ServiceType};

/// Fetches live data for one `(provider, service_type)`.
///
/// Fetchers never read or write the cache; the warming service and
/// request-path callers handle that. Errors are reported to the caller.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, region: &str, params: Option<&Params>) -> Result<Value>;
}

/// Registry key of a fetcher: `<provider>_<service_type>`.
pub fn fetcher_key(provider: &str, service_type: ServiceType) -> String {
    format!("{provider}_{service_type}")
}

struct FnFetcher<F>(F);

#[async_trait]
impl<F, Fut> DataFetcher for FnFetcher<F>
where
    F: Fn(String, Option<Params>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn fetch(&self, region: &str, params: Option<&Params>) -> Result<Value> {
        (self.0)(region.to_string(), params.cloned()).await
    }
}

/// Adapt an async closure into a [`DataFetcher`].
///
/// ```rust
/// # use muninn::warming::fetcher_fn;
/// # use serde_json::json;
/// let fetcher = fetcher_fn(|region, _params| async move {
///     Ok(json!({ "region": region }))
/// });
/// ```
pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn DataFetcher>
where
    F: Fn(String, Option<Params>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnFetcher(f))
}
