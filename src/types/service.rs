//! Service categories and their cache policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::MuninnError;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Category of cloud API data being cached.
///
/// Closed set: every variant has a default [`CachePolicy`] via an exhaustive
/// match, so adding a variant without a policy is a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Pricing,
    Compute,
    Storage,
    Database,
    AiMl,
    TerraformModules,
    TerraformProviders,
    CostEstimation,
    Compliance,
    Regions,
}

impl ServiceType {
    /// Every service type, in declaration order.
    pub const ALL: [ServiceType; 10] = [
        ServiceType::Pricing,
        ServiceType::Compute,
        ServiceType::Storage,
        ServiceType::Database,
        ServiceType::AiMl,
        ServiceType::TerraformModules,
        ServiceType::TerraformProviders,
        ServiceType::CostEstimation,
        ServiceType::Compliance,
        ServiceType::Regions,
    ];

    /// Textual form used in cache keys, tags and fetcher keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Pricing => "pricing",
            ServiceType::Compute => "compute",
            ServiceType::Storage => "storage",
            ServiceType::Database => "database",
            ServiceType::AiMl => "ai_ml",
            ServiceType::TerraformModules => "terraform_modules",
            ServiceType::TerraformProviders => "terraform_providers",
            ServiceType::CostEstimation => "cost_estimation",
            ServiceType::Compliance => "compliance",
            ServiceType::Regions => "regions",
        }
    }

    /// Built-in freshness policy for this category.
    pub fn default_policy(&self) -> CachePolicy {
        use CacheStrategy::{RefreshAhead, TtlOnly};
        match self {
            ServiceType::Pricing => CachePolicy::new(Duration::from_secs(HOUR), RefreshAhead),
            ServiceType::Compute => CachePolicy::new(Duration::from_secs(30 * MINUTE), RefreshAhead),
            ServiceType::Storage => CachePolicy::new(Duration::from_secs(HOUR), TtlOnly),
            ServiceType::Database => CachePolicy::new(Duration::from_secs(HOUR), TtlOnly),
            ServiceType::AiMl => CachePolicy::new(Duration::from_secs(4 * HOUR), TtlOnly),
            ServiceType::TerraformModules | ServiceType::TerraformProviders => {
                CachePolicy::new(Duration::from_secs(DAY), TtlOnly)
            }
            ServiceType::CostEstimation => {
                CachePolicy::new(Duration::from_secs(15 * MINUTE), RefreshAhead)
            }
            ServiceType::Compliance => CachePolicy::new(Duration::from_secs(DAY), TtlOnly),
            ServiceType::Regions => CachePolicy::new(Duration::from_secs(7 * DAY), TtlOnly),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = MuninnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| MuninnError::InvalidServiceType(s.to_string()))
    }
}

/// How an entry behaves as it approaches and passes its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Stale entries are simply expired.
    TtlOnly,
    /// Entries nearing their TTL are served immediately but flagged for a
    /// background refresh.
    RefreshAhead,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::TtlOnly => "ttl_only",
            CacheStrategy::RefreshAhead => "refresh_ahead",
        }
    }
}

/// TTL and strategy applied to one service category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachePolicy {
    #[serde(rename = "ttl_secs", serialize_with = "serialize_secs")]
    pub ttl: Duration,
    pub strategy: CacheStrategy,
}

impl CachePolicy {
    pub fn new(ttl: Duration, strategy: CacheStrategy) -> Self {
        Self { ttl, strategy }
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}
