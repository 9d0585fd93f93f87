//! Service-type → cache policy mapping.

use std::collections::HashMap;
use std::time::Duration;

use crate::types::{CachePolicy, CacheStrategy, ServiceType};

/// Policy table: built-in defaults from [`ServiceType::default_policy`]
/// plus per-type overrides.
///
/// ```rust
/// # use muninn::{PolicyTable, ServiceType, CacheStrategy};
/// # use std::time::Duration;
/// let table = PolicyTable::new().ttl(ServiceType::Pricing, Duration::from_secs(600));
/// assert_eq!(table.get(ServiceType::Pricing).ttl, Duration::from_secs(600));
/// assert_eq!(table.get(ServiceType::Pricing).strategy, CacheStrategy::RefreshAhead);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    overrides: HashMap<ServiceType, CachePolicy>,
}

impl PolicyTable {
    /// A table with only the built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole policy for a service type.
    pub fn policy(mut self, service_type: ServiceType, policy: CachePolicy) -> Self {
        self.overrides.insert(service_type, policy);
        self
    }

    /// Override only the TTL, keeping the current strategy.
    pub fn ttl(mut self, service_type: ServiceType, ttl: Duration) -> Self {
        let strategy = self.get(service_type).strategy;
        self.overrides
            .insert(service_type, CachePolicy::new(ttl, strategy));
        self
    }

    /// Override only the strategy, keeping the current TTL.
    pub fn strategy(mut self, service_type: ServiceType, strategy: CacheStrategy) -> Self {
        let ttl = self.get(service_type).ttl;
        self.overrides
            .insert(service_type, CachePolicy::new(ttl, strategy));
        self
    }

    /// Effective policy for a service type.
    pub fn get(&self, service_type: ServiceType) -> CachePolicy {
        self.overrides
            .get(&service_type)
            .copied()
            .unwrap_or_else(|| service_type.default_policy())
    }

    /// Every service type with its effective policy.
    pub fn entries(&self) -> Vec<(ServiceType, CachePolicy)> {
        ServiceType::ALL
            .into_iter()
            .map(|t| (t, self.get(t)))
            .collect()
    }
}
