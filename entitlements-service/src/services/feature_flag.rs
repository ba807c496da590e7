//! Partition-scoped feature flags.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Attach new DATA groups to the partition's data-root group.
pub const DATA_ROOT_GROUP_HIERARCHY: &str = "data-root-group-hierarchy";

/// Source of per-partition flag values.
#[async_trait]
pub trait FeatureFlagProvider: Send + Sync {
    /// `None` when the partition does not set the flag.
    async fn get_flag(&self, flag: &str, partition_id: &str)
        -> Result<Option<bool>, anyhow::Error>;
}

/// Flag values fixed at startup from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticFeatureFlagProvider {
    values: HashMap<(String, String), bool>,
}

impl StaticFeatureFlagProvider {
    /// `values` maps `(flag, partition)` to the partition's setting.
    pub fn new(values: HashMap<(String, String), bool>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl FeatureFlagProvider for StaticFeatureFlagProvider {
    async fn get_flag(
        &self,
        flag: &str,
        partition_id: &str,
    ) -> Result<Option<bool>, anyhow::Error> {
        Ok(self
            .values
            .get(&(flag.to_string(), partition_id.to_string()))
            .copied())
    }
}

/// Resolves flags through the provider, falling back to static defaults.
pub struct FeatureFlagService {
    provider: Arc<dyn FeatureFlagProvider>,
    defaults: HashMap<String, bool>,
    cache: DashMap<(String, String), bool>,
}

impl FeatureFlagService {
    pub fn new(provider: Arc<dyn FeatureFlagProvider>, defaults: HashMap<String, bool>) -> Self {
        Self {
            provider,
            defaults,
            cache: DashMap::new(),
        }
    }

    /// Never fails: provider errors resolve to the default.
    pub async fn is_enabled(&self, flag: &str, partition_id: &str) -> bool {
        let key = (flag.to_string(), partition_id.to_string());
        if let Some(value) = self.cache.get(&key) {
            return *value;
        }

        let default = self.defaults.get(flag).copied().unwrap_or(false);
        let value = match self.provider.get_flag(flag, partition_id).await {
            Ok(value) => value.unwrap_or(default),
            Err(e) => {
                tracing::warn!(
                    flag = %flag,
                    partition_id = %partition_id,
                    error = %e,
                    "Failed to read feature flag, using default"
                );
                default
            }
        };

        self.cache.insert(key, value);
        value
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
