use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::services::{
    AssociatedPartitionPolicy, GroupCacheSettings, MembershipSettings, PartitionAssociationPolicy,
    SamePartitionPolicy, StaticFeatureFlagProvider,
};

#[derive(Debug, Clone, Deserialize)]
pub struct EntitlementsConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub redis: RedisConfig,
    pub partition: PartitionConfig,
    pub cache: CacheConfig,
    pub operations: OperationsConfig,
    pub feature_flags: FeatureFlagConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    /// Group emails are `<name>@<partition>.<domain>`.
    pub domain: String,
    pub data_root_group_name: String,
    /// Partition to the partitions whose users may join its DATA groups.
    pub cross_partition_associations: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    pub partition_ttl_overrides: HashMap<String, u64>,
    pub lock_acquisition_timeout_ms: u64,
    pub lock_expiration_ms: u64,
    pub poll_max_retries: u32,
    pub poll_initial_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationsConfig {
    pub revert_max_attempts: u32,
    pub revert_initial_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureFlagConfig {
    pub defaults: HashMap<String, bool>,
    /// `(flag, partition)` to the partition's value.
    pub partition_values: HashMap<(String, String), bool>,
}

/// Partitions the standalone binary provisions at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    pub partitions: Vec<String>,
    pub requester_id: String,
}

impl EntitlementsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = EntitlementsConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("entitlements-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            partition: PartitionConfig {
                domain: get_env("PARTITION_DOMAIN", Some("example.com"), is_prod)?,
                data_root_group_name: get_env(
                    "DATA_ROOT_GROUP_NAME",
                    Some("users.data.root"),
                    is_prod,
                )?,
                cross_partition_associations: parse_associations(&get_env(
                    "CROSS_PARTITION_ASSOCIATIONS",
                    Some(""),
                    false,
                )?)?,
            },
            cache: CacheConfig {
                default_ttl_seconds: parse_number(
                    "CACHE_DEFAULT_TTL_SECONDS",
                    &get_env("CACHE_DEFAULT_TTL_SECONDS", Some("300"), is_prod)?,
                )?,
                partition_ttl_overrides: parse_ttl_overrides(&get_env(
                    "CACHE_PARTITION_TTL_OVERRIDES",
                    Some(""),
                    false,
                )?)?,
                lock_acquisition_timeout_ms: parse_number(
                    "CACHE_LOCK_ACQUISITION_TIMEOUT_MS",
                    &get_env("CACHE_LOCK_ACQUISITION_TIMEOUT_MS", Some("500"), is_prod)?,
                )?,
                lock_expiration_ms: parse_number(
                    "CACHE_LOCK_EXPIRATION_MS",
                    &get_env("CACHE_LOCK_EXPIRATION_MS", Some("5000"), is_prod)?,
                )?,
                poll_max_retries: parse_number(
                    "CACHE_POLL_MAX_RETRIES",
                    &get_env("CACHE_POLL_MAX_RETRIES", Some("3"), is_prod)?,
                )?,
                poll_initial_backoff_ms: parse_number(
                    "CACHE_POLL_INITIAL_BACKOFF_MS",
                    &get_env("CACHE_POLL_INITIAL_BACKOFF_MS", Some("50"), is_prod)?,
                )?,
            },
            operations: OperationsConfig {
                revert_max_attempts: parse_number(
                    "OPERATIONS_REVERT_MAX_ATTEMPTS",
                    &get_env("OPERATIONS_REVERT_MAX_ATTEMPTS", Some("3"), is_prod)?,
                )?,
                revert_initial_backoff_ms: parse_number(
                    "OPERATIONS_REVERT_INITIAL_BACKOFF_MS",
                    &get_env("OPERATIONS_REVERT_INITIAL_BACKOFF_MS", Some("100"), is_prod)?,
                )?,
            },
            feature_flags: FeatureFlagConfig {
                defaults: parse_flag_defaults(&get_env(
                    "FEATURE_FLAG_DEFAULTS",
                    Some("data-root-group-hierarchy=false"),
                    false,
                )?)?,
                partition_values: parse_partition_flags(&get_env(
                    "FEATURE_FLAG_PARTITION_VALUES",
                    Some(""),
                    false,
                )?)?,
            },
            bootstrap: BootstrapConfig {
                partitions: split_list(&get_env("BOOTSTRAP_PARTITIONS", Some(""), false)?, ','),
                requester_id: get_env(
                    "BOOTSTRAP_REQUESTER_ID",
                    Some("entitlements-bootstrap@example.com"),
                    false,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.partition.domain.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PARTITION_DOMAIN must not be empty"
            )));
        }

        if self.cache.default_ttl_seconds == 0
            || self.cache.partition_ttl_overrides.values().any(|ttl| *ttl == 0)
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Cache TTLs must be positive"
            )));
        }

        if self.cache.lock_expiration_ms < self.cache.lock_acquisition_timeout_ms {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CACHE_LOCK_EXPIRATION_MS must not be shorter than CACHE_LOCK_ACQUISITION_TIMEOUT_MS"
            )));
        }

        if self.operations.revert_max_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OPERATIONS_REVERT_MAX_ATTEMPTS must be positive"
            )));
        }

        Ok(())
    }

    pub fn cache_settings(&self) -> GroupCacheSettings {
        GroupCacheSettings {
            default_ttl: Duration::from_secs(self.cache.default_ttl_seconds),
            partition_ttls: self
                .cache
                .partition_ttl_overrides
                .iter()
                .map(|(partition, ttl)| (partition.clone(), Duration::from_secs(*ttl)))
                .collect(),
            lock_wait: Duration::from_millis(self.cache.lock_acquisition_timeout_ms),
            lock_lease: Duration::from_millis(self.cache.lock_expiration_ms),
            poll: RetryConfig {
                max_retries: self.cache.poll_max_retries,
                initial_backoff: Duration::from_millis(self.cache.poll_initial_backoff_ms),
                ..RetryConfig::quick()
            },
        }
    }

    pub fn membership_settings(&self) -> MembershipSettings {
        MembershipSettings {
            domain: self.partition.domain.clone(),
            data_root_group_name: self.partition.data_root_group_name.clone(),
            revert_retry: RetryConfig {
                max_retries: self.operations.revert_max_attempts.saturating_sub(1),
                initial_backoff: Duration::from_millis(self.operations.revert_initial_backoff_ms),
                ..RetryConfig::default()
            },
        }
    }

    pub fn association_policy(&self) -> Arc<dyn PartitionAssociationPolicy> {
        if self.partition.cross_partition_associations.is_empty() {
            Arc::new(SamePartitionPolicy)
        } else {
            Arc::new(AssociatedPartitionPolicy::new(
                self.partition.cross_partition_associations.clone(),
            ))
        }
    }

    pub fn feature_flag_provider(&self) -> StaticFeatureFlagProvider {
        StaticFeatureFlagProvider::new(self.feature_flags.partition_values.clone())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("{} is not a valid number: {}", key, e))
    })
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `key=value` pairs separated by commas.
fn parse_pairs(raw: &str) -> Result<Vec<(String, String)>, AppError> {
    split_list(raw, ',')
        .into_iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!("Expected key=value, got '{}'", pair))
                })
        })
        .collect()
}

/// `"p1:p2|p3;p4:p1"`
fn parse_associations(raw: &str) -> Result<HashMap<String, BTreeSet<String>>, AppError> {
    let mut associations = HashMap::new();
    for entry in split_list(raw, ';') {
        let (partition, allowed) = entry.split_once(':').ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "Expected partition:allowed|allowed, got '{}'",
                entry
            ))
        })?;
        associations
            .entry(partition.trim().to_string())
            .or_insert_with(BTreeSet::new)
            .extend(split_list(allowed, '|'));
    }
    Ok(associations)
}

/// `"p1=60,p2=120"`
fn parse_ttl_overrides(raw: &str) -> Result<HashMap<String, u64>, AppError> {
    parse_pairs(raw)?
        .into_iter()
        .map(|(partition, ttl)| Ok((partition.clone(), parse_number(&partition, &ttl)?)))
        .collect()
}

/// `"flag=true,other=false"`
fn parse_flag_defaults(raw: &str) -> Result<HashMap<String, bool>, AppError> {
    parse_pairs(raw)?
        .into_iter()
        .map(|(flag, value)| {
            let enabled = value.parse().map_err(|_| {
                AppError::ConfigError(anyhow::anyhow!("Flag {} is not a boolean: {}", flag, value))
            })?;
            Ok((flag, enabled))
        })
        .collect()
}

/// `"p1:flag=true,other=false;p2:flag=false"`
fn parse_partition_flags(raw: &str) -> Result<HashMap<(String, String), bool>, AppError> {
    let mut values = HashMap::new();
    for entry in split_list(raw, ';') {
        let (partition, flags) = entry.split_once(':').ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("Expected partition:flags, got '{}'", entry))
        })?;
        for (flag, enabled) in parse_flag_defaults(flags)? {
            values.insert((flag, partition.trim().to_string()), enabled);
        }
    }
    Ok(values)
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
