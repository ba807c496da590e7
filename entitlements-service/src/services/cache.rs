//! Parent-reference cache with single-flight rebuild.
//!
//! A miss takes a per-key distributed lock before recomputing, so concurrent
//! misses across the fleet trigger one closure computation per key. Writes are
//! fenced by a per-member eviction generation: a closure resolved before an
//! eviction is never stored after it.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use service_core::retry::RetryConfig;

use super::error::EntitlementsError;
use super::hierarchy::HierarchyResolver;
use crate::models::ParentTree;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Storage for cached parent closures.
#[async_trait]
pub trait GroupCacheStore: Send + Sync {
    async fn get(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<Option<ParentTree>, anyhow::Error>;

    /// Current eviction generation of `member_id`, zero before any eviction.
    async fn generation(&self, member_id: &str) -> Result<u64, anyhow::Error>;

    /// Store `tree` unless `member_id` was evicted after `generation` was read.
    /// Returns whether the entry was written.
    async fn put(
        &self,
        member_id: &str,
        partition_id: &str,
        tree: &ParentTree,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, anyhow::Error>;

    /// Drop the entries of `member_id` in every partition and bump its generation.
    async fn evict_all(&self, member_id: &str) -> Result<(), anyhow::Error>;
}

/// A held lease on a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

#[derive(Error, Debug)]
pub enum LockError {
    /// The lease ran out while held and the key is free or owned by someone else.
    #[error("Lock lease expired: {0}")]
    LeaseExpired(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Cross-process mutual exclusion with lease expiry.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Single attempt to take `key` for `lease`.
    async fn try_lock(&self, key: &str, lease: Duration)
        -> Result<Option<LockHandle>, anyhow::Error>;

    async fn release(&self, handle: LockHandle) -> Result<(), LockError>;

    /// Keep trying to take `key` until `wait` elapses.
    async fn try_acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, anyhow::Error> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(handle) = self.try_lock(key, lease).await? {
                return Ok(Some(handle));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupCacheSettings {
    pub default_ttl: Duration,
    pub partition_ttls: HashMap<String, Duration>,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    /// Cache polling after the lock could not be taken.
    pub poll: RetryConfig,
}

impl GroupCacheSettings {
    pub fn ttl_for(&self, partition_id: &str) -> Duration {
        self.partition_ttls
            .get(partition_id)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

impl Default for GroupCacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            partition_ttls: HashMap::new(),
            lock_wait: Duration::from_millis(500),
            lock_lease: Duration::from_secs(5),
            poll: RetryConfig::quick(),
        }
    }
}

pub struct GroupCacheService {
    store: Arc<dyn GroupCacheStore>,
    lock: Arc<dyn DistributedLock>,
    resolver: Arc<HierarchyResolver>,
    settings: GroupCacheSettings,
}

impl GroupCacheService {
    pub fn new(
        store: Arc<dyn GroupCacheStore>,
        lock: Arc<dyn DistributedLock>,
        resolver: Arc<HierarchyResolver>,
        settings: GroupCacheSettings,
    ) -> Self {
        Self {
            store,
            lock,
            resolver,
            settings,
        }
    }

    /// Parent closure of a member in one partition, rebuilt on miss.
    pub async fn get_from_partition_cache(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<ParentTree, EntitlementsError> {
        if let Some(tree) = self.read(member_id, partition_id).await {
            metrics::counter!("group_cache_hits_total").increment(1);
            return Ok(tree);
        }
        metrics::counter!("group_cache_misses_total").increment(1);

        let lock_key = lock_key(member_id, partition_id);
        let acquired = self
            .lock
            .try_acquire(&lock_key, self.settings.lock_wait, self.settings.lock_lease)
            .await
            .map_err(|e| {
                tracing::error!(key = %lock_key, error = %e, "Failed to acquire cache lock");
                EntitlementsError::ServiceUnavailable(format!(
                    "Cache lock unavailable for {}",
                    member_id
                ))
            })?;

        match acquired {
            Some(handle) => {
                let result = self.rebuild(member_id, partition_id).await;
                self.release(handle).await;
                result
            }
            None => self.poll(member_id, partition_id).await,
        }
    }

    /// Evict cached closures of every impacted member in every partition.
    pub async fn invalidate(&self, member_ids: &BTreeSet<String>) {
        for member_id in member_ids {
            if let Err(e) = self.store.evict_all(member_id).await {
                tracing::error!(member_id = %member_id, error = %e, "Failed to evict cached groups");
            }
        }
    }

    async fn rebuild(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<ParentTree, EntitlementsError> {
        // Another holder may have filled the entry while we waited.
        if let Some(tree) = self.read(member_id, partition_id).await {
            return Ok(tree);
        }

        // Read before resolving so an eviction racing the resolve fences the write.
        let generation = match self.store.generation(member_id).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                tracing::warn!(member_id = %member_id, error = %e, "Failed to read cache generation");
                None
            }
        };

        let tree = self
            .resolver
            .load_all_parents_of(member_id, partition_id)
            .await?;

        let Some(generation) = generation else {
            return Ok(tree);
        };
        let ttl = self.settings.ttl_for(partition_id);
        match self
            .store
            .put(member_id, partition_id, &tree, ttl, generation)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(member_id = %member_id, partition_id = %partition_id, "Groups evicted during rebuild, not cached");
            }
            Err(e) => {
                tracing::warn!(member_id = %member_id, partition_id = %partition_id, error = %e, "Failed to cache groups");
            }
        }
        Ok(tree)
    }

    async fn poll(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<ParentTree, EntitlementsError> {
        for attempt in 0..self.settings.poll.max_retries {
            sleep(self.settings.poll.backoff_duration(attempt)).await;
            if let Some(tree) = self.read(member_id, partition_id).await {
                return Ok(tree);
            }
        }

        tracing::warn!(
            member_id = %member_id,
            partition_id = %partition_id,
            "Cache lock busy and no value appeared"
        );
        Err(EntitlementsError::ServiceUnavailable(format!(
            "Group cache for {} is being rebuilt, retry later",
            member_id
        )))
    }

    async fn read(&self, member_id: &str, partition_id: &str) -> Option<ParentTree> {
        match self.store.get(member_id, partition_id).await {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(member_id = %member_id, error = %e, "Failed to read cached groups");
                None
            }
        }
    }

    async fn release(&self, handle: LockHandle) {
        let key = handle.key.clone();
        match self.lock.release(handle).await {
            Ok(()) => {}
            Err(LockError::LeaseExpired(_)) => {
                tracing::warn!(key = %key, "Cache lock lease expired before release");
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to release cache lock");
            }
        }
    }
}

pub fn cache_key(member_id: &str, partition_id: &str) -> String {
    format!("groups:{}:{}", partition_id, member_id)
}

pub fn lock_key(member_id: &str, partition_id: &str) -> String {
    format!("lock:{}", cache_key(member_id, partition_id))
}

struct CachedTree {
    tree: ParentTree,
    expires_at: Instant,
}

#[derive(Default)]
struct MockCacheState {
    entries: HashMap<(String, String), CachedTree>,
    generations: HashMap<String, u64>,
}

/// In-memory cache store for tests and standalone runs.
#[derive(Default)]
pub struct MockGroupCache {
    state: Mutex<MockCacheState>,
}

impl MockGroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or_default()
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, MockCacheState>, anyhow::Error> {
        self.state
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock cache mutex poisoned: {}", e))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GroupCacheStore for MockGroupCache {
    async fn get(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<Option<ParentTree>, anyhow::Error> {
        let state = self.lock_state()?;
        Ok(state
            .entries
            .get(&(member_id.to_string(), partition_id.to_string()))
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.tree.clone()))
    }

    async fn generation(&self, member_id: &str) -> Result<u64, anyhow::Error> {
        Ok(self
            .lock_state()?
            .generations
            .get(member_id)
            .copied()
            .unwrap_or_default())
    }

    async fn put(
        &self,
        member_id: &str,
        partition_id: &str,
        tree: &ParentTree,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, anyhow::Error> {
        let mut state = self.lock_state()?;
        let current = state.generations.get(member_id).copied().unwrap_or_default();
        if current != generation {
            return Ok(false);
        }
        state.entries.insert(
            (member_id.to_string(), partition_id.to_string()),
            CachedTree {
                tree: tree.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn evict_all(&self, member_id: &str) -> Result<(), anyhow::Error> {
        let mut state = self.lock_state()?;
        *state.generations.entry(member_id.to_string()).or_default() += 1;
        state.entries.retain(|(member, _), _| member != member_id);
        Ok(())
    }
}

/// Process-local lock with lease expiry.
#[derive(Default)]
pub struct InMemoryLockService {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLockService {
    async fn try_lock(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>, anyhow::Error> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock table mutex poisoned: {}", e))?;
        let now = Instant::now();
        if leases.get(key).is_some_and(|(_, expires_at)| *expires_at > now) {
            return Ok(None);
        }
        let token = uuid::Uuid::new_v4().to_string();
        leases.insert(key.to_string(), (token.clone(), now + lease));
        Ok(Some(LockHandle {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock table mutex poisoned: {}", e))?;
        let held = leases.get(&handle.key).is_some_and(|(token, expires_at)| {
            *token == handle.token && *expires_at > Instant::now()
        });
        if !held {
            return Err(LockError::LeaseExpired(handle.key));
        }
        leases.remove(&handle.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let lock = InMemoryLockService::new();
        let lease = Duration::from_secs(5);

        let handle = lock.try_lock("k", lease).await.unwrap().unwrap();
        assert!(lock.try_lock("k", lease).await.unwrap().is_none());

        lock.release(handle).await.unwrap();
        assert!(lock.try_lock("k", lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_release_is_reported() {
        let lock = InMemoryLockService::new();
        let handle = lock
            .try_lock("k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            lock.release(handle).await,
            Err(LockError::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_try_acquire_gives_up_after_wait() {
        let lock = InMemoryLockService::new();
        let _held = lock.try_lock("k", Duration::from_secs(5)).await.unwrap();

        let started = Instant::now();
        let acquired = lock
            .try_acquire("k", Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(acquired.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_evict_all_drops_every_partition() {
        let cache = MockGroupCache::new();
        let ttl = Duration::from_secs(60);
        let tree = ParentTree::default();
        cache.put("u", "dp1", &tree, ttl, 0).await.unwrap();
        cache.put("u", "dp2", &tree, ttl, 0).await.unwrap();
        cache.put("v", "dp1", &tree, ttl, 0).await.unwrap();

        cache.evict_all("u").await.unwrap();

        assert!(cache.get("u", "dp1").await.unwrap().is_none());
        assert!(cache.get("u", "dp2").await.unwrap().is_none());
        assert!(cache.get("v", "dp1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_after_eviction_is_skipped() {
        let cache = MockGroupCache::new();
        let ttl = Duration::from_secs(60);
        let generation = cache.generation("u").await.unwrap();

        cache.evict_all("u").await.unwrap();

        assert!(!cache
            .put("u", "dp1", &ParentTree::default(), ttl, generation)
            .await
            .unwrap());
        assert!(cache.is_empty());

        let fresh = cache.generation("u").await.unwrap();
        assert_eq!(fresh, generation + 1);
        assert!(cache
            .put("u", "dp1", &ParentTree::default(), ttl, fresh)
            .await
            .unwrap());
    }

    #[test]
    fn test_partition_ttl_override() {
        let settings = GroupCacheSettings {
            partition_ttls: HashMap::from([("dp1".to_string(), Duration::from_secs(60))]),
            ..Default::default()
        };
        assert_eq!(settings.ttl_for("dp1"), Duration::from_secs(60));
        assert_eq!(settings.ttl_for("dp2"), Duration::from_secs(300));
    }
}
