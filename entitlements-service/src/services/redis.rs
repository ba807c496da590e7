use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;

use super::cache::{cache_key, DistributedLock, GroupCacheStore, LockError, LockHandle};
use crate::models::ParentTree;

/// Deletes the lock only while it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Writes a closure only while the member's generation is unchanged.
/// KEYS: generation, entry, partition index. ARGV: generation, value, ttl, partition.
const FENCED_PUT_SCRIPT: &str = r#"
local current = tonumber(redis.call("GET", KEYS[1]) or "0")
if current ~= tonumber(ARGV[1]) then
    return 0
end
redis.call("SET", KEYS[2], ARGV[2], "EX", ARGV[3])
redis.call("SADD", KEYS[3], ARGV[4])
return 1
"#;

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// Set of partitions a member has cached closures in. Kept without expiry
/// so eviction still finds entries with the longest TTL.
fn partition_index_key(member_id: &str) -> String {
    format!("groups-index:{}", member_id)
}

/// Eviction counter of a member, kept without expiry like the index.
fn generation_key(member_id: &str) -> String {
    format!("groups-gen:{}", member_id)
}

#[async_trait]
impl GroupCacheStore for RedisService {
    async fn get(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<Option<ParentTree>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(cache_key(member_id, partition_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache: {}", e))?;

        raw.map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|e| anyhow::anyhow!("Corrupt cache entry for {}: {}", member_id, e))
    }

    async fn generation(&self, member_id: &str) -> Result<u64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let generation: Option<u64> = redis::cmd("GET")
            .arg(generation_key(member_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read cache generation: {}", e))?;
        Ok(generation.unwrap_or_default())
    }

    async fn put(
        &self,
        member_id: &str,
        partition_id: &str,
        tree: &ParentTree,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let value = serde_json::to_string(tree)?;
        let ttl_seconds = ttl.as_secs().max(1);

        let written: i64 = Script::new(FENCED_PUT_SCRIPT)
            .key(generation_key(member_id))
            .key(cache_key(member_id, partition_id))
            .key(partition_index_key(member_id))
            .arg(generation)
            .arg(value)
            .arg(ttl_seconds)
            .arg(partition_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache: {}", e))?;
        Ok(written == 1)
    }

    async fn evict_all(&self, member_id: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let index_key = partition_index_key(member_id);

        // Bump first so rebuilds already in flight cannot write back.
        let _: u64 = redis::cmd("INCR")
            .arg(generation_key(member_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bump cache generation: {}", e))?;

        let partitions: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&index_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read cache index: {}", e))?;

        let mut keys: Vec<String> = partitions
            .iter()
            .map(|partition_id| cache_key(member_id, partition_id))
            .collect();
        keys.push(index_key);

        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to evict cache: {}", e))
    }
}

#[async_trait]
impl DistributedLock for RedisService {
    async fn try_lock(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LockHandle>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let token = uuid::Uuid::new_v4().to_string();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))?;

        Ok(reply.map(|_| LockHandle {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to release lock: {}", e))?;

        if deleted == 0 {
            return Err(LockError::LeaseExpired(handle.key));
        }
        Ok(())
    }
}
