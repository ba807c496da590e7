//! Test helper module for entitlements-service integration tests.
//!
//! Wires the core against the in-memory graph, cache store and lock, with a
//! fault-injecting repository wrapper and an audit logger that records events.

#![allow(dead_code)]

use async_trait::async_trait;
use entitlements_service::{
    models::{
        AddMemberRequest, AuditEvent, ChildrenReference, ChildrenTree, CreateGroupRequest,
        EntityNode, GroupType, NodeKey, ParentReference, ParentTree, Role,
    },
    services::{
        AssociatedPartitionPolicy, AuditLogger, GraphRepository, GroupCacheSettings,
        GroupCacheStore, InMemoryGraphRepository, InMemoryLockService, MembershipSettings, MockGroupCache,
        RepositoryError, RepositoryPage, StaticFeatureFlagProvider, DATA_ROOT_GROUP_HIERARCHY,
    },
    AppComponents, AppState,
};
use service_core::retry::RetryConfig;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PARTITION: &str = "opendes";
pub const DOMAIN: &str = "example.com";
pub const REQUESTER: &str = "admin@corp.com";
pub const DATA_ROOT_NAME: &str = "users.data.root";

/// Email of a group of the test partition.
pub fn group_email(name: &str) -> String {
    format!("{}@{}.{}", name, PARTITION, DOMAIN)
}

/// Repository wrapper that can fail writes and counts closure computations.
pub struct FaultyRepository {
    inner: Arc<InMemoryGraphRepository>,
    writes: AtomicUsize,
    fail_at: AtomicUsize,
    keep_failing: AtomicBool,
    closure_computations: AtomicUsize,
    closure_delay: Mutex<Duration>,
}

impl FaultyRepository {
    pub fn new(inner: Arc<InMemoryGraphRepository>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(0),
            keep_failing: AtomicBool::new(false),
            closure_computations: AtomicUsize::new(0),
            closure_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Fail only the `n`th write from now.
    pub fn fail_nth_write(&self, n: usize) {
        self.keep_failing.store(false, Ordering::SeqCst);
        self.fail_at
            .store(self.writes.load(Ordering::SeqCst) + n, Ordering::SeqCst);
    }

    /// Fail the `n`th write from now and every write after it.
    pub fn fail_writes_from(&self, n: usize) {
        self.keep_failing.store(true, Ordering::SeqCst);
        self.fail_at
            .store(self.writes.load(Ordering::SeqCst) + n, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.fail_at.store(0, Ordering::SeqCst);
        self.keep_failing.store(false, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn closure_computations(&self) -> usize {
        self.closure_computations.load(Ordering::SeqCst)
    }

    pub fn set_closure_delay(&self, delay: Duration) {
        *self.closure_delay.lock().unwrap() = delay;
    }

    fn check_write(&self, operation: &str) -> Result<(), RepositoryError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_at = self.fail_at.load(Ordering::SeqCst);
        let failing = fail_at != 0
            && if self.keep_failing.load(Ordering::SeqCst) {
                n >= fail_at
            } else {
                n == fail_at
            };
        if failing {
            return Err(RepositoryError::Conflict(format!(
                "injected failure on write {} ({})",
                n, operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphRepository for FaultyRepository {
    async fn find_node(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> Result<Option<EntityNode>, RepositoryError> {
        self.inner.find_node(node_id, partition_id).await
    }

    async fn find_nodes(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<EntityNode>, RepositoryError> {
        self.inner.find_nodes(partition_id, node_ids).await
    }

    async fn load_direct_parents(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<ParentReference>, RepositoryError> {
        self.inner.load_direct_parents(partition_id, node_ids).await
    }

    async fn load_direct_children(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<ChildrenReference>, RepositoryError> {
        self.inner.load_direct_children(partition_id, node_ids).await
    }

    async fn has_direct_child(
        &self,
        group: &NodeKey,
        child: &ChildrenReference,
    ) -> Result<bool, RepositoryError> {
        self.inner.has_direct_child(group, child).await
    }

    /// Counts every closure computation, then lets the resolver walk.
    async fn load_all_parents(
        &self,
        _node: &EntityNode,
    ) -> Result<Option<ParentTree>, RepositoryError> {
        self.closure_computations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.closure_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(None)
    }

    async fn load_all_children_users(
        &self,
        _node: &EntityNode,
    ) -> Result<Option<ChildrenTree>, RepositoryError> {
        Ok(None)
    }

    async fn list_groups(
        &self,
        partition_id: &str,
        group_type: GroupType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<RepositoryPage, RepositoryError> {
        self.inner
            .list_groups(partition_id, group_type, cursor, limit)
            .await
    }

    async fn create_node(&self, node: &EntityNode) -> Result<(), RepositoryError> {
        self.check_write("create_node")?;
        self.inner.create_node(node).await
    }

    async fn delete_node(&self, key: &NodeKey) -> Result<(), RepositoryError> {
        self.check_write("delete_node")?;
        self.inner.delete_node(key).await
    }

    async fn insert_edge(
        &self,
        parent: &EntityNode,
        child: &ChildrenReference,
    ) -> Result<(), RepositoryError> {
        self.check_write("insert_edge")?;
        self.inner.insert_edge(parent, child).await
    }

    async fn remove_edge(
        &self,
        parent: &NodeKey,
        child: &ChildrenReference,
    ) -> Result<(), RepositoryError> {
        self.check_write("remove_edge")?;
        self.inner.remove_edge(parent, child).await
    }
}

/// Cache store wrapper whose writes can be slowed down.
pub struct SlowWriteCache {
    inner: Arc<MockGroupCache>,
    put_delay: Mutex<Duration>,
}

impl SlowWriteCache {
    pub fn new(inner: Arc<MockGroupCache>) -> Self {
        Self {
            inner,
            put_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl GroupCacheStore for SlowWriteCache {
    async fn get(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<Option<ParentTree>, anyhow::Error> {
        self.inner.get(member_id, partition_id).await
    }

    async fn generation(&self, member_id: &str) -> Result<u64, anyhow::Error> {
        self.inner.generation(member_id).await
    }

    async fn put(
        &self,
        member_id: &str,
        partition_id: &str,
        tree: &ParentTree,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, anyhow::Error> {
        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .put(member_id, partition_id, tree, ttl, generation)
            .await
    }

    async fn evict_all(&self, member_id: &str) -> Result<(), anyhow::Error> {
        self.inner.evict_all(member_id).await
    }
}

/// Audit logger keeping every event in memory.
#[derive(Default)]
pub struct RecordingAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLogger {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditLogger for RecordingAuditLogger {
    fn log_async(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct TestOptions {
    pub data_root_enabled: bool,
    /// Partition to the partitions whose users may join its DATA groups.
    pub associations: HashMap<String, BTreeSet<String>>,
    pub cache: GroupCacheSettings,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            data_root_enabled: false,
            associations: HashMap::new(),
            cache: GroupCacheSettings {
                default_ttl: Duration::from_secs(60),
                partition_ttls: HashMap::new(),
                lock_wait: Duration::from_secs(2),
                lock_lease: Duration::from_secs(5),
                poll: RetryConfig {
                    max_retries: 3,
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(50),
                    backoff_multiplier: 2.0,
                    add_jitter: false,
                },
            },
        }
    }
}

/// Test application over in-memory collaborators.
pub struct TestApp {
    pub state: AppState,
    pub graph: Arc<InMemoryGraphRepository>,
    pub repository: Arc<FaultyRepository>,
    pub cache_store: Arc<MockGroupCache>,
    pub cache_writes: Arc<SlowWriteCache>,
    pub lock: Arc<InMemoryLockService>,
    pub audit: Arc<RecordingAuditLogger>,
}

impl TestApp {
    /// Spawn with the data-root flag disabled.
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with_data_root() -> Self {
        Self::spawn_with(TestOptions {
            data_root_enabled: true,
            ..Default::default()
        })
        .await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let graph = Arc::new(InMemoryGraphRepository::new());
        let repository = Arc::new(FaultyRepository::new(graph.clone()));
        let cache_store = Arc::new(MockGroupCache::new());
        let cache_writes = Arc::new(SlowWriteCache::new(cache_store.clone()));
        let lock = Arc::new(InMemoryLockService::new());
        let audit = Arc::new(RecordingAuditLogger::default());

        let flag_provider = StaticFeatureFlagProvider::new(HashMap::from([(
            (DATA_ROOT_GROUP_HIERARCHY.to_string(), PARTITION.to_string()),
            options.data_root_enabled,
        )]));

        let components = AppComponents {
            repository: repository.clone(),
            cache_store: cache_writes.clone(),
            lock: lock.clone(),
            flag_provider: Arc::new(flag_provider),
            flag_defaults: HashMap::new(),
            association_policy: Arc::new(AssociatedPartitionPolicy::new(options.associations)),
            audit: audit.clone(),
        };

        let settings = MembershipSettings {
            domain: DOMAIN.to_string(),
            data_root_group_name: DATA_ROOT_NAME.to_string(),
            revert_retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                add_jitter: false,
            },
        };

        let state = AppState::build(components, settings, options.cache);

        Self {
            state,
            graph,
            repository,
            cache_store,
            cache_writes,
            lock,
            audit,
        }
    }

    /// Provision the bootstrap groups of the test partition.
    pub async fn provision(&self) {
        self.state
            .membership
            .provision_partition(REQUESTER, PARTITION)
            .await
            .expect("Failed to provision partition");
    }

    pub async fn create_group(&self, name: &str) -> EntityNode {
        self.state
            .membership
            .create_group(create_request(name))
            .await
            .expect("Failed to create group")
            .group
    }

    pub async fn add_member(&self, group_name: &str, member: &str, role: Role) {
        self.state
            .membership
            .add_member(add_request(&group_email(group_name), member, role))
            .await
            .expect("Failed to add member");
    }

    /// Identifiers of every group `member` belongs to.
    pub async fn groups_of(&self, member: &str) -> BTreeSet<String> {
        self.state
            .membership
            .list_groups_on_behalf_of(entitlements_service::models::ListGroupsQuery {
                member_id: member.to_string(),
                partition_id: PARTITION.to_string(),
                group_type: GroupType::None,
                app_id: None,
            })
            .await
            .expect("Failed to list groups")
            .groups
            .into_iter()
            .map(|group| group.id)
            .collect()
    }
}

pub fn create_request(name: &str) -> CreateGroupRequest {
    CreateGroupRequest {
        requester_id: REQUESTER.to_string(),
        partition_id: PARTITION.to_string(),
        name: name.to_string(),
        description: format!("{} description", name),
        app_ids: BTreeSet::new(),
    }
}

pub fn add_request(group_email: &str, member: &str, role: Role) -> AddMemberRequest {
    AddMemberRequest {
        requester_id: REQUESTER.to_string(),
        partition_id: PARTITION.to_string(),
        group_email: group_email.to_string(),
        member_email: member.to_string(),
        role,
        member_partition_ids: vec![],
    }
}
