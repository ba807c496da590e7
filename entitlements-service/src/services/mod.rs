//! Services layer for entitlements-service.
//!
//! Hierarchy validation, compensated mutations, closure resolution and the
//! parent-reference cache, plus the adapters they run against.

pub mod audit;
pub mod cache;
pub mod error;
pub mod feature_flag;
pub mod hierarchy;
pub mod membership;
pub mod memory_graph;
pub mod operation;
pub mod redis;
pub mod repository;
pub mod validation;

pub use audit::{AuditLogger, TracingAuditLogger};
pub use cache::{
    DistributedLock, GroupCacheService, GroupCacheSettings, GroupCacheStore, InMemoryLockService,
    LockError, LockHandle, MockGroupCache,
};
pub use error::EntitlementsError;
pub use feature_flag::{
    FeatureFlagProvider, FeatureFlagService, StaticFeatureFlagProvider, DATA_ROOT_GROUP_HIERARCHY,
};
pub use hierarchy::{filter_parents, HierarchyResolver};
pub use membership::{MembershipService, MembershipSettings, USERS_GROUP_NAME};
pub use memory_graph::{GraphSnapshot, InMemoryGraphRepository};
pub use operation::{Operation, OperationExecutor};
pub use redis::RedisService;
pub use repository::{GraphRepository, RepositoryError, RepositoryPage};
pub use validation::{
    AssociatedPartitionPolicy, MembershipCheck, PartitionAssociationPolicy, SamePartitionPolicy,
    ValidationRule, ValidationService,
};
