pub mod config;
pub mod models;
pub mod services;

use std::collections::HashMap;
use std::sync::Arc;

use crate::services::{
    AuditLogger, DistributedLock, FeatureFlagProvider, FeatureFlagService, GraphRepository,
    GroupCacheService, GroupCacheSettings, GroupCacheStore, HierarchyResolver, MembershipService,
    MembershipSettings, PartitionAssociationPolicy,
};

/// External collaborators the core runs against.
pub struct AppComponents {
    pub repository: Arc<dyn GraphRepository>,
    pub cache_store: Arc<dyn GroupCacheStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub flag_provider: Arc<dyn FeatureFlagProvider>,
    pub flag_defaults: HashMap<String, bool>,
    pub association_policy: Arc<dyn PartitionAssociationPolicy>,
    pub audit: Arc<dyn AuditLogger>,
}

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn GraphRepository>,
    pub resolver: Arc<HierarchyResolver>,
    pub cache: Arc<GroupCacheService>,
    pub feature_flags: Arc<FeatureFlagService>,
    pub membership: Arc<MembershipService>,
}

impl AppState {
    pub fn build(
        components: AppComponents,
        membership_settings: MembershipSettings,
        cache_settings: GroupCacheSettings,
    ) -> Self {
        let resolver = Arc::new(HierarchyResolver::new(components.repository.clone()));
        let cache = Arc::new(GroupCacheService::new(
            components.cache_store,
            components.lock,
            resolver.clone(),
            cache_settings,
        ));
        let feature_flags = Arc::new(FeatureFlagService::new(
            components.flag_provider,
            components.flag_defaults,
        ));
        let membership = Arc::new(MembershipService::new(
            components.repository.clone(),
            resolver.clone(),
            cache.clone(),
            feature_flags.clone(),
            components.audit,
            components.association_policy,
            membership_settings,
        ));

        Self {
            repository: components.repository,
            resolver,
            cache,
            feature_flags,
            membership,
        }
    }
}
