//! Membership use cases.
//!
//! Every mutation validates first, then compiles into [`Operation`]s that the
//! executor applies with compensation. Impacted members are evicted from the
//! parent-reference cache and an audit event is emitted either way.

use std::collections::BTreeSet;
use std::sync::Arc;

use service_core::retry::RetryConfig;

use super::audit::AuditLogger;
use super::cache::GroupCacheService;
use super::error::EntitlementsError;
use super::feature_flag::{FeatureFlagService, DATA_ROOT_GROUP_HIERARCHY};
use super::hierarchy::{filter_parents, HierarchyResolver};
use super::operation::{Operation, OperationExecutor};
use super::repository::GraphRepository;
use super::validation::{
    MembershipCheck, PartitionAssociationPolicy, ValidationRule, ValidationService,
};
use crate::models::{
    group_email_suffix, normalize_identifier, AddMemberRequest, AuditAction, AuditEvent,
    AuditStatus, ChildrenReference, ChildrenTree, CreateGroupRequest, CreateGroupResponse,
    DeleteGroupRequest, EntityNode, GroupType, GroupsPage, ListGroupsQuery, ListGroupsResponse,
    ListPartitionGroupsQuery, MutationOutcome, NodeType, ParentReference, RemoveMemberRequest,
    Role, DEFAULT_LIST_LIMIT,
};

/// Name of the group every partition gets for its regular users.
pub const USERS_GROUP_NAME: &str = "users";

#[derive(Debug, Clone)]
pub struct MembershipSettings {
    /// Suffix of group emails after the partition id.
    pub domain: String,
    pub data_root_group_name: String,
    /// Attempts granted to each revert during an unwind.
    pub revert_retry: RetryConfig,
}

pub struct MembershipService {
    repository: Arc<dyn GraphRepository>,
    resolver: Arc<HierarchyResolver>,
    validation: ValidationService,
    executor: OperationExecutor,
    cache: Arc<GroupCacheService>,
    feature_flags: Arc<FeatureFlagService>,
    audit: Arc<dyn AuditLogger>,
    settings: MembershipSettings,
}

impl MembershipService {
    pub fn new(
        repository: Arc<dyn GraphRepository>,
        resolver: Arc<HierarchyResolver>,
        cache: Arc<GroupCacheService>,
        feature_flags: Arc<FeatureFlagService>,
        audit: Arc<dyn AuditLogger>,
        association_policy: Arc<dyn PartitionAssociationPolicy>,
        settings: MembershipSettings,
    ) -> Self {
        let validation =
            ValidationService::new(repository.clone(), resolver.clone(), association_policy);
        let executor = OperationExecutor::new(repository.clone(), settings.revert_retry.clone());
        Self {
            repository,
            resolver,
            validation,
            executor,
            cache,
            feature_flags,
            audit,
            settings,
        }
    }

    /// Email of the data-root group of a partition.
    pub fn data_root_group_id(&self, partition_id: &str) -> String {
        format!(
            "{}{}",
            self.settings.data_root_group_name,
            group_email_suffix(partition_id, &self.settings.domain)
        )
    }

    /// Create the bootstrap groups of a partition, owned by `requester_id`.
    /// Groups that already exist are left untouched.
    #[tracing::instrument(skip(self, requester_id))]
    pub async fn provision_partition(
        &self,
        requester_id: &str,
        partition_id: &str,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let result = self.provision_partition_inner(requester_id, partition_id).await;
        self.record(
            AuditAction::ProvisionPartition,
            &result,
            partition_id,
            requester_id,
            partition_id,
        );
        result
    }

    async fn provision_partition_inner(
        &self,
        requester_id: &str,
        partition_id: &str,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let requester = normalize_identifier(requester_id)?;
        let owner = owner_reference(&requester, partition_id);

        let mut operations = Vec::new();
        for name in [self.settings.data_root_group_name.as_str(), USERS_GROUP_NAME] {
            let group = EntityNode::new_group(
                name,
                "",
                partition_id,
                &self.settings.domain,
                BTreeSet::new(),
            )?;
            if self
                .repository
                .find_node(&group.node_id, partition_id)
                .await?
                .is_some()
            {
                tracing::debug!(group_id = %group.node_id, "Bootstrap group already exists");
                continue;
            }
            operations.push(Operation::CreateNode {
                node: group.clone(),
                impacted: BTreeSet::new(),
            });
            operations.push(Operation::InsertEdge {
                parent: group,
                child: owner.clone(),
                impacted: BTreeSet::from([requester.clone()]),
            });
        }

        if operations.is_empty() {
            return Ok(MutationOutcome::default());
        }

        let impacted_members = self.commit(operations).await?;
        tracing::info!(partition_id = %partition_id, "Partition provisioned");
        Ok(MutationOutcome {
            impacted_members,
            applied: true,
        })
    }

    /// Create a group owned by the requester. With the data-root flag on, a
    /// new DATA group also gets the data-root group as a member.
    #[tracing::instrument(skip(self, request), fields(partition_id = %request.partition_id, name = %request.name))]
    pub async fn create_group(
        &self,
        request: CreateGroupRequest,
    ) -> Result<CreateGroupResponse, EntitlementsError> {
        let result = self.create_group_inner(&request).await;
        let target = match &result {
            Ok(response) => response.group.node_id.clone(),
            Err(_) => request.name.clone(),
        };
        self.record(
            AuditAction::CreateGroup,
            &result,
            &target,
            &request.requester_id,
            &request.partition_id,
        );
        result
    }

    async fn create_group_inner(
        &self,
        request: &CreateGroupRequest,
    ) -> Result<CreateGroupResponse, EntitlementsError> {
        let partition_id = request.partition_id.as_str();
        let requester = normalize_identifier(&request.requester_id)?;
        let group = EntityNode::new_group(
            &request.name,
            request.description.clone(),
            partition_id,
            &self.settings.domain,
            request.app_ids.clone(),
        )?;

        if self
            .repository
            .find_node(&group.node_id, partition_id)
            .await?
            .is_some()
        {
            return Err(EntitlementsError::Conflict(format!(
                "{} already exists",
                group.node_id
            )));
        }

        let mut operations = vec![
            Operation::CreateNode {
                node: group.clone(),
                impacted: BTreeSet::new(),
            },
            Operation::InsertEdge {
                parent: group.clone(),
                child: owner_reference(&requester, partition_id),
                impacted: BTreeSet::from([requester.clone()]),
            },
        ];

        if GroupType::of_group(&group.node_id)? == GroupType::Data
            && self
                .feature_flags
                .is_enabled(DATA_ROOT_GROUP_HIERARCHY, partition_id)
                .await
        {
            let data_root_id = self.data_root_group_id(partition_id);
            match self.repository.find_node(&data_root_id, partition_id).await? {
                Some(data_root) => {
                    let impacted = self
                        .resolver
                        .load_all_children_users(&data_root)
                        .await?
                        .user_ids;
                    operations.push(Operation::InsertEdge {
                        parent: group.clone(),
                        child: ChildrenReference::from_node(&data_root, Role::Member),
                        impacted,
                    });
                }
                None => {
                    tracing::warn!(
                        partition_id = %partition_id,
                        data_root_id = %data_root_id,
                        "Data-root group missing, skipping attach"
                    );
                }
            }
        }

        let impacted_members = self.commit(operations).await?;
        tracing::info!(group_id = %group.node_id, "Group created");
        Ok(CreateGroupResponse {
            group,
            impacted_members,
        })
    }

    /// Detach every edge of a group, then delete it.
    #[tracing::instrument(skip(self, request), fields(partition_id = %request.partition_id, group = %request.group_email))]
    pub async fn delete_group(
        &self,
        request: DeleteGroupRequest,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let result = self.delete_group_inner(&request).await;
        self.record(
            AuditAction::DeleteGroup,
            &result,
            &request.group_email,
            &request.requester_id,
            &request.partition_id,
        );
        result
    }

    async fn delete_group_inner(
        &self,
        request: &DeleteGroupRequest,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let partition_id = request.partition_id.as_str();
        let group_id = normalize_identifier(&request.group_email)?;
        self.require_requester(&request.requester_id, partition_id)
            .await?;
        let group = self.validation.require_group(&group_id, partition_id).await?;

        if group_id == self.data_root_group_id(partition_id)
            && self
                .feature_flags
                .is_enabled(DATA_ROOT_GROUP_HIERARCHY, partition_id)
                .await
        {
            return Err(EntitlementsError::validation(
                ValidationRule::ProtectedGroup,
                format!("{} cannot be deleted", group_id),
            ));
        }

        let users_below = self.resolver.load_all_children_users(&group).await?.user_ids;
        let mut operations = Vec::new();

        let parent_ids: Vec<String> = self
            .repository
            .load_direct_parents(partition_id, std::slice::from_ref(&group_id))
            .await?
            .into_iter()
            .map(|parent| parent.id)
            .collect();
        let parent_nodes = self.repository.find_nodes(partition_id, &parent_ids).await?;
        if parent_nodes.len() != parent_ids.len() {
            return Err(EntitlementsError::Conflict(format!(
                "Parents of {} changed while deleting it",
                group_id
            )));
        }
        for parent_node in parent_nodes {
            let edge = self.direct_edge(&parent_node, &group).await?;
            operations.push(Operation::RemoveEdge {
                parent: parent_node,
                child: edge,
                impacted: users_below.clone(),
            });
        }

        let children = self
            .repository
            .load_direct_children(partition_id, std::slice::from_ref(&group_id))
            .await?;
        for child in children {
            let impacted = self.users_affected_by(&child).await?;
            operations.push(Operation::RemoveEdge {
                parent: group.clone(),
                child,
                impacted,
            });
        }

        operations.push(Operation::DeleteNode {
            node: group.clone(),
        });

        let impacted_members = self.commit(operations).await?;
        tracing::info!(group_id = %group_id, "Group deleted");
        Ok(MutationOutcome {
            impacted_members,
            applied: true,
        })
    }

    /// Add a member to a group, once per partition the member is known under.
    /// Re-adding an existing edge is a no-op.
    #[tracing::instrument(skip(self, request), fields(partition_id = %request.partition_id, group = %request.group_email, role = %request.role))]
    pub async fn add_member(
        &self,
        request: AddMemberRequest,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let result = self.add_member_inner(&request).await;
        self.record(
            AuditAction::AddMember,
            &result,
            &request.member_email,
            &request.requester_id,
            &request.partition_id,
        );
        result
    }

    async fn add_member_inner(
        &self,
        request: &AddMemberRequest,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let partition_id = request.partition_id.as_str();
        let group_id = normalize_identifier(&request.group_email)?;
        let member_id = normalize_identifier(&request.member_email)?;
        self.require_requester(&request.requester_id, partition_id)
            .await?;
        let group = self.validation.require_group(&group_id, partition_id).await?;

        let member_partitions: BTreeSet<String> = if request.member_partition_ids.is_empty() {
            BTreeSet::from([partition_id.to_string()])
        } else {
            request.member_partition_ids.iter().cloned().collect()
        };

        let mut operations = Vec::new();
        for member_partition in &member_partitions {
            let child = ChildrenReference {
                id: member_id.clone(),
                node_type: NodeType::classify(&member_id, member_partition, &self.settings.domain)?,
                data_partition_id: member_partition.clone(),
                role: request.role,
            };

            match self.validation.check_add_member(&group, &child).await? {
                MembershipCheck::AlreadyMember => {
                    tracing::debug!(member = %child.key(), "Member already present");
                }
                MembershipCheck::Proceed => {
                    let impacted = self.users_affected_by(&child).await?;
                    operations.push(Operation::InsertEdge {
                        parent: group.clone(),
                        child,
                        impacted,
                    });
                }
            }
        }

        if operations.is_empty() {
            return Ok(MutationOutcome::default());
        }

        let impacted_members = self.commit(operations).await?;
        tracing::info!(group_id = %group_id, member_id = %member_id, "Member added");
        Ok(MutationOutcome {
            impacted_members,
            applied: true,
        })
    }

    /// Remove a member from a group, whatever its role.
    #[tracing::instrument(skip(self, request), fields(partition_id = %request.partition_id, group = %request.group_email))]
    pub async fn remove_member(
        &self,
        request: RemoveMemberRequest,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let result = self.remove_member_inner(&request).await;
        self.record(
            AuditAction::RemoveMember,
            &result,
            &request.member_email,
            &request.requester_id,
            &request.partition_id,
        );
        result
    }

    async fn remove_member_inner(
        &self,
        request: &RemoveMemberRequest,
    ) -> Result<MutationOutcome, EntitlementsError> {
        let partition_id = request.partition_id.as_str();
        let group_id = normalize_identifier(&request.group_email)?;
        let member_id = normalize_identifier(&request.member_email)?;
        let member_partition = request
            .member_partition_id
            .as_deref()
            .unwrap_or(partition_id);
        self.require_requester(&request.requester_id, partition_id)
            .await?;
        let group = self.validation.require_group(&group_id, partition_id).await?;

        let data_root_id = self.data_root_group_id(partition_id);
        if member_id == data_root_id
            && GroupType::of_group(&group_id)? == GroupType::Data
            && self
                .feature_flags
                .is_enabled(DATA_ROOT_GROUP_HIERARCHY, partition_id)
                .await
        {
            return Err(EntitlementsError::validation(
                ValidationRule::ProtectedGroup,
                format!("{} cannot be removed from {}", member_id, group_id),
            ));
        }

        let member = EntityNode {
            node_type: NodeType::classify(&member_id, member_partition, &self.settings.domain)?,
            ..EntityNode::new_member(&member_id, member_partition)?
        };
        let child = self.direct_edge(&group, &member).await?;
        let impacted = self.users_affected_by(&child).await?;

        let impacted_members = self
            .commit(vec![Operation::RemoveEdge {
                parent: group,
                child,
                impacted,
            }])
            .await?;
        tracing::info!(group_id = %group_id, member_id = %member_id, "Member removed");
        Ok(MutationOutcome {
            impacted_members,
            applied: true,
        })
    }

    /// Groups a member belongs to, directly or transitively.
    ///
    /// User closures are served from the parent-reference cache; group
    /// closures are resolved on every call.
    pub async fn list_groups_on_behalf_of(
        &self,
        query: ListGroupsQuery,
    ) -> Result<ListGroupsResponse, EntitlementsError> {
        let partition_id = query.partition_id.as_str();
        let member_id = normalize_identifier(&query.member_id)?;

        let tree = match NodeType::classify(&member_id, partition_id, &self.settings.domain)? {
            NodeType::User => {
                self.cache
                    .get_from_partition_cache(&member_id, partition_id)
                    .await?
            }
            NodeType::Group => {
                let group = self.repository.require_node(&member_id, partition_id).await?;
                self.resolver.load_all_parents(&group).await?
            }
        };

        Ok(ListGroupsResponse {
            member_email: member_id,
            groups: filter_parents(
                tree.parent_references,
                query.group_type,
                query.app_id.as_deref(),
            ),
        })
    }

    /// Direct members of a group, optionally restricted to one role.
    pub async fn list_group_members(
        &self,
        group_email: &str,
        partition_id: &str,
        role: Option<Role>,
    ) -> Result<Vec<ChildrenReference>, EntitlementsError> {
        let group_id = normalize_identifier(group_email)?;
        let group = self.validation.require_group(&group_id, partition_id).await?;
        let mut members: Vec<ChildrenReference> = self
            .repository
            .load_direct_children(&group.data_partition_id, &[group.node_id])
            .await?
            .into_iter()
            .filter(|child| role.is_none_or(|role| child.role == role))
            .collect();
        members.sort();
        Ok(members)
    }

    /// Users reachable below a group through any nesting.
    pub async fn list_member_users(
        &self,
        group_email: &str,
        partition_id: &str,
    ) -> Result<ChildrenTree, EntitlementsError> {
        let group_id = normalize_identifier(group_email)?;
        let group = self.validation.require_group(&group_id, partition_id).await?;
        self.resolver.load_all_children_users(&group).await
    }

    /// One page of the groups of a partition.
    pub async fn list_partition_groups(
        &self,
        query: ListPartitionGroupsQuery,
    ) -> Result<GroupsPage, EntitlementsError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit == 0 {
            return Err(EntitlementsError::validation(
                ValidationRule::InvalidListLimit,
                "limit must be at least 1",
            ));
        }

        let page = self
            .repository
            .list_groups(
                &query.partition_id,
                query.group_type,
                query.cursor.as_deref(),
                limit,
            )
            .await?;

        Ok(GroupsPage {
            groups: page.nodes.iter().map(ParentReference::from).collect(),
            cursor: page.next_cursor,
            total_count: page.total_count,
        })
    }

    /// The requester must already be a node of the partition.
    async fn require_requester(
        &self,
        requester_id: &str,
        partition_id: &str,
    ) -> Result<EntityNode, EntitlementsError> {
        let requester = normalize_identifier(requester_id)?;
        Ok(self.repository.require_node(&requester, partition_id).await?)
    }

    async fn commit(
        &self,
        operations: Vec<Operation>,
    ) -> Result<BTreeSet<String>, EntitlementsError> {
        let impacted = self.executor.execute(operations).await?;
        self.cache.invalidate(&impacted).await;
        Ok(impacted)
    }

    /// The stored edge from `child` to `parent`, with its role.
    async fn direct_edge(
        &self,
        parent: &EntityNode,
        child: &EntityNode,
    ) -> Result<ChildrenReference, EntitlementsError> {
        let child_key = child.key();
        self.repository
            .load_direct_children(&parent.data_partition_id, std::slice::from_ref(&parent.node_id))
            .await?
            .into_iter()
            .find(|reference| reference.key() == child_key)
            .ok_or_else(|| {
                EntitlementsError::NotFound(format!(
                    "{} is not a member of {}",
                    child.node_id, parent.node_id
                ))
            })
    }

    /// Members whose closure changes when `child` gains or loses a parent.
    async fn users_affected_by(
        &self,
        child: &ChildrenReference,
    ) -> Result<BTreeSet<String>, EntitlementsError> {
        if child.is_user() {
            return Ok(BTreeSet::from([child.id.clone()]));
        }
        match self
            .repository
            .find_node(&child.id, &child.data_partition_id)
            .await?
        {
            Some(node) => Ok(self.resolver.load_all_children_users(&node).await?.user_ids),
            None => Ok(BTreeSet::new()),
        }
    }

    fn record<T>(
        &self,
        action: AuditAction,
        result: &Result<T, EntitlementsError>,
        target_id: &str,
        requester_id: &str,
        partition_id: &str,
    ) {
        let status = match result {
            Ok(_) => AuditStatus::Success,
            Err(e) => {
                tracing::warn!(action = ?action, target_id = %target_id, error = %e, "Mutation rejected");
                AuditStatus::Failure
            }
        };
        self.audit.log_async(AuditEvent::new(
            action,
            status,
            target_id,
            requester_id,
            partition_id,
        ));
    }
}

fn owner_reference(requester: &str, partition_id: &str) -> ChildrenReference {
    ChildrenReference {
        id: requester.to_string(),
        node_type: NodeType::User,
        data_partition_id: partition_id.to_string(),
        role: Role::Owner,
    }
}
