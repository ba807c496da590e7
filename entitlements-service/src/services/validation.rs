//! Hierarchy rules checked before a mutation is compiled into operations.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::error::EntitlementsError;
use super::hierarchy::HierarchyResolver;
use super::repository::GraphRepository;
use crate::models::{ChildrenReference, EntityNode, GroupType, Role};

/// Rule reported by a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationRule {
    /// The parent endpoint of an edge must be a group.
    ParentNotGroup,
    /// A group can never be, even transitively, its own member.
    CyclicMembership,
    /// Member partition not allowed to join the group's partition.
    PartitionScope,
    InvalidRole,
    /// Member already holds the other role in this group.
    MembershipRoleConflict,
    /// Partition bootstrap group that cannot be detached or deleted.
    ProtectedGroup,
    InvalidListLimit,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::ParentNotGroup => "parent_not_group",
            ValidationRule::CyclicMembership => "cyclic_membership",
            ValidationRule::PartitionScope => "partition_scope",
            ValidationRule::InvalidRole => "invalid_role",
            ValidationRule::MembershipRoleConflict => "membership_role_conflict",
            ValidationRule::ProtectedGroup => "protected_group",
            ValidationRule::InvalidListLimit => "invalid_list_limit",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a user of `member_partition_id` may join `group`.
pub trait PartitionAssociationPolicy: Send + Sync {
    fn allows(&self, group: &EntityNode, member_partition_id: &str) -> bool;
}

/// Users may only join groups of their own partition.
#[derive(Debug, Default, Clone, Copy)]
pub struct SamePartitionPolicy;

impl PartitionAssociationPolicy for SamePartitionPolicy {
    fn allows(&self, group: &EntityNode, member_partition_id: &str) -> bool {
        group.data_partition_id == member_partition_id
    }
}

/// DATA groups additionally accept users of associated partitions.
#[derive(Debug, Default, Clone)]
pub struct AssociatedPartitionPolicy {
    associations: HashMap<String, BTreeSet<String>>,
}

impl AssociatedPartitionPolicy {
    /// `associations` maps a partition to the partitions whose users may join
    /// its DATA groups.
    pub fn new(associations: HashMap<String, BTreeSet<String>>) -> Self {
        Self { associations }
    }
}

impl PartitionAssociationPolicy for AssociatedPartitionPolicy {
    fn allows(&self, group: &EntityNode, member_partition_id: &str) -> bool {
        if group.data_partition_id == member_partition_id {
            return true;
        }
        GroupType::Data.matches(&group.node_id)
            && self
                .associations
                .get(&group.data_partition_id)
                .is_some_and(|allowed| allowed.contains(member_partition_id))
    }
}

/// Outcome of the add-member checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipCheck {
    Proceed,
    /// The exact edge is stored; adding it again writes nothing.
    AlreadyMember,
}

pub struct ValidationService {
    repository: Arc<dyn GraphRepository>,
    resolver: Arc<HierarchyResolver>,
    association_policy: Arc<dyn PartitionAssociationPolicy>,
}

impl ValidationService {
    pub fn new(
        repository: Arc<dyn GraphRepository>,
        resolver: Arc<HierarchyResolver>,
        association_policy: Arc<dyn PartitionAssociationPolicy>,
    ) -> Self {
        Self {
            repository,
            resolver,
            association_policy,
        }
    }

    /// Fetch a group, rejecting users in the parent position.
    pub async fn require_group(
        &self,
        group_id: &str,
        partition_id: &str,
    ) -> Result<EntityNode, EntitlementsError> {
        let node = self.repository.require_node(group_id, partition_id).await?;
        if !node.is_group() {
            return Err(EntitlementsError::validation(
                ValidationRule::ParentNotGroup,
                format!("{} is not a group", group_id),
            ));
        }
        Ok(node)
    }

    /// Rules for adding `member` to `group`, in order: existence, duplicate,
    /// cycle, partition scope.
    pub async fn check_add_member(
        &self,
        group: &EntityNode,
        member: &ChildrenReference,
    ) -> Result<MembershipCheck, EntitlementsError> {
        let member_node = if member.is_user() {
            None
        } else {
            Some(
                self.repository
                    .require_node(&member.id, &member.data_partition_id)
                    .await?,
            )
        };

        let group_key = group.key();
        if self.repository.has_direct_child(&group_key, member).await? {
            return Ok(MembershipCheck::AlreadyMember);
        }
        let other_role = opposite(member.role);
        if self
            .repository
            .has_direct_child(&group_key, &member.with_role(other_role))
            .await?
        {
            return Err(EntitlementsError::validation(
                ValidationRule::MembershipRoleConflict,
                format!(
                    "{} is already a {} of {}",
                    member.id, other_role, group.node_id
                ),
            ));
        }

        if let Some(member_node) = &member_node {
            if self
                .resolver
                .is_ancestor_or_self(&member_node.key(), group)
                .await?
            {
                return Err(EntitlementsError::validation(
                    ValidationRule::CyclicMembership,
                    format!(
                        "Adding {} to {} would create a cycle",
                        member.id, group.node_id
                    ),
                ));
            }
            if member_node.data_partition_id != group.data_partition_id {
                return Err(EntitlementsError::validation(
                    ValidationRule::PartitionScope,
                    format!(
                        "Group {} cannot join a group of partition {}",
                        member.id, group.data_partition_id
                    ),
                ));
            }
        } else if !self
            .association_policy
            .allows(group, &member.data_partition_id)
        {
            return Err(EntitlementsError::validation(
                ValidationRule::PartitionScope,
                format!(
                    "Members of partition {} cannot join {}",
                    member.data_partition_id, group.node_id
                ),
            ));
        }

        Ok(MembershipCheck::Proceed)
    }
}

fn opposite(role: Role) -> Role {
    match role {
        Role::Owner => Role::Member,
        Role::Member => Role::Owner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_graph::InMemoryGraphRepository;

    fn node(name: &str, partition: &str) -> EntityNode {
        EntityNode::new_group(name, "", partition, "example.com", BTreeSet::new()).unwrap()
    }

    fn service(repo: Arc<InMemoryGraphRepository>) -> ValidationService {
        let resolver = Arc::new(HierarchyResolver::new(repo.clone()));
        ValidationService::new(repo, resolver, Arc::new(SamePartitionPolicy))
    }

    #[test]
    fn test_associated_partition_policy_only_widens_data_groups() {
        let policy = AssociatedPartitionPolicy::new(HashMap::from([(
            "dp1".to_string(),
            BTreeSet::from(["dp2".to_string()]),
        )]));

        assert!(policy.allows(&node("data.wells", "dp1"), "dp1"));
        assert!(policy.allows(&node("data.wells", "dp1"), "dp2"));
        assert!(!policy.allows(&node("data.wells", "dp1"), "dp3"));
        assert!(!policy.allows(&node("users.ops", "dp1"), "dp2"));
        assert!(!SamePartitionPolicy.allows(&node("data.wells", "dp1"), "dp2"));
    }

    #[tokio::test]
    async fn test_existing_edge_is_already_member() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let group = node("users.ops", "dp");
        repo.create_node(&group).await.unwrap();
        let member = ChildrenReference {
            id: "u@corp.com".into(),
            node_type: crate::models::NodeType::User,
            data_partition_id: "dp".into(),
            role: Role::Member,
        };
        repo.insert_edge(&group, &member).await.unwrap();

        let validation = service(repo);
        assert_eq!(
            validation.check_add_member(&group, &member).await.unwrap(),
            MembershipCheck::AlreadyMember
        );
        let err = validation
            .check_add_member(&group, &member.with_role(Role::Owner))
            .await
            .unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::MembershipRoleConflict));
    }

    #[tokio::test]
    async fn test_self_membership_is_a_cycle() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let group = node("users.ops", "dp");
        repo.create_node(&group).await.unwrap();

        let err = service(repo)
            .check_add_member(&group, &ChildrenReference::from_node(&group, Role::Member))
            .await
            .unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::CyclicMembership));
    }

    #[tokio::test]
    async fn test_missing_group_member_is_not_found() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let group = node("users.ops", "dp");
        repo.create_node(&group).await.unwrap();
        let ghost = node("users.ghost", "dp");

        let err = service(repo)
            .check_add_member(&group, &ChildrenReference::from_node(&ghost, Role::Member))
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_foreign_user_rejected_by_default() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let group = node("data.wells", "dp");
        repo.create_node(&group).await.unwrap();
        let member = ChildrenReference {
            id: "u@corp.com".into(),
            node_type: crate::models::NodeType::User,
            data_partition_id: "other".into(),
            role: Role::Member,
        };

        let err = service(repo)
            .check_add_member(&group, &member)
            .await
            .unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::PartitionScope));
    }

    #[tokio::test]
    async fn test_require_group_rejects_users() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let group = node("users.ops", "dp");
        repo.create_node(&group).await.unwrap();
        let member = ChildrenReference {
            id: "u@corp.com".into(),
            node_type: crate::models::NodeType::User,
            data_partition_id: "dp".into(),
            role: Role::Owner,
        };
        repo.insert_edge(&group, &member).await.unwrap();

        let err = service(repo)
            .require_group("u@corp.com", "dp")
            .await
            .unwrap_err();
        assert_eq!(err.rule(), Some(ValidationRule::ParentNotGroup));
    }
}
