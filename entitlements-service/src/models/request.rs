//! Inbound requests and outbound results of the membership use cases.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::entity_node::{EntityNode, Role};
use super::group_type::GroupType;
use super::reference::ParentReference;

/// Default page size for partition-wide group listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Request to create a group in a partition.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub requester_id: String,
    pub partition_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub app_ids: BTreeSet<String>,
}

/// Request to delete a group and detach all of its edges.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteGroupRequest {
    pub requester_id: String,
    pub partition_id: String,
    pub group_email: String,
}

/// Request to add a member to a group.
#[derive(Debug, Clone, Deserialize)]
pub struct AddMemberRequest {
    pub requester_id: String,
    pub partition_id: String,
    pub group_email: String,
    pub member_email: String,
    pub role: Role,
    /// Partitions the member is known under. Empty means the group's partition.
    #[serde(default)]
    pub member_partition_ids: Vec<String>,
}

/// Request to remove a member from a group.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoveMemberRequest {
    pub requester_id: String,
    pub partition_id: String,
    pub group_email: String,
    pub member_email: String,
    /// Partition the member is stored under. Defaults to the group's partition.
    #[serde(default)]
    pub member_partition_id: Option<String>,
}

/// Query for the groups a member belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct ListGroupsQuery {
    pub member_id: String,
    pub partition_id: String,
    #[serde(default)]
    pub group_type: GroupType,
    #[serde(default)]
    pub app_id: Option<String>,
}

/// Query for a page of all groups in a partition.
#[derive(Debug, Clone, Deserialize)]
pub struct ListPartitionGroupsQuery {
    pub partition_id: String,
    #[serde(default)]
    pub group_type: GroupType,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Result of a structural mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// Members whose effective entitlements changed.
    pub impacted_members: BTreeSet<String>,
    /// False when the request was already satisfied and nothing was written.
    pub applied: bool,
}

/// Result of group creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateGroupResponse {
    pub group: EntityNode,
    pub impacted_members: BTreeSet<String>,
}

/// Groups a member belongs to, directly or transitively.
#[derive(Debug, Clone, Serialize)]
pub struct ListGroupsResponse {
    pub member_email: String,
    pub groups: Vec<ParentReference>,
}

/// A page of partition groups.
#[derive(Debug, Clone, Serialize)]
pub struct GroupsPage {
    pub groups: Vec<ParentReference>,
    /// Cursor for the next page, absent on the last page.
    pub cursor: Option<String>,
    pub total_count: usize,
}
