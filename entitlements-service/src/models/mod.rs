pub mod audit_event;
pub mod entity_node;
pub mod group_type;
pub mod reference;
pub mod request;

pub use audit_event::{AuditAction, AuditEvent, AuditStatus};
pub use entity_node::{
    group_email_suffix, normalize_identifier, validate_group_name, EntityNode, NodeKey, NodeType,
    Role,
};
pub use group_type::GroupType;
pub use reference::{ChildrenReference, ChildrenTree, ParentReference, ParentTree};
pub use request::{
    AddMemberRequest, CreateGroupRequest, CreateGroupResponse, DeleteGroupRequest,
    GroupsPage, ListGroupsQuery, ListGroupsResponse, ListPartitionGroupsQuery, MutationOutcome,
    RemoveMemberRequest, DEFAULT_LIST_LIMIT,
};
