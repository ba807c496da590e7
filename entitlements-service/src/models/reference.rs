//! Lightweight projections of nodes used in listings and closures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::entity_node::{EntityNode, NodeKey, NodeType, Role};

/// A group reported as an ancestor of some node. Carries no role since the
/// same ancestor can be reached through several paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentReference {
    pub id: String,
    pub name: String,
    pub description: String,
    pub data_partition_id: String,
    #[serde(default)]
    pub app_ids: BTreeSet<String>,
}

impl ParentReference {
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.id.clone(), self.data_partition_id.clone())
    }

    /// Visible to `app_id` when unrestricted or explicitly listed.
    pub fn visible_to_app(&self, app_id: &str) -> bool {
        self.app_ids.is_empty() || self.app_ids.contains(app_id)
    }
}

impl From<&EntityNode> for ParentReference {
    fn from(node: &EntityNode) -> Self {
        Self {
            id: node.node_id.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            data_partition_id: node.data_partition_id.clone(),
            app_ids: node.app_ids.clone(),
        }
    }
}

/// A direct member of a group, with the role of that membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildrenReference {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub data_partition_id: String,
    pub role: Role,
}

impl ChildrenReference {
    pub fn from_node(node: &EntityNode, role: Role) -> Self {
        Self {
            id: node.node_id.clone(),
            node_type: node.node_type,
            data_partition_id: node.data_partition_id.clone(),
            role,
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.id.clone(), self.data_partition_id.clone())
    }

    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }

    pub fn is_user(&self) -> bool {
        self.node_type == NodeType::User
    }
}

/// Transitive ancestors of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentTree {
    /// Deduplicated by identifier and sorted by it.
    pub parent_references: Vec<ParentReference>,
    /// Number of edges on the longest shortest-path explored.
    pub max_depth: usize,
}

/// User and service-account members reachable below a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildrenTree {
    pub user_ids: BTreeSet<String>,
    pub max_depth: usize,
}
