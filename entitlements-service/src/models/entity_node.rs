//! Entity node model - users, service accounts and groups of one partition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::services::error::EntitlementsError;

const MIN_GROUP_NAME_LENGTH: usize = 3;
const MAX_GROUP_NAME_LENGTH: usize = 128;

/// Kind of node in the membership graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    /// A user or service account, managed outside this service.
    User,
    /// A group owned by a partition.
    Group,
}

impl NodeType {
    /// Classify an identifier as a group of `partition_id` or an external user.
    ///
    /// Groups follow the `<name>@<partition>.<domain>` shape; any other valid
    /// email-shaped identifier denotes a user or service account.
    pub fn classify(
        identifier: &str,
        partition_id: &str,
        domain: &str,
    ) -> Result<NodeType, EntitlementsError> {
        let identifier = normalize_identifier(identifier)?;
        if identifier.ends_with(&group_email_suffix(partition_id, domain)) {
            Ok(NodeType::Group)
        } else {
            Ok(NodeType::User)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::User => "USER",
            NodeType::Group => "GROUP",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role carried by a membership edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Owner,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Member => "MEMBER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EntitlementsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OWNER" => Ok(Role::Owner),
            "MEMBER" => Ok(Role::Member),
            other => Err(EntitlementsError::validation(
                crate::services::ValidationRule::InvalidRole,
                format!("Invalid role: {}", other),
            )),
        }
    }
}

/// Identity of a node: identifiers are only unique within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub node_id: String,
    pub data_partition_id: String,
}

impl NodeKey {
    pub fn new(node_id: impl Into<String>, data_partition_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            data_partition_id: data_partition_id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node_id, self.data_partition_id)
    }
}

/// A user, service account or group scoped to exactly one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    pub node_id: String,
    pub node_type: NodeType,
    pub name: String,
    pub description: String,
    pub data_partition_id: String,
    /// Client applications allowed to see this group. Empty means unrestricted.
    #[serde(default)]
    pub app_ids: BTreeSet<String>,
}

impl EntityNode {
    /// Create a group node for a name inside a partition.
    pub fn new_group(
        name: &str,
        description: impl Into<String>,
        partition_id: &str,
        domain: &str,
        app_ids: BTreeSet<String>,
    ) -> Result<Self, EntitlementsError> {
        let name = validate_group_name(name)?;
        Ok(Self {
            node_id: format!("{}@{}.{}", name, partition_id, domain),
            node_type: NodeType::Group,
            name,
            description: description.into(),
            data_partition_id: partition_id.to_string(),
            app_ids,
        })
    }

    /// Node for a user or service account that may not be stored yet.
    pub fn new_member(member_id: &str, partition_id: &str) -> Result<Self, EntitlementsError> {
        let member_id = normalize_identifier(member_id)?;
        Ok(Self {
            name: member_id.clone(),
            node_id: member_id,
            node_type: NodeType::User,
            description: String::new(),
            data_partition_id: partition_id.to_string(),
            app_ids: BTreeSet::new(),
        })
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.node_id.clone(), self.data_partition_id.clone())
    }

    pub fn is_group(&self) -> bool {
        self.node_type == NodeType::Group
    }

    pub fn is_user(&self) -> bool {
        self.node_type == NodeType::User
    }
}

/// Suffix shared by every group email of a partition.
pub fn group_email_suffix(partition_id: &str, domain: &str) -> String {
    format!("@{}.{}", partition_id, domain).to_lowercase()
}

/// Trim and lowercase an email-shaped identifier, rejecting malformed ones.
pub fn normalize_identifier(raw: &str) -> Result<String, EntitlementsError> {
    let identifier = raw.trim().to_lowercase();
    let invalid = || EntitlementsError::InvalidIdentifier(raw.to_string());

    if identifier.is_empty() || identifier.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let mut parts = identifier.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    if local.is_empty()
        || domain.is_empty()
        || domain.starts_with('.')
        || domain.ends_with('.')
        || domain.contains("..")
    {
        return Err(invalid());
    }

    Ok(identifier)
}

/// Group names are lowercased and limited to `[a-z0-9._-]{3,128}`.
pub fn validate_group_name(raw: &str) -> Result<String, EntitlementsError> {
    let name = raw.trim().to_lowercase();
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if !valid_chars || !(MIN_GROUP_NAME_LENGTH..=MAX_GROUP_NAME_LENGTH).contains(&name.len()) {
        return Err(EntitlementsError::InvalidIdentifier(raw.to_string()));
    }

    Ok(name)
}
