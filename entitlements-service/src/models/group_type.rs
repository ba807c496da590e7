//! Group classification derived from the group naming convention.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity_node::normalize_identifier;
use crate::services::error::EntitlementsError;

const DATA_PREFIX: &str = "data.";
const USERS_NAME: &str = "users";
const USERS_PREFIX: &str = "users.";
const SERVICE_PREFIX: &str = "service.";

/// Group classification used to filter listings.
///
/// As a filter, `None` matches every group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupType {
    #[default]
    None,
    Data,
    User,
    Service,
}

impl GroupType {
    /// Derive the type of a group from the prefix of its name.
    pub fn of_group(group_id: &str) -> Result<GroupType, EntitlementsError> {
        let group_id = normalize_identifier(group_id)?;
        let name = group_id.split('@').next().unwrap_or_default();

        let group_type = if name.starts_with(DATA_PREFIX) {
            GroupType::Data
        } else if name == USERS_NAME || name.starts_with(USERS_PREFIX) {
            GroupType::User
        } else if name.starts_with(SERVICE_PREFIX) {
            GroupType::Service
        } else {
            GroupType::None
        };
        Ok(group_type)
    }

    /// Whether a group identifier passes this filter. Malformed ids never match.
    pub fn matches(&self, group_id: &str) -> bool {
        match self {
            GroupType::None => true,
            expected => GroupType::of_group(group_id).is_ok_and(|actual| actual == *expected),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::None => "NONE",
            GroupType::Data => "DATA",
            GroupType::User => "USER",
            GroupType::Service => "SERVICE",
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupType {
    type Err = EntitlementsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NONE" => Ok(GroupType::None),
            "DATA" => Ok(GroupType::Data),
            "USER" => Ok(GroupType::User),
            "SERVICE" => Ok(GroupType::Service),
            _ => Err(EntitlementsError::InvalidFilter(s.to_string())),
        }
    }
}
