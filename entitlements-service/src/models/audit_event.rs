//! Audit events emitted for every structural mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mutation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateGroup,
    DeleteGroup,
    AddMember,
    RemoveMember,
    ProvisionPartition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// Outcome of one mutation, keyed by a random id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub action: AuditAction,
    pub status: AuditStatus,
    pub target_id: String,
    pub requester_id: String,
    pub partition_id: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        status: AuditStatus,
        target_id: impl Into<String>,
        requester_id: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            status,
            target_id: target_id.into(),
            requester_id: requester_id.into(),
            partition_id: partition_id.into(),
            created_at: Utc::now(),
        }
    }
}
