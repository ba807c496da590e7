//! Audit trail of structural mutations.

use crate::models::{AuditEvent, AuditStatus};

/// Receives mutation outcomes. Implementations must return immediately; a
/// failing sink never fails the mutation that produced the event.
pub trait AuditLogger: Send + Sync {
    fn log_async(&self, event: AuditEvent);
}

/// Writes audit events to the structured log on a spawned task.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditLogger;

impl TracingAuditLogger {
    pub fn new() -> Self {
        Self
    }
}

impl AuditLogger for TracingAuditLogger {
    fn log_async(&self, event: AuditEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(event_id = %event.id, "No runtime to emit audit event");
            return;
        };
        runtime.spawn(async move {
            match event.status {
                AuditStatus::Success => tracing::info!(
                    target: "audit",
                    event_id = %event.id,
                    action = ?event.action,
                    target_id = %event.target_id,
                    requester_id = %event.requester_id,
                    partition_id = %event.partition_id,
                    created_at = %event.created_at,
                    "Mutation succeeded"
                ),
                AuditStatus::Failure => tracing::warn!(
                    target: "audit",
                    event_id = %event.id,
                    action = ?event.action,
                    target_id = %event.target_id,
                    requester_id = %event.requester_id,
                    partition_id = %event.partition_id,
                    created_at = %event.created_at,
                    "Mutation failed"
                ),
            }
        });
    }
}
