//! Compensating operations over single-record storage writes.
//!
//! A mutation is compiled into a list of [`Operation`]s. The executor applies
//! them in order and, when one fails, reverts the applied ones newest first.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use service_core::retry::{retry_with_backoff, RetryConfig};

use super::error::EntitlementsError;
use super::repository::{GraphRepository, RepositoryError};
use crate::models::{ChildrenReference, EntityNode};

/// One atomic storage step and its inverse.
///
/// Each step carries the members whose effective entitlements change when it
/// is applied. The set is computed while the graph still holds the edges the
/// step touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateNode {
        node: EntityNode,
        impacted: BTreeSet<String>,
    },
    DeleteNode {
        node: EntityNode,
    },
    InsertEdge {
        parent: EntityNode,
        child: ChildrenReference,
        impacted: BTreeSet<String>,
    },
    RemoveEdge {
        parent: EntityNode,
        child: ChildrenReference,
        impacted: BTreeSet<String>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateNode { .. } => "create_node",
            Operation::DeleteNode { .. } => "delete_node",
            Operation::InsertEdge { .. } => "insert_edge",
            Operation::RemoveEdge { .. } => "remove_edge",
        }
    }

    pub async fn apply(
        &self,
        repository: &dyn GraphRepository,
    ) -> Result<BTreeSet<String>, RepositoryError> {
        match self {
            Operation::CreateNode { node, impacted } => {
                repository.create_node(node).await?;
                Ok(impacted.clone())
            }
            Operation::DeleteNode { node } => {
                repository.delete_node(&node.key()).await?;
                Ok(BTreeSet::new())
            }
            Operation::InsertEdge {
                parent,
                child,
                impacted,
            } => {
                repository.insert_edge(parent, child).await?;
                Ok(impacted.clone())
            }
            Operation::RemoveEdge {
                parent,
                child,
                impacted,
            } => {
                repository.remove_edge(&parent.key(), child).await?;
                Ok(impacted.clone())
            }
        }
    }

    /// Undo `apply`. Finding the effect already undone counts as success.
    pub async fn revert(&self, repository: &dyn GraphRepository) -> Result<(), RepositoryError> {
        let result = match self {
            Operation::CreateNode { node, .. } => repository.delete_node(&node.key()).await,
            Operation::DeleteNode { node } => repository.create_node(node).await,
            Operation::InsertEdge { parent, child, .. } => {
                repository.remove_edge(&parent.key(), child).await
            }
            Operation::RemoveEdge { parent, child, .. } => {
                repository.insert_edge(parent, child).await
            }
        };

        match (self, result) {
            (Operation::CreateNode { .. } | Operation::InsertEdge { .. }, Err(e))
                if e.is_not_found() =>
            {
                Ok(())
            }
            (
                Operation::DeleteNode { .. } | Operation::RemoveEdge { .. },
                Err(RepositoryError::Conflict(_)),
            ) => Ok(()),
            (_, result) => result,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateNode { node, .. } | Operation::DeleteNode { node } => {
                write!(f, "{} {}", self.name(), node.key())
            }
            Operation::InsertEdge { parent, child, .. }
            | Operation::RemoveEdge { parent, child, .. } => write!(
                f,
                "{} {} -> {} ({})",
                self.name(),
                child.key(),
                parent.key(),
                child.role
            ),
        }
    }
}

pub struct OperationExecutor {
    repository: Arc<dyn GraphRepository>,
    revert_retry: RetryConfig,
}

impl OperationExecutor {
    pub fn new(repository: Arc<dyn GraphRepository>, revert_retry: RetryConfig) -> Self {
        Self {
            repository,
            revert_retry,
        }
    }

    /// Apply `operations` in order and return the union of impacted members.
    ///
    /// On failure every applied step is reverted in reverse order and the
    /// original error is returned, unless a revert failed for good, in which
    /// case the result is `PartialRollbackFailure`.
    pub async fn execute(
        &self,
        operations: Vec<Operation>,
    ) -> Result<BTreeSet<String>, EntitlementsError> {
        let mut applied: Vec<Operation> = Vec::with_capacity(operations.len());
        let mut impacted = BTreeSet::new();

        for operation in operations {
            match operation.apply(self.repository.as_ref()).await {
                Ok(members) => {
                    tracing::debug!(operation = %operation, "Applied operation");
                    impacted.extend(members);
                    applied.push(operation);
                }
                Err(err) => {
                    tracing::warn!(
                        operation = %operation,
                        applied = applied.len(),
                        error = %err,
                        "Operation failed, unwinding"
                    );
                    return Err(self.unwind(applied, err.into()).await);
                }
            }
        }

        Ok(impacted)
    }

    async fn unwind(
        &self,
        applied: Vec<Operation>,
        original: EntitlementsError,
    ) -> EntitlementsError {
        metrics::counter!("operation_unwinds_total").increment(1);
        let repository = self.repository.as_ref();
        let mut unreverted = Vec::new();

        for operation in applied.iter().rev() {
            let reverted = retry_with_backoff(
                &self.revert_retry,
                operation.name(),
                |_err: &RepositoryError| true,
                || operation.revert(repository),
            )
            .await;

            if let Err(err) = reverted {
                tracing::error!(
                    operation = %operation,
                    error = %err,
                    "Failed to revert operation"
                );
                unreverted.push(operation.to_string());
            }
        }

        if unreverted.is_empty() {
            original
        } else {
            EntitlementsError::PartialRollbackFailure {
                original: original.to_string(),
                unreverted,
            }
        }
    }
}
