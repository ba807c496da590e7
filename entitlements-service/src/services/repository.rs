//! Storage capability required by the entitlements core.
//!
//! Adapters for relational, document or graph stores implement
//! [`GraphRepository`] independently. Every write is a single atomic storage
//! call; nothing here assumes multi-call transactions.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    ChildrenReference, ChildrenTree, EntityNode, GroupType, NodeKey, ParentReference, ParentTree,
};

/// Failure reported by a storage adapter.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent modification or uniqueness violation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store could not answer in time; the call may be retried.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal storage error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound(_))
    }
}

/// One page of a partition-wide group listing.
#[derive(Debug, Clone, Default)]
pub struct RepositoryPage {
    pub nodes: Vec<EntityNode>,
    pub next_cursor: Option<String>,
    /// Number of groups matching the filter across all pages.
    pub total_count: usize,
}

#[async_trait]
pub trait GraphRepository: Send + Sync {
    async fn find_node(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> Result<Option<EntityNode>, RepositoryError>;

    /// Fetch a node, failing with `NotFound` when it is absent.
    async fn require_node(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> Result<EntityNode, RepositoryError> {
        self.find_node(node_id, partition_id).await?.ok_or_else(|| {
            RepositoryError::NotFound(format!("{} is not found in {}", node_id, partition_id))
        })
    }

    /// Batch fetch; identifiers that do not exist are skipped.
    async fn find_nodes(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<EntityNode>, RepositoryError>;

    async fn load_direct_parents(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<ParentReference>, RepositoryError>;

    async fn load_direct_children(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<ChildrenReference>, RepositoryError>;

    /// Whether `child` is a direct member of `group` with exactly `child.role`.
    async fn has_direct_child(
        &self,
        group: &NodeKey,
        child: &ChildrenReference,
    ) -> Result<bool, RepositoryError>;

    /// Native transitive-parent traversal. `None` lets the resolver walk
    /// direct parents itself.
    async fn load_all_parents(
        &self,
        _node: &EntityNode,
    ) -> Result<Option<ParentTree>, RepositoryError> {
        Ok(None)
    }

    /// Native transitive-children traversal reporting users only.
    async fn load_all_children_users(
        &self,
        _node: &EntityNode,
    ) -> Result<Option<ChildrenTree>, RepositoryError> {
        Ok(None)
    }

    /// Groups of a partition ordered by identifier, starting after `cursor`.
    async fn list_groups(
        &self,
        partition_id: &str,
        group_type: GroupType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<RepositoryPage, RepositoryError>;

    async fn create_node(&self, node: &EntityNode) -> Result<(), RepositoryError>;

    /// Delete a node that no longer has any edge.
    async fn delete_node(&self, key: &NodeKey) -> Result<(), RepositoryError>;

    /// Insert the edge `child -> parent`. A user child that is not stored yet
    /// is created with the edge.
    async fn insert_edge(
        &self,
        parent: &EntityNode,
        child: &ChildrenReference,
    ) -> Result<(), RepositoryError>;

    /// Remove the edge `child -> parent` carrying `child.role`. A user child
    /// left without parents is removed with the edge.
    async fn remove_edge(
        &self,
        parent: &NodeKey,
        child: &ChildrenReference,
    ) -> Result<(), RepositoryError>;

    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
