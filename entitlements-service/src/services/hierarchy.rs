//! Transitive closures over the membership graph.
//!
//! Both traversals are breadth-first with a visited set, so a corrupted graph
//! containing a cycle still terminates.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use super::error::EntitlementsError;
use super::repository::GraphRepository;
use crate::models::{ChildrenTree, EntityNode, GroupType, NodeKey, ParentReference, ParentTree};

pub struct HierarchyResolver {
    repository: Arc<dyn GraphRepository>,
}

impl HierarchyResolver {
    pub fn new(repository: Arc<dyn GraphRepository>) -> Self {
        Self { repository }
    }

    /// Every group `node` belongs to, directly or through nested groups.
    pub async fn load_all_parents(&self, node: &EntityNode) -> Result<ParentTree, EntitlementsError> {
        if let Some(tree) = self.repository.load_all_parents(node).await? {
            return Ok(normalize_parents(tree));
        }

        let mut visited: HashSet<NodeKey> = HashSet::from([node.key()]);
        let mut found: BTreeMap<String, ParentReference> = BTreeMap::new();
        let mut frontier = vec![node.key()];
        let mut depth = 0;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (partition_id, node_ids) in by_partition(&frontier) {
                let parents = self
                    .repository
                    .load_direct_parents(&partition_id, &node_ids)
                    .await?;
                for parent in parents {
                    if visited.insert(parent.key()) {
                        next.push(parent.key());
                        found.entry(parent.id.clone()).or_insert(parent);
                    }
                }
            }
            if !next.is_empty() {
                depth += 1;
            }
            frontier = next;
        }

        tracing::debug!(
            node_id = %node.node_id,
            partition_id = %node.data_partition_id,
            parents = found.len(),
            depth,
            "Resolved parent closure"
        );

        Ok(ParentTree {
            parent_references: found.into_values().collect(),
            max_depth: depth,
        })
    }

    /// Parent closure of an identifier that may not be stored. Unknown
    /// members belong to nothing.
    pub async fn load_all_parents_of(
        &self,
        member_id: &str,
        partition_id: &str,
    ) -> Result<ParentTree, EntitlementsError> {
        match self.repository.find_node(member_id, partition_id).await? {
            Some(node) => self.load_all_parents(&node).await,
            None => Ok(ParentTree::default()),
        }
    }

    /// Users and service accounts reachable below `group`. Nested groups are
    /// walked but not reported.
    pub async fn load_all_children_users(
        &self,
        group: &EntityNode,
    ) -> Result<ChildrenTree, EntitlementsError> {
        if let Some(tree) = self.repository.load_all_children_users(group).await? {
            return Ok(tree);
        }

        let mut visited: HashSet<NodeKey> = HashSet::from([group.key()]);
        let mut user_ids = BTreeSet::new();
        let mut frontier = vec![group.key()];
        let mut depth = 0;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (partition_id, node_ids) in by_partition(&frontier) {
                let children = self
                    .repository
                    .load_direct_children(&partition_id, &node_ids)
                    .await?;
                for child in children {
                    if child.is_user() {
                        user_ids.insert(child.id);
                    } else if visited.insert(child.key()) {
                        next.push(child.key());
                    }
                }
            }
            depth += 1;
            frontier = next;
        }

        Ok(ChildrenTree {
            user_ids,
            max_depth: depth,
        })
    }

    /// Whether `candidate` is `node` itself or one of its ancestors.
    pub async fn is_ancestor_or_self(
        &self,
        candidate: &NodeKey,
        node: &EntityNode,
    ) -> Result<bool, EntitlementsError> {
        if node.key() == *candidate {
            return Ok(true);
        }
        let tree = self.load_all_parents(node).await?;
        Ok(tree
            .parent_references
            .iter()
            .any(|parent| parent.key() == *candidate))
    }
}

/// Apply listing filters after the closure is complete.
pub fn filter_parents(
    parents: Vec<ParentReference>,
    group_type: GroupType,
    app_id: Option<&str>,
) -> Vec<ParentReference> {
    parents
        .into_iter()
        .filter(|parent| group_type.matches(&parent.id))
        .filter(|parent| app_id.is_none_or(|app_id| parent.visible_to_app(app_id)))
        .collect()
}

fn normalize_parents(mut tree: ParentTree) -> ParentTree {
    tree.parent_references.sort_by(|a, b| a.id.cmp(&b.id));
    tree.parent_references.dedup_by(|a, b| a.id == b.id);
    tree
}

fn by_partition(keys: &[NodeKey]) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in keys {
        grouped
            .entry(key.data_partition_id.clone())
            .or_default()
            .push(key.node_id.clone());
    }
    grouped
}
