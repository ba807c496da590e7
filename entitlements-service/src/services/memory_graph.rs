//! In-process graph store.
//!
//! Backs the standalone binary and the test-suite. Every call takes the state
//! lock once, so each write is atomic like a single-record store write.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::repository::{GraphRepository, RepositoryError, RepositoryPage};
use crate::models::{
    ChildrenReference, EntityNode, GroupType, NodeKey, NodeType, ParentReference, Role,
};

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeKey, EntityNode>,
    /// child -> parent -> role
    parents: HashMap<NodeKey, BTreeMap<NodeKey, Role>>,
    /// parent -> child -> role
    children: HashMap<NodeKey, BTreeMap<NodeKey, Role>>,
}

impl GraphState {
    fn has_edges(&self, key: &NodeKey) -> bool {
        self.parents.get(key).is_some_and(|p| !p.is_empty())
            || self.children.get(key).is_some_and(|c| !c.is_empty())
    }
}

/// Ordered dump of the graph, used to compare states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeKey>,
    /// (parent, child, role)
    pub edges: Vec<(NodeKey, NodeKey, Role)>,
}

pub struct InMemoryGraphRepository {
    state: RwLock<GraphState>,
}

impl Default for InMemoryGraphRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphState>, RepositoryError> {
        self.state
            .read()
            .map_err(|e| RepositoryError::Internal(anyhow::anyhow!("Graph state lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphState>, RepositoryError> {
        self.state
            .write()
            .map_err(|e| RepositoryError::Internal(anyhow::anyhow!("Graph state lock poisoned: {}", e)))
    }

    pub fn snapshot(&self) -> Result<GraphSnapshot, RepositoryError> {
        let state = self.read()?;
        let mut nodes: Vec<NodeKey> = state.nodes.keys().cloned().collect();
        nodes.sort();
        let mut edges: Vec<(NodeKey, NodeKey, Role)> = state
            .children
            .iter()
            .flat_map(|(parent, children)| {
                children
                    .iter()
                    .map(move |(child, role)| (parent.clone(), child.clone(), *role))
            })
            .collect();
        edges.sort();
        Ok(GraphSnapshot { nodes, edges })
    }

    pub fn edge_count(&self) -> Result<usize, RepositoryError> {
        Ok(self.read()?.children.values().map(BTreeMap::len).sum())
    }
}

#[async_trait]
impl GraphRepository for InMemoryGraphRepository {
    async fn find_node(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> Result<Option<EntityNode>, RepositoryError> {
        let key = NodeKey::new(node_id, partition_id);
        Ok(self.read()?.nodes.get(&key).cloned())
    }

    async fn find_nodes(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<EntityNode>, RepositoryError> {
        let state = self.read()?;
        Ok(node_ids
            .iter()
            .filter_map(|id| state.nodes.get(&NodeKey::new(id.as_str(), partition_id)))
            .cloned()
            .collect())
    }

    async fn load_direct_parents(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<ParentReference>, RepositoryError> {
        let state = self.read()?;
        let mut references = Vec::new();
        for node_id in node_ids {
            let key = NodeKey::new(node_id.as_str(), partition_id);
            let Some(parents) = state.parents.get(&key) else {
                continue;
            };
            for parent_key in parents.keys() {
                let parent = state.nodes.get(parent_key).ok_or_else(|| {
                    RepositoryError::Internal(anyhow::anyhow!(
                        "Dangling edge from {} to {}",
                        key,
                        parent_key
                    ))
                })?;
                references.push(ParentReference::from(parent));
            }
        }
        Ok(references)
    }

    async fn load_direct_children(
        &self,
        partition_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<ChildrenReference>, RepositoryError> {
        let state = self.read()?;
        let mut references = Vec::new();
        for node_id in node_ids {
            let key = NodeKey::new(node_id.as_str(), partition_id);
            let Some(children) = state.children.get(&key) else {
                continue;
            };
            for (child_key, role) in children {
                let child = state.nodes.get(child_key).ok_or_else(|| {
                    RepositoryError::Internal(anyhow::anyhow!(
                        "Dangling edge from {} to {}",
                        child_key,
                        key
                    ))
                })?;
                references.push(ChildrenReference::from_node(child, *role));
            }
        }
        Ok(references)
    }

    async fn has_direct_child(
        &self,
        group: &NodeKey,
        child: &ChildrenReference,
    ) -> Result<bool, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .children
            .get(group)
            .and_then(|children| children.get(&child.key()))
            .is_some_and(|role| *role == child.role))
    }

    async fn list_groups(
        &self,
        partition_id: &str,
        group_type: GroupType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<RepositoryPage, RepositoryError> {
        let state = self.read()?;
        let mut groups: Vec<&EntityNode> = state
            .nodes
            .values()
            .filter(|node| node.is_group() && node.data_partition_id == partition_id)
            .filter(|node| group_type.matches(&node.node_id))
            .collect();
        groups.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let total_count = groups.len();
        let remaining: Vec<&EntityNode> = groups
            .into_iter()
            .filter(|node| cursor.is_none_or(|after| node.node_id.as_str() > after))
            .collect();

        let nodes: Vec<EntityNode> = remaining.iter().take(limit).map(|n| (*n).clone()).collect();
        let next_cursor = if remaining.len() > nodes.len() {
            nodes.last().map(|n| n.node_id.clone())
        } else {
            None
        };

        Ok(RepositoryPage {
            nodes,
            next_cursor,
            total_count,
        })
    }

    async fn create_node(&self, node: &EntityNode) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let key = node.key();
        if state.nodes.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!("{} already exists", key)));
        }
        state.nodes.insert(key, node.clone());
        Ok(())
    }

    async fn delete_node(&self, key: &NodeKey) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        if !state.nodes.contains_key(key) {
            return Err(RepositoryError::NotFound(format!("{} is not found", key)));
        }
        if state.has_edges(key) {
            return Err(RepositoryError::Conflict(format!(
                "{} still has membership edges",
                key
            )));
        }
        state.nodes.remove(key);
        state.parents.remove(key);
        state.children.remove(key);
        Ok(())
    }

    async fn insert_edge(
        &self,
        parent: &EntityNode,
        child: &ChildrenReference,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let parent_key = parent.key();
        let child_key = child.key();

        match state.nodes.get(&parent_key) {
            Some(node) if node.is_group() => {}
            Some(_) => {
                return Err(RepositoryError::Conflict(format!(
                    "{} is not a group",
                    parent_key
                )));
            }
            None => {
                return Err(RepositoryError::NotFound(format!(
                    "{} is not found",
                    parent_key
                )));
            }
        }

        if !state.nodes.contains_key(&child_key) {
            if child.node_type == NodeType::Group {
                return Err(RepositoryError::NotFound(format!(
                    "{} is not found",
                    child_key
                )));
            }
            state.nodes.insert(
                child_key.clone(),
                EntityNode {
                    node_id: child.id.clone(),
                    node_type: NodeType::User,
                    name: child.id.clone(),
                    description: String::new(),
                    data_partition_id: child.data_partition_id.clone(),
                    app_ids: Default::default(),
                },
            );
        }

        if state
            .children
            .get(&parent_key)
            .is_some_and(|children| children.contains_key(&child_key))
        {
            return Err(RepositoryError::Conflict(format!(
                "{} is already a member of {}",
                child_key, parent_key
            )));
        }

        state
            .children
            .entry(parent_key.clone())
            .or_default()
            .insert(child_key.clone(), child.role);
        state
            .parents
            .entry(child_key)
            .or_default()
            .insert(parent_key, child.role);
        Ok(())
    }

    async fn remove_edge(
        &self,
        parent: &NodeKey,
        child: &ChildrenReference,
    ) -> Result<(), RepositoryError> {
        let mut state = self.write()?;
        let child_key = child.key();

        let matches_role = state
            .children
            .get(parent)
            .and_then(|children| children.get(&child_key))
            .is_some_and(|role| *role == child.role);
        if !matches_role {
            return Err(RepositoryError::NotFound(format!(
                "{} is not a {} of {}",
                child_key, child.role, parent
            )));
        }

        if let Some(children) = state.children.get_mut(parent) {
            children.remove(&child_key);
        }
        if let Some(parents) = state.parents.get_mut(&child_key) {
            parents.remove(parent);
        }

        if child.node_type == NodeType::User && !state.has_edges(&child_key) {
            state.nodes.remove(&child_key);
            state.parents.remove(&child_key);
            state.children.remove(&child_key);
        }
        Ok(())
    }
}
