//! Chain resolution: root lookup and breadth-first descendant expansion.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use super::types::{ChainMember, ChainView};
use crate::error::StorageResult;
use crate::storage::{SqliteStorage, Storage};

/// Walks continuation edges to find chain roots and rebuild chains.
#[derive(Clone)]
pub struct ChainResolver {
    storage: SqliteStorage,
}

/// Raw result of expanding a chain from its root.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTraversal {
    /// Session the traversal started from.
    pub root_id: String,
    /// Parent edge of the root, if any (cyclic data or a detached subtree).
    pub root_order: Option<(i64, bool)>,
    /// Descendants in breadth-first order.
    pub members: Vec<ChainMember>,
    /// Direct child count of every visited session, root included.
    pub child_counts: HashMap<String, usize>,
}

impl ChainResolver {
    /// Create a resolver over the given storage.
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// The session followed by its ancestors, ending at the chain root.
    ///
    /// Stops at the first revisited id so cyclic parent pointers terminate;
    /// the last element is then the node at which the cycle closed.
    pub async fn ancestor_path(&self, id: &str) -> StorageResult<Vec<String>> {
        let mut path = vec![id.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(id.to_string());

        let mut current = id.to_string();
        while let Some(edge) = self.storage.get_edge(&current).await? {
            if !visited.insert(edge.parent_id.clone()) {
                warn!(
                    session_id = %id,
                    revisited = %edge.parent_id,
                    stopped_at = %current,
                    "Cycle in continuation parent pointers"
                );
                break;
            }
            path.push(edge.parent_id.clone());
            current = edge.parent_id;
        }

        Ok(path)
    }

    /// Root of the chain containing `id`.
    pub async fn find_root(&self, id: &str) -> StorageResult<String> {
        let mut path = self.ancestor_path(id).await?;
        Ok(path.pop().unwrap_or_else(|| id.to_string()))
    }

    /// Expand every descendant of `root_id` breadth-first.
    pub async fn traverse(&self, root_id: &str) -> StorageResult<ChainTraversal> {
        let root_order = self
            .storage
            .get_edge(root_id)
            .await?
            .map(|edge| (edge.order, edge.is_active_continuation));

        let mut members = Vec::new();
        let mut child_counts = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_id.to_string());

        let mut queue: VecDeque<(String, i64)> = VecDeque::new();
        queue.push_back((root_id.to_string(), 0));

        while let Some((node, depth)) = queue.pop_front() {
            let children = self.storage.get_children(&node).await?;
            child_counts.insert(node.clone(), children.len());

            for edge in children {
                if !visited.insert(edge.child_id.clone()) {
                    warn!(
                        root_id = %root_id,
                        session_id = %edge.child_id,
                        "Session reached twice while expanding chain; skipping"
                    );
                    continue;
                }

                queue.push_back((edge.child_id.clone(), depth + 1));
                members.push(ChainMember {
                    session_id: edge.child_id,
                    parent_id: edge.parent_id,
                    depth: depth + 1,
                    order: edge.order,
                    is_active_continuation: edge.is_active_continuation,
                    is_orphaned: edge.is_orphaned,
                    child_started_at: edge.child_started_at,
                });
            }
        }

        Ok(ChainTraversal {
            root_id: root_id.to_string(),
            root_order,
            members,
            child_counts,
        })
    }

    /// Build the chain view rooted at `root_id`.
    pub async fn build_chain(&self, root_id: &str) -> StorageResult<ChainView> {
        Ok(self.traverse(root_id).await?.into_view())
    }

    /// Build the whole chain containing `id`, whatever its position.
    pub async fn chain_for(&self, id: &str) -> StorageResult<ChainView> {
        let root = self.find_root(id).await?;
        self.build_chain(&root).await
    }
}

impl ChainTraversal {
    /// Direct child count of a visited session.
    pub fn child_count(&self, session_id: &str) -> usize {
        self.child_counts.get(session_id).copied().unwrap_or(0)
    }

    /// Shape the traversal into the presentation view.
    pub fn into_view(self) -> ChainView {
        let has_branches = self.child_counts.values().any(|&count| count > 1);
        let max_depth = self.members.iter().map(|m| m.depth).max().unwrap_or(0);

        let mut ordered: Vec<&ChainMember> = self.members.iter().collect();
        ordered.sort_by(|a, b| (a.depth, a.order).cmp(&(b.depth, b.order)));
        let children = ordered.iter().map(|m| m.session_id.clone()).collect();

        ChainView {
            total_sessions: 1 + self.members.len(),
            parent: self.root_id,
            children,
            flat_descendants: self.members,
            has_branches,
            max_depth,
        }
    }
}
