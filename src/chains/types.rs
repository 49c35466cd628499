use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::ChainCacheEntry;

/// One descendant within a chain view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMember {
    /// The descendant session.
    pub session_id: String,
    /// Its direct parent.
    pub parent_id: String,
    /// Parent hops from the chain root.
    pub depth: i64,
    /// Creation order under its parent.
    pub order: i64,
    /// Whether it is its parent's active continuation.
    pub is_active_continuation: bool,
    /// Whether its parent is currently unknown.
    pub is_orphaned: bool,
    /// When the continuation started.
    pub child_started_at: Option<DateTime<Utc>>,
}

/// A whole continuation chain as seen from its root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainView {
    /// Root session of the chain.
    pub parent: String,
    /// Descendant ids ordered by depth, then by order.
    pub children: Vec<String>,
    /// Every descendant in breadth-first order.
    pub flat_descendants: Vec<ChainMember>,
    /// Whether any session in the chain has more than one child.
    pub has_branches: bool,
    /// Root plus descendants.
    pub total_sessions: usize,
    /// Deepest descendant depth, 0 for a lone root.
    pub max_depth: i64,
}

/// Per-session chain metadata for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMetadata {
    /// The described session.
    pub session_id: String,
    /// Root of its chain.
    pub root_id: String,
    /// Whether it continues another session.
    pub is_child: bool,
    /// Whether another session continues it.
    pub is_parent: bool,
    /// Parent hops from the root.
    pub depth: i64,
    /// Order under its parent, 0 for a root.
    pub chain_position: i64,
    /// Whether it is its parent's active continuation.
    pub is_active_continuation: bool,
    /// Number of direct children.
    pub child_count: i64,
    /// Whether it has any children.
    pub has_children: bool,
    /// Whether it has more than one child.
    pub has_multiple_children: bool,
}

impl From<ChainCacheEntry> for ChainMetadata {
    fn from(entry: ChainCacheEntry) -> Self {
        Self {
            has_children: entry.has_children(),
            session_id: entry.session_id,
            root_id: entry.root_id,
            is_child: entry.is_child,
            is_parent: entry.is_parent,
            depth: entry.depth_from_root,
            chain_position: entry.chain_position,
            is_active_continuation: entry.is_active_continuation,
            child_count: entry.child_count,
            has_multiple_children: entry.has_multiple_children,
        }
    }
}

/// Totals across every stored chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Sessions with children but no parent.
    pub total_chains: usize,
    /// Stored edges.
    pub total_relationships: usize,
    /// Deepest descendant across all chains.
    pub max_depth: i64,
    /// Edges whose parent is unknown.
    pub orphaned_count: usize,
    /// Mean sessions per chain, root included.
    pub average_chain_length: f64,
}

/// Outcome of a full continuation scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveReport {
    /// Transcripts handed to the detector.
    pub total_scanned: usize,
    /// Edges written through the store.
    pub continuations_found: usize,
    /// Per-item failures; the scan continued past each.
    pub errors: Vec<String>,
    /// Orphaned edges after the scan.
    pub orphans: usize,
    /// Cache entries populated for the chains touched.
    pub cached_count: usize,
}

/// Outcome of an orphan healing pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealReport {
    /// Edges re-linked this pass.
    pub healed: usize,
    /// Edges still orphaned afterwards.
    pub remaining: usize,
    /// Orphans left alone because re-detection named a different parent.
    pub conflicts: usize,
    /// Per-edge failures.
    pub errors: Vec<String>,
}
