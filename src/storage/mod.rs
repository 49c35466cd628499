//! Storage layer for continuation relationships.
//!
//! This module provides SQLite-based persistence for the session registry,
//! parent/child continuation edges, and the derived chain metadata cache.

mod sqlite;


pub use sqlite::SqliteStorage;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// A transcript known to the discovery registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session UUID (the transcript file stem).
    pub id: String,
    /// Path of the newline-delimited JSON transcript.
    pub file_path: PathBuf,
    /// Project directory the transcript was found under.
    pub project: Option<String>,
    /// When discovery first registered the session.
    pub discovered_at: DateTime<Utc>,
}

/// A parent/child continuation relationship between two sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationEdge {
    /// The continuing session. Unique: a child has exactly one parent.
    pub child_id: String,
    /// The session that was continued.
    pub parent_id: String,
    /// Creation order among the parent's children, starting at 1.
    pub order: i64,
    /// Timestamp of the compaction boundary that started the child.
    pub child_started_at: Option<DateTime<Utc>>,
    /// Whether this is the parent's most recently created child.
    pub is_active_continuation: bool,
    /// Whether the parent is currently unknown to the session registry.
    pub is_orphaned: bool,
    /// When the edge was first stored.
    pub detected_at: DateTime<Utc>,
    /// When the edge was last written.
    pub updated_at: DateTime<Utc>,
}

/// Derived per-session chain metadata.
///
/// Every field is re-derivable from the edges reachable from `root_id`;
/// an absent entry is always a valid state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainCacheEntry {
    /// Session this entry describes.
    pub session_id: String,
    /// Root of the chain containing the session.
    pub root_id: String,
    /// Whether the session has a parent edge.
    pub is_child: bool,
    /// Whether the session has at least one child edge.
    pub is_parent: bool,
    /// Number of direct children.
    pub child_count: i64,
    /// The edge order when the session is a child, otherwise 0.
    pub chain_position: i64,
    /// Whether the session is its parent's active continuation.
    pub is_active_continuation: bool,
    /// Parent hops from the session to `root_id`.
    pub depth_from_root: i64,
    /// Whether the session has more than one child.
    pub has_multiple_children: bool,
    /// When the entry was computed.
    pub computed_at: DateTime<Utc>,
}

/// Aggregates over the cached entries of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedChainStats {
    /// Chain root.
    pub root_id: String,
    /// Deepest cached depth.
    pub max_depth: i64,
    /// Number of cached entries under the root.
    pub session_count: i64,
    /// Whether any cached session branches.
    pub has_branches: bool,
}

/// What an edge upsert did to the stored relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EdgeUpsert {
    /// A new edge was created and made the parent's active continuation.
    Inserted {
        /// Order assigned under the parent.
        order: i64,
    },
    /// The child moved from another parent to this one.
    Reparented {
        /// Parent the child was previously attached to.
        previous_parent: String,
        /// Order assigned under the new parent.
        order: i64,
    },
    /// The edge already pointed at this parent; timestamps and the orphan
    /// flag were refreshed, order and active flag were left untouched.
    Refreshed,
}

impl EdgeUpsert {
    /// Whether the upsert created a relationship that did not exist before.
    pub fn is_new(&self) -> bool {
        !matches!(self, EdgeUpsert::Refreshed)
    }
}

/// Effects of removing a session from the edge set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRemoval {
    /// Child edges flagged orphaned because the session was their parent.
    pub orphaned_edges: u64,
    /// Whether the session's own parent edge was deleted.
    pub removed_edge: bool,
}

/// Persistence operations for continuation edges and the chain cache.
///
/// Every edge mutation invalidates the affected cache entries inside the
/// same transaction before returning.
#[async_trait]
pub trait Storage: Send + Sync {
    // Edge operations

    /// Insert or update the edge keyed by `child_id`.
    async fn upsert_edge(
        &self,
        child_id: &str,
        parent_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> StorageResult<EdgeUpsert>;
    /// Get the parent edge of a session.
    async fn get_edge(&self, child_id: &str) -> StorageResult<Option<ContinuationEdge>>;
    /// Get the direct children of a session ordered by `order`.
    async fn get_children(&self, parent_id: &str) -> StorageResult<Vec<ContinuationEdge>>;
    /// Count the direct children of a session.
    async fn count_children(&self, parent_id: &str) -> StorageResult<i64>;
    /// List every stored edge.
    async fn list_edges(&self) -> StorageResult<Vec<ContinuationEdge>>;
    /// List edges whose parent is currently unknown.
    async fn list_orphaned_edges(&self) -> StorageResult<Vec<ContinuationEdge>>;
    /// Orphan the session's children and drop its own parent edge.
    async fn on_session_deleted(&self, id: &str) -> StorageResult<SessionRemoval>;
    /// Clear the orphan flag on edges whose parent is `id`.
    async fn on_session_created(&self, id: &str) -> StorageResult<u64>;

    // Cache operations

    /// Current mutation epoch; cache writes must quote the epoch they were computed under.
    async fn cache_epoch(&self) -> StorageResult<i64>;
    /// Get a cached entry.
    async fn get_cache_entry(&self, session_id: &str) -> StorageResult<Option<ChainCacheEntry>>;
    /// Store entries unless an edge mutation happened since `epoch`.
    /// Returns `false` when the write was discarded as stale.
    async fn put_cache_entries(&self, entries: &[ChainCacheEntry], epoch: i64)
        -> StorageResult<bool>;
    /// Drop the entries for `id`, its parent, and every entry in its chain.
    async fn invalidate_cache(&self, id: &str) -> StorageResult<u64>;
    /// Aggregate the cached entries under a root, `None` if nothing is cached.
    async fn cached_chain_stats(&self, root_id: &str) -> StorageResult<Option<CachedChainStats>>;
    /// Number of cached entries.
    async fn count_cache_entries(&self) -> StorageResult<i64>;
}

/// Registry of known sessions, fed by transcript discovery.
#[async_trait]
pub trait SessionCatalog: Send + Sync {
    /// Whether a session is currently known.
    async fn session_exists(&self, id: &str) -> StorageResult<bool>;
    /// Transcript path of a known session.
    async fn session_file(&self, id: &str) -> StorageResult<Option<PathBuf>>;
    /// All known sessions.
    async fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>>;
    /// Register or refresh a session. Returns `true` when it was previously
    /// unknown, in which case orphaned edges pointing at it are healed.
    async fn register_session(&self, record: &SessionRecord) -> StorageResult<bool>;
    /// Remove a session. Returns `true` when it was known, in which case the
    /// deletion cascade has been applied to its edges.
    async fn forget_session(&self, id: &str) -> StorageResult<bool>;
}

impl SessionRecord {
    /// Create a record discovered now.
    pub fn new(id: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            project: None,
            discovered_at: Utc::now(),
        }
    }

    /// Set the project directory name.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

impl ChainCacheEntry {
    /// Whether the session has any children.
    pub fn has_children(&self) -> bool {
        self.child_count > 0
    }
}
