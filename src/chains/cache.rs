//! Metadata cache: a derived, invalidatable projection of the edge set.
//!
//! Entries are computed lazily on a read miss, or for a whole chain at once
//! when the chain is about to be displayed. The store drops entries on every
//! edge mutation, so an entry is always either absent or exact. Writes are
//! tagged with the mutation epoch they were computed under and discarded if a
//! mutation landed in between.

use chrono::Utc;
use tracing::{debug, warn};

use super::resolver::{ChainResolver, ChainTraversal};
use crate::error::StorageResult;
use crate::storage::{CachedChainStats, ChainCacheEntry, SqliteStorage, Storage};

/// Lazily populated per-session chain metadata.
#[derive(Clone)]
pub struct MetadataCache {
    storage: SqliteStorage,
    resolver: ChainResolver,
}

impl MetadataCache {
    /// Create a cache over the given storage.
    pub fn new(storage: SqliteStorage, resolver: ChainResolver) -> Self {
        Self { storage, resolver }
    }

    /// Cached entry for `id`, computed and stored on a miss.
    pub async fn get(&self, id: &str) -> StorageResult<ChainCacheEntry> {
        if let Some(entry) = self.storage.get_cache_entry(id).await? {
            return Ok(entry);
        }

        let epoch = self.storage.cache_epoch().await?;
        let entry = self.compute(id).await?;
        self.store(std::slice::from_ref(&entry), epoch).await;

        Ok(entry)
    }

    /// Compute an entry from the edges without touching the cache.
    pub async fn compute(&self, id: &str) -> StorageResult<ChainCacheEntry> {
        let path = self.resolver.ancestor_path(id).await?;
        let root_id = path.last().cloned().unwrap_or_else(|| id.to_string());
        let depth_from_root = path.len().saturating_sub(1) as i64;

        let edge = self.storage.get_edge(id).await?;
        let child_count = self.storage.count_children(id).await?;

        Ok(ChainCacheEntry {
            session_id: id.to_string(),
            root_id,
            is_child: edge.is_some(),
            is_parent: child_count > 0,
            child_count,
            chain_position: edge.as_ref().map(|e| e.order).unwrap_or(0),
            is_active_continuation: edge.as_ref().is_some_and(|e| e.is_active_continuation),
            depth_from_root,
            has_multiple_children: child_count > 1,
            computed_at: Utc::now(),
        })
    }

    /// Drop the entries for `id`, its parent, and its whole chain.
    pub async fn invalidate(&self, id: &str) -> StorageResult<u64> {
        self.storage.invalidate_cache(id).await
    }

    /// Compute and store entries for the root of `id`'s chain and every descendant.
    ///
    /// Returns the number of entries stored (0 if an edge mutation raced the
    /// computation and the batch was discarded).
    pub async fn populate_chain(&self, root_id: &str) -> StorageResult<usize> {
        let epoch = self.storage.cache_epoch().await?;
        let root = self.resolver.find_root(root_id).await?;
        let traversal = self.resolver.traverse(&root).await?;
        self.store_traversal(&traversal, epoch).await
    }

    /// Store entries derived from an existing traversal.
    ///
    /// `epoch` must have been read before the traversal started. When the
    /// traversal root itself has a parent edge the chain is cyclic, and each
    /// member's root depends on where its own walk stops, so entries are
    /// computed one by one instead.
    pub async fn store_traversal(
        &self,
        traversal: &ChainTraversal,
        epoch: i64,
    ) -> StorageResult<usize> {
        let entries = if traversal.root_order.is_some() {
            let mut entries = Vec::with_capacity(traversal.members.len() + 1);
            entries.push(self.compute(&traversal.root_id).await?);
            for member in &traversal.members {
                entries.push(self.compute(&member.session_id).await?);
            }
            entries
        } else {
            entries_from_traversal(traversal)
        };

        if self.store(&entries, epoch).await {
            Ok(entries.len())
        } else {
            Ok(0)
        }
    }

    /// Aggregate over the cached entries of a chain; `None` if never cached.
    pub async fn chain_stats(&self, root_id: &str) -> StorageResult<Option<CachedChainStats>> {
        self.storage.cached_chain_stats(root_id).await
    }

    async fn store(&self, entries: &[ChainCacheEntry], epoch: i64) -> bool {
        match self.storage.put_cache_entries(entries, epoch).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(count = entries.len(), "Chain changed during computation; not caching");
                false
            }
            Err(e) => {
                // Only latency suffers: the next read recomputes
                warn!(error = %e, count = entries.len(), "Failed to write chain cache");
                false
            }
        }
    }
}

/// One cache entry per session of a traversal, root first.
pub fn entries_from_traversal(traversal: &ChainTraversal) -> Vec<ChainCacheEntry> {
    let now = Utc::now();
    let root_id = &traversal.root_id;

    let entry = |session_id: &str,
                 position: Option<(i64, bool)>,
                 depth: i64|
     -> ChainCacheEntry {
        let child_count = traversal.child_count(session_id) as i64;
        ChainCacheEntry {
            session_id: session_id.to_string(),
            root_id: root_id.clone(),
            is_child: position.is_some(),
            is_parent: child_count > 0,
            child_count,
            chain_position: position.map(|(order, _)| order).unwrap_or(0),
            is_active_continuation: position.is_some_and(|(_, active)| active),
            depth_from_root: depth,
            has_multiple_children: child_count > 1,
            computed_at: now,
        }
    };

    let mut entries = Vec::with_capacity(traversal.members.len() + 1);
    entries.push(entry(root_id, traversal.root_order, 0));
    for member in &traversal.members {
        entries.push(entry(
            &member.session_id,
            Some((member.order, member.is_active_continuation)),
            member.depth,
        ));
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const R: &str = "a0000000-0000-4000-8000-000000000000";
    const A: &str = "b0000000-0000-4000-8000-000000000000";
    const B: &str = "c0000000-0000-4000-8000-000000000000";
    const C: &str = "d0000000-0000-4000-8000-000000000000";

    async fn cache() -> (SqliteStorage, MetadataCache) {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let resolver = ChainResolver::new(storage.clone());
        (storage.clone(), MetadataCache::new(storage, resolver))
    }

    #[tokio::test]
    async fn test_get_computes_and_stores_on_miss() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, A, None).await.unwrap();

        let entry = cache.get(B).await.unwrap();

        assert_eq!(entry.root_id, R);
        assert_eq!(entry.depth_from_root, 2);
        assert!(entry.is_child);
        assert!(!entry.is_parent);
        assert_eq!(entry.chain_position, 1);
        assert!(entry.is_active_continuation);
        assert!(storage.get_cache_entry(B).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_root_entry() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, R, None).await.unwrap();

        let entry = cache.get(R).await.unwrap();

        assert_eq!(entry.root_id, R);
        assert_eq!(entry.depth_from_root, 0);
        assert!(!entry.is_child);
        assert_eq!(entry.chain_position, 0);
        assert_eq!(entry.child_count, 2);
        assert!(entry.has_multiple_children);
    }

    #[tokio::test]
    async fn test_new_edge_invalidates_whole_chain() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, A, None).await.unwrap();
        assert_eq!(cache.populate_chain(R).await.unwrap(), 3);

        storage.upsert_edge(C, A, None).await.unwrap();

        for id in [R, A, B] {
            assert!(
                storage.get_cache_entry(id).await.unwrap().is_none(),
                "entry for {} should be gone",
                id
            );
        }
        assert!(cache.chain_stats(R).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reparenting_a_root_invalidates_its_subtree() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(B, A, None).await.unwrap();
        cache.populate_chain(A).await.unwrap();
        assert_eq!(storage.get_cache_entry(B).await.unwrap().unwrap().root_id, A);

        // A's old chain gets a new root above it
        storage.upsert_edge(A, R, None).await.unwrap();

        assert!(storage.get_cache_entry(B).await.unwrap().is_none());
        let entry = cache.get(B).await.unwrap();
        assert_eq!(entry.root_id, R);
        assert_eq!(entry.depth_from_root, 2);
    }

    #[tokio::test]
    async fn test_populated_depths_match_ancestor_walk() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, A, None).await.unwrap();
        storage.upsert_edge(C, R, None).await.unwrap();

        cache.populate_chain(B).await.unwrap();

        for id in [R, A, B, C] {
            let cached = storage.get_cache_entry(id).await.unwrap().unwrap();
            let computed = cache.compute(id).await.unwrap();
            assert_eq!(cached.depth_from_root, computed.depth_from_root);
            assert_eq!(cached.root_id, computed.root_id);
            assert_eq!(cached.child_count, computed.child_count);
            assert_eq!(cached.chain_position, computed.chain_position);
            assert_eq!(
                cached.is_active_continuation,
                computed.is_active_continuation
            );
        }
    }

    #[tokio::test]
    async fn test_populated_cycle_matches_lazy_entries() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, A, None).await.unwrap();
        storage.upsert_edge(R, B, None).await.unwrap();

        let lazy: Vec<ChainCacheEntry> = {
            let mut out = Vec::new();
            for id in [R, A, B] {
                out.push(cache.compute(id).await.unwrap());
            }
            out
        };

        assert_eq!(cache.populate_chain(R).await.unwrap(), 3);

        for computed in lazy {
            let cached = storage
                .get_cache_entry(&computed.session_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(cached.root_id, computed.root_id);
            assert_eq!(cached.depth_from_root, computed.depth_from_root);
            assert_eq!(cached.child_count, computed.child_count);
        }
    }

    #[tokio::test]
    async fn test_invalidate_drops_chain_entries() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, A, None).await.unwrap();
        storage.upsert_edge(C, R, None).await.unwrap();
        assert_eq!(cache.populate_chain(R).await.unwrap(), 4);

        let removed = cache.invalidate(B).await.unwrap();

        assert_eq!(removed, 4);
        for id in [R, A, B, C] {
            assert!(storage.get_cache_entry(id).await.unwrap().is_none());
        }
        assert!(cache.chain_stats(R).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chain_stats_after_population() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();
        storage.upsert_edge(B, R, None).await.unwrap();
        storage.upsert_edge(C, B, None).await.unwrap();

        assert!(cache.chain_stats(R).await.unwrap().is_none());
        cache.populate_chain(R).await.unwrap();

        let stats = cache.chain_stats(R).await.unwrap().unwrap();
        assert_eq!(stats.session_count, 4);
        assert_eq!(stats.max_depth, 2);
        assert!(stats.has_branches);
    }

    #[tokio::test]
    async fn test_stale_epoch_write_is_discarded() {
        let (storage, cache) = cache().await;
        storage.upsert_edge(A, R, None).await.unwrap();

        let epoch = storage.cache_epoch().await.unwrap();
        let entry = cache.compute(A).await.unwrap();
        storage.upsert_edge(B, R, None).await.unwrap();

        let stored = storage.put_cache_entries(&[entry], epoch).await.unwrap();
        assert!(!stored);
        assert!(storage.get_cache_entry(A).await.unwrap().is_none());
    }
}
