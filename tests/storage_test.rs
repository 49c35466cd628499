//! Integration tests for SQLite storage layer
//!
//! Tests edge, catalog and cache operations using an in-memory SQLite database.

use chrono::{DateTime, Utc};

use session_chains::storage::{
    ChainCacheEntry, EdgeUpsert, SessionCatalog, SessionRecord, SqliteStorage, Storage,
};

const P: &str = "66666666-0000-4000-8000-000000000001";
const Q: &str = "66666666-0000-4000-8000-000000000002";
const A: &str = "66666666-0000-4000-8000-000000000003";
const B: &str = "66666666-0000-4000-8000-000000000004";
const C: &str = "66666666-0000-4000-8000-000000000005";

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

async fn register(storage: &SqliteStorage, id: &str) -> bool {
    storage
        .register_session(&SessionRecord::new(id, format!("/sessions/{}.jsonl", id)))
        .await
        .unwrap()
}

fn at(s: &str) -> Option<DateTime<Utc>> {
    Some(DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc))
}

fn cache_entry(session_id: &str, root_id: &str, depth: i64) -> ChainCacheEntry {
    ChainCacheEntry {
        session_id: session_id.to_string(),
        root_id: root_id.to_string(),
        is_child: depth > 0,
        is_parent: false,
        child_count: 0,
        chain_position: depth,
        is_active_continuation: depth > 0,
        depth_from_root: depth,
        has_multiple_children: false,
        computed_at: Utc::now(),
    }
}

#[cfg(test)]
mod edge_tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_assigns_increasing_orders() {
        let storage = create_test_storage().await;

        let first = storage.upsert_edge(A, P, None).await.unwrap();
        let second = storage.upsert_edge(B, P, None).await.unwrap();

        assert_eq!(first, EdgeUpsert::Inserted { order: 1 });
        assert_eq!(second, EdgeUpsert::Inserted { order: 2 });

        let children = storage.get_children(P).await.unwrap();
        let ids: Vec<&str> = children.iter().map(|e| e.child_id.as_str()).collect();
        assert_eq!(ids, vec![A, B]);
        assert!(!children[0].is_active_continuation);
        assert!(children[1].is_active_continuation);
    }

    #[tokio::test]
    async fn test_exactly_one_active_child() {
        let storage = create_test_storage().await;
        for child in [A, B, C] {
            storage.upsert_edge(child, P, None).await.unwrap();
        }

        let active: Vec<String> = storage
            .get_children(P)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.is_active_continuation)
            .map(|e| e.child_id)
            .collect();

        assert_eq!(active, vec![C.to_string()]);
        assert_eq!(storage.count_children(P).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_repeat_upsert_refreshes_without_reordering() {
        let storage = create_test_storage().await;
        storage.upsert_edge(A, P, None).await.unwrap();
        storage.upsert_edge(B, P, None).await.unwrap();

        let outcome = storage
            .upsert_edge(A, P, at("2025-03-01T10:00:00Z"))
            .await
            .unwrap();

        assert_eq!(outcome, EdgeUpsert::Refreshed);
        assert!(!outcome.is_new());
        let edge = storage.get_edge(A).await.unwrap().unwrap();
        assert_eq!(edge.order, 1);
        assert!(!edge.is_active_continuation);
        assert_eq!(edge.child_started_at, at("2025-03-01T10:00:00Z"));
        assert_eq!(storage.list_edges().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_keeps_known_start_time() {
        let storage = create_test_storage().await;
        storage
            .upsert_edge(A, P, at("2025-03-01T10:00:00Z"))
            .await
            .unwrap();

        storage.upsert_edge(A, P, None).await.unwrap();

        let edge = storage.get_edge(A).await.unwrap().unwrap();
        assert_eq!(edge.child_started_at, at("2025-03-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_reparent_moves_child_and_promotes_sibling() {
        let storage = create_test_storage().await;
        storage.upsert_edge(A, P, None).await.unwrap();
        storage.upsert_edge(B, P, None).await.unwrap();
        storage.upsert_edge(C, Q, None).await.unwrap();

        let outcome = storage.upsert_edge(B, Q, None).await.unwrap();

        assert_eq!(
            outcome,
            EdgeUpsert::Reparented {
                previous_parent: P.to_string(),
                order: 2,
            }
        );
        let moved = storage.get_edge(B).await.unwrap().unwrap();
        assert_eq!(moved.parent_id, Q);
        assert!(moved.is_active_continuation);
        assert!(!storage.get_edge(C).await.unwrap().unwrap().is_active_continuation);
        // P lost its active child; the remaining one takes over
        assert!(storage.get_edge(A).await.unwrap().unwrap().is_active_continuation);
    }

    #[tokio::test]
    async fn test_self_continuation_rejected() {
        let storage = create_test_storage().await;

        assert!(storage.upsert_edge(A, A, None).await.is_err());
        assert!(storage.get_edge(A).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edge_to_unknown_parent_is_orphaned() {
        let storage = create_test_storage().await;
        register(&storage, P).await;

        storage.upsert_edge(A, P, None).await.unwrap();
        storage.upsert_edge(B, Q, None).await.unwrap();

        assert!(!storage.get_edge(A).await.unwrap().unwrap().is_orphaned);
        assert!(storage.get_edge(B).await.unwrap().unwrap().is_orphaned);

        let orphans = storage.list_orphaned_edges().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].child_id, B);
    }
}

#[cfg(test)]
mod catalog_tests {
    use super::*;

    #[tokio::test]
    async fn test_register_session_reports_new() {
        let storage = create_test_storage().await;

        assert!(register(&storage, P).await);
        assert!(!register(&storage, P).await);

        assert!(storage.session_exists(P).await.unwrap());
        let file = storage.session_file(P).await.unwrap().unwrap();
        assert!(file.ends_with(format!("{}.jsonl", P)));
        assert_eq!(storage.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let storage = create_test_storage().await;

        assert!(!storage.session_exists(P).await.unwrap());
        assert!(storage.session_file(P).await.unwrap().is_none());
        assert!(!storage.forget_session(P).await.unwrap());
    }

    #[tokio::test]
    async fn test_forget_parent_orphans_children() {
        let storage = create_test_storage().await;
        register(&storage, P).await;
        storage.upsert_edge(A, P, None).await.unwrap();
        storage.upsert_edge(B, P, None).await.unwrap();

        assert!(storage.forget_session(P).await.unwrap());

        for child in [A, B] {
            let edge = storage.get_edge(child).await.unwrap().unwrap();
            assert!(edge.is_orphaned);
            assert_eq!(edge.parent_id, P);
        }
    }

    #[tokio::test]
    async fn test_register_parent_clears_orphan_flag() {
        let storage = create_test_storage().await;
        storage.upsert_edge(A, P, None).await.unwrap();
        assert!(storage.get_edge(A).await.unwrap().unwrap().is_orphaned);

        register(&storage, P).await;

        let edge = storage.get_edge(A).await.unwrap().unwrap();
        assert!(!edge.is_orphaned);
        assert_eq!(edge.order, 1);
        assert!(edge.is_active_continuation);
    }

    #[tokio::test]
    async fn test_session_created_hook_heals_and_invalidates() {
        let storage = create_test_storage().await;
        storage.upsert_edge(A, P, None).await.unwrap();
        storage.upsert_edge(B, P, None).await.unwrap();
        storage.upsert_edge(C, A, None).await.unwrap();
        let epoch = storage.cache_epoch().await.unwrap();
        storage
            .put_cache_entries(
                &[cache_entry(P, P, 0), cache_entry(A, P, 1), cache_entry(C, P, 2)],
                epoch,
            )
            .await
            .unwrap();

        let healed = storage.on_session_created(P).await.unwrap();

        assert_eq!(healed, 2);
        for child in [A, B] {
            let edge = storage.get_edge(child).await.unwrap().unwrap();
            assert!(!edge.is_orphaned);
            assert_eq!(edge.parent_id, P);
        }
        // C's parent A is still unregistered
        assert!(storage.get_edge(C).await.unwrap().unwrap().is_orphaned);
        assert_eq!(storage.count_cache_entries().await.unwrap(), 0);
        assert!(storage.cache_epoch().await.unwrap() > epoch);
    }

    #[tokio::test]
    async fn test_session_created_hook_without_orphans_is_noop() {
        let storage = create_test_storage().await;
        let epoch = storage.cache_epoch().await.unwrap();
        storage
            .put_cache_entries(&[cache_entry(Q, Q, 0)], epoch)
            .await
            .unwrap();

        assert_eq!(storage.on_session_created(Q).await.unwrap(), 0);
        assert_eq!(storage.count_cache_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_deleted_hook_removes_own_edge() {
        let storage = create_test_storage().await;
        register(&storage, B).await;
        storage.upsert_edge(A, P, None).await.unwrap();
        storage.upsert_edge(B, P, None).await.unwrap();
        storage.upsert_edge(C, B, None).await.unwrap();

        let removal = storage.on_session_deleted(B).await.unwrap();

        assert!(removal.removed_edge);
        assert_eq!(removal.orphaned_edges, 1);
        assert!(storage.get_edge(B).await.unwrap().is_none());
        assert!(storage.get_edge(C).await.unwrap().unwrap().is_orphaned);
        assert!(storage.get_edge(A).await.unwrap().unwrap().is_active_continuation);
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get_entry() {
        let storage = create_test_storage().await;
        let epoch = storage.cache_epoch().await.unwrap();

        let stored = storage
            .put_cache_entries(&[cache_entry(P, P, 0), cache_entry(A, P, 1)], epoch)
            .await
            .unwrap();

        assert!(stored);
        let entry = storage.get_cache_entry(A).await.unwrap().unwrap();
        assert_eq!(entry.root_id, P);
        assert_eq!(entry.depth_from_root, 1);
        assert_eq!(storage.count_cache_entries().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_edge_mutation_bumps_epoch() {
        let storage = create_test_storage().await;
        let before = storage.cache_epoch().await.unwrap();

        storage.upsert_edge(A, P, None).await.unwrap();

        assert!(storage.cache_epoch().await.unwrap() > before);
    }

    #[tokio::test]
    async fn test_invalidate_cache_clears_chain() {
        let storage = create_test_storage().await;
        storage.upsert_edge(A, P, None).await.unwrap();
        let epoch = storage.cache_epoch().await.unwrap();
        storage
            .put_cache_entries(&[cache_entry(P, P, 0), cache_entry(A, P, 1)], epoch)
            .await
            .unwrap();

        let removed = storage.invalidate_cache(A).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(storage.count_cache_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cached_chain_stats() {
        let storage = create_test_storage().await;
        assert!(storage.cached_chain_stats(P).await.unwrap().is_none());

        let epoch = storage.cache_epoch().await.unwrap();
        let mut root = cache_entry(P, P, 0);
        root.has_multiple_children = true;
        storage
            .put_cache_entries(
                &[root, cache_entry(A, P, 1), cache_entry(B, P, 2)],
                epoch,
            )
            .await
            .unwrap();

        let stats = storage.cached_chain_stats(P).await.unwrap().unwrap();
        assert_eq!(stats.session_count, 3);
        assert_eq!(stats.max_depth, 2);
        assert!(stats.has_branches);
    }
}
