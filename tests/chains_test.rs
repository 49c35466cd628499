//! End-to-end tests for continuation chains.
//!
//! Transcripts are written to a temporary projects directory, synced into an
//! in-memory catalog, and scanned through the engine.

use std::io::Write;
use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use session_chains::chains::ChainEngine;
use session_chains::discovery::sync_catalog;
use session_chains::storage::{ContinuationEdge, SessionCatalog, SqliteStorage, Storage};

const P1: &str = "5e551011-0000-4000-8000-000000000001";
const C1: &str = "5e551011-0000-4000-8000-000000000002";
const C2: &str = "5e551011-0000-4000-8000-000000000003";
const G1: &str = "5e551011-0000-4000-8000-000000000004";

struct Fixture {
    root: TempDir,
    storage: SqliteStorage,
    engine: ChainEngine,
}

impl Fixture {
    async fn new() -> Self {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("project")).unwrap();
        let storage = SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage");
        let engine = ChainEngine::new(storage.clone(), 4);
        Self {
            root,
            storage,
            engine,
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.path().join("project").join(format!("{}.jsonl", id))
    }

    /// A plain transcript with no compaction boundary.
    fn write_plain(&self, id: &str) {
        let mut file = std::fs::File::create(self.path(id)).unwrap();
        let line = serde_json::json!({
            "type": "user",
            "sessionId": id,
            "timestamp": "2025-03-01T09:00:00Z",
            "message": { "role": "user", "content": "hello" },
        });
        writeln!(file, "{}", line).unwrap();
    }

    /// A transcript that starts by continuing `parent`.
    fn write_child(&self, id: &str, parent: &str, at: &str) {
        let mut file = std::fs::File::create(self.path(id)).unwrap();
        let boundary = serde_json::json!({
            "type": "system",
            "subtype": "compact_boundary",
            "sessionId": parent,
            "timestamp": at,
            "content": format!("Continuing in new session: {}", id),
        });
        let user = serde_json::json!({
            "type": "user",
            "sessionId": id,
            "timestamp": at,
            "message": { "role": "user", "content": "carry on" },
        });
        writeln!(file, "{}", boundary).unwrap();
        writeln!(file, "{}", user).unwrap();
    }

    async fn sync(&self) {
        sync_catalog(&self.storage, self.root.path()).await.unwrap();
    }

    async fn edge(&self, child: &str) -> ContinuationEdge {
        self.storage
            .get_edge(child)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("missing edge for {}", child))
    }
}

fn edge_shape(edges: &[ContinuationEdge]) -> Vec<(String, String, i64, bool, bool)> {
    let mut shape: Vec<_> = edges
        .iter()
        .map(|e| {
            (
                e.child_id.clone(),
                e.parent_id.clone(),
                e.order,
                e.is_active_continuation,
                e.is_orphaned,
            )
        })
        .collect();
    shape.sort();
    shape
}

#[tokio::test]
async fn test_end_to_end_single_continuation() {
    let fx = Fixture::new().await;
    fx.write_plain(P1);
    fx.write_child(C1, P1, "2025-03-01T10:00:00Z");
    fx.sync().await;

    let detection = fx.engine.detect(&fx.path(C1)).await;
    assert!(detection.is_child);
    assert_eq!(detection.parent_id.as_deref(), Some(P1));

    let report = fx.engine.resolve_all().await.unwrap();
    assert_eq!(report.total_scanned, 2);
    assert_eq!(report.continuations_found, 1);
    assert!(report.errors.is_empty());

    let edge = fx.edge(C1).await;
    assert_eq!(edge.parent_id, P1);
    assert_eq!(edge.order, 1);
    assert!(!edge.is_orphaned);

    let chain = fx.engine.get_chain(P1).await.unwrap();
    assert_eq!(chain.parent, P1);
    assert_eq!(chain.children, vec![C1.to_string()]);
    assert_eq!(chain.total_sessions, 2);
    assert_eq!(chain.max_depth, 1);
    assert!(!chain.has_branches);
}

#[tokio::test]
async fn test_find_root_of_child_is_parentless_parent() {
    let fx = Fixture::new().await;
    fx.storage.upsert_edge(C1, P1, None).await.unwrap();
    fx.storage.upsert_edge(G1, C1, None).await.unwrap();

    assert_eq!(fx.engine.get_root(C1).await.unwrap(), P1);
    assert_eq!(fx.engine.get_root(G1).await.unwrap(), P1);
    assert_eq!(fx.engine.get_root(P1).await.unwrap(), P1);
}

#[tokio::test]
async fn test_resolve_all_is_idempotent() {
    let fx = Fixture::new().await;
    fx.write_plain(P1);
    fx.write_child(C1, P1, "2025-03-01T10:00:00Z");
    fx.write_child(C2, P1, "2025-03-01T11:00:00Z");
    fx.write_child(G1, C2, "2025-03-01T12:00:00Z");
    fx.sync().await;

    let first = fx.engine.resolve_all().await.unwrap();
    let edges_first = edge_shape(&fx.storage.list_edges().await.unwrap());
    let cached_first = fx.storage.count_cache_entries().await.unwrap();

    let second = fx.engine.resolve_all().await.unwrap();
    let edges_second = edge_shape(&fx.storage.list_edges().await.unwrap());
    let cached_second = fx.storage.count_cache_entries().await.unwrap();

    assert_eq!(first.continuations_found, 3);
    assert_eq!(second.continuations_found, 3);
    assert_eq!(edges_first, edges_second);
    assert_eq!(cached_first, 4);
    assert_eq!(cached_first, cached_second);

    // Orders follow boundary time, the latest child is active
    assert_eq!(fx.edge(C1).await.order, 1);
    assert_eq!(fx.edge(C2).await.order, 2);
    assert!(!fx.edge(C1).await.is_active_continuation);
    assert!(fx.edge(C2).await.is_active_continuation);
}

#[tokio::test]
async fn test_cycle_safety() {
    let fx = Fixture::new().await;
    // C1 -> P1 -> G1 -> C1 (each pointing at its "parent")
    fx.storage.upsert_edge(C1, P1, None).await.unwrap();
    fx.storage.upsert_edge(P1, G1, None).await.unwrap();
    fx.storage.upsert_edge(G1, C1, None).await.unwrap();

    let root = fx.engine.get_root(C1).await.unwrap();
    assert!([P1, C1, G1].contains(&root.as_str()));

    let chain = fx.engine.get_chain(C1).await.unwrap();
    assert!(chain.total_sessions <= 3);

    let metadata = fx.engine.get_metadata(G1).await.unwrap();
    assert!([P1, C1, G1].contains(&metadata.root_id.as_str()));

    // Entries stored by the chain read agree with per-session computation
    for id in [P1, C1, G1] {
        let stored = fx.storage.get_cache_entry(id).await.unwrap().unwrap();
        let computed = fx.engine.cache().compute(id).await.unwrap();
        assert_eq!(stored.root_id, computed.root_id, "root of {}", id);
        assert_eq!(stored.depth_from_root, computed.depth_from_root, "depth of {}", id);
    }
}

#[tokio::test]
async fn test_branch_detection() {
    let fx = Fixture::new().await;
    fx.storage.upsert_edge(C1, P1, None).await.unwrap();
    fx.storage.upsert_edge(C2, P1, None).await.unwrap();

    let chain = fx.engine.resolver().build_chain(P1).await.unwrap();

    assert!(chain.has_branches);
    assert_eq!(chain.flat_descendants.len(), 2);
    let orders: Vec<i64> = chain.flat_descendants.iter().map(|m| m.order).collect();
    assert_eq!(orders, vec![1, 2]);
}

#[tokio::test]
async fn test_cache_coherence_after_new_edge() {
    let fx = Fixture::new().await;
    fx.storage.upsert_edge(C1, P1, None).await.unwrap();
    fx.storage.upsert_edge(G1, C1, None).await.unwrap();
    fx.engine.get_chain(P1).await.unwrap();
    assert!(fx.storage.get_cache_entry(G1).await.unwrap().is_some());

    fx.storage.upsert_edge(C2, P1, None).await.unwrap();

    for id in [P1, C1, G1] {
        assert!(
            fx.storage.get_cache_entry(id).await.unwrap().is_none(),
            "stale entry for {}",
            id
        );
    }

    let fresh = fx.engine.resolver().build_chain(P1).await.unwrap();
    for member in &fresh.flat_descendants {
        let metadata = fx.engine.get_metadata(&member.session_id).await.unwrap();
        assert_eq!(metadata.depth, member.depth, "depth of {}", member.session_id);
        assert_eq!(metadata.root_id, P1);
        assert_eq!(metadata.chain_position, member.order);
    }
    assert_eq!(fx.engine.get_metadata(P1).await.unwrap().child_count, 2);
}

#[tokio::test]
async fn test_orphan_lifecycle() {
    let fx = Fixture::new().await;
    fx.write_plain(P1);
    fx.write_child(C1, P1, "2025-03-01T10:00:00Z");
    fx.write_child(C2, P1, "2025-03-01T11:00:00Z");
    fx.sync().await;
    fx.engine.resolve_all().await.unwrap();

    let before: Vec<_> = vec![fx.edge(C1).await, fx.edge(C2).await];
    assert!(before.iter().all(|e| !e.is_orphaned));

    // Parent transcript disappears
    std::fs::remove_file(fx.path(P1)).unwrap();
    fx.sync().await;
    assert!(!fx.storage.session_exists(P1).await.unwrap());
    assert!(fx.edge(C1).await.is_orphaned);
    assert!(fx.edge(C2).await.is_orphaned);
    assert_eq!(fx.engine.get_stats().await.unwrap().orphaned_count, 2);

    // Parent comes back
    fx.write_plain(P1);
    fx.sync().await;
    let report = fx.engine.heal_orphans().await.unwrap();
    assert_eq!(report.remaining, 0);

    for old in &before {
        let healed = fx.edge(&old.child_id).await;
        assert!(!healed.is_orphaned);
        assert_eq!(healed.order, old.order);
        assert_eq!(healed.is_active_continuation, old.is_active_continuation);
    }
}

#[tokio::test]
async fn test_forgotten_child_promotes_sibling() {
    let fx = Fixture::new().await;
    fx.write_plain(P1);
    fx.write_child(C1, P1, "2025-03-01T10:00:00Z");
    fx.write_child(C2, P1, "2025-03-01T11:00:00Z");
    fx.sync().await;
    fx.engine.resolve_all().await.unwrap();

    assert!(fx.storage.forget_session(C2).await.unwrap());

    assert!(fx.storage.get_edge(C2).await.unwrap().is_none());
    assert!(fx.edge(C1).await.is_active_continuation);
    let chain = fx.engine.get_chain(P1).await.unwrap();
    assert_eq!(chain.children, vec![C1.to_string()]);
}

#[tokio::test]
async fn test_scan_reports_unreadable_transcripts() {
    let fx = Fixture::new().await;
    fx.write_plain(P1);
    fx.write_child(C1, P1, "2025-03-01T10:00:00Z");
    fx.sync().await;
    std::fs::remove_file(fx.path(P1)).unwrap();

    let report = fx.engine.resolve_all().await.unwrap();

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.continuations_found, 1);
}

#[tokio::test]
async fn test_detect_missing_file_is_empty() {
    let fx = Fixture::new().await;
    let missing: &Path = &fx.path(C1);

    let detection = fx.engine.detect(missing).await;

    assert!(!detection.is_child);
    assert!(!detection.is_parent);
    assert_eq!(detection.boundary_count, 0);
}
