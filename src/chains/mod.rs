//! Continuation chain engine.
//!
//! Reconstructs logical conversations that were split across several
//! transcripts when a session hit its context limit and continued under a
//! new id.
//!
//! ```text
//! transcripts ─▶ detector ─▶ Storage (edges) ──invalidate──▶ chain cache
//!                                 │                              ▲
//!                                 ▼                              │
//!                             resolver ──────── populate ────────┘
//!                                 ▲
//!                 orphan healer ──┘ (re-detects, re-links)
//! ```
//!
//! [`ChainEngine`] is the facade consumed by the MCP handlers and the CLI.

pub mod cache;
pub mod detector;
pub mod healer;
pub mod resolver;
mod types;

pub use cache::MetadataCache;
pub use detector::{detect, is_valid_session_id, DetectionResult, Successor};
pub use healer::{HealerScheduler, OrphanHealer};
pub use resolver::{ChainResolver, ChainTraversal};
pub use types::*;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ChainError, ChainResult};
use crate::storage::{CachedChainStats, SessionCatalog, SqliteStorage, Storage};

/// Reject ids that do not look like session UUIDs before they reach storage.
pub fn validate_session_id(id: &str) -> ChainResult<()> {
    if is_valid_session_id(id) {
        Ok(())
    } else {
        Err(ChainError::InvalidSessionId {
            session_id: id.to_string(),
        })
    }
}

/// Flag held for the duration of a long-running scan.
///
/// Cleared on drop, so an early return or panic cannot leave it set.
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    /// Claim the flag, or report which operation is already running.
    pub fn try_acquire(flag: &Arc<AtomicBool>, operation: &str) -> ChainResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChainError::ScanInProgress {
                operation: operation.to_string(),
            })?;

        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedEdge {
    child_id: String,
    parent_id: String,
    started_at: Option<DateTime<Utc>>,
}

/// Entry point for every chain operation exposed to callers.
#[derive(Clone)]
pub struct ChainEngine {
    storage: SqliteStorage,
    resolver: ChainResolver,
    cache: MetadataCache,
    healer: OrphanHealer,
    scan_concurrency: usize,
    in_flight: Arc<AtomicBool>,
}

impl ChainEngine {
    /// Create an engine over `storage`, parsing at most `scan_concurrency`
    /// transcripts at once during a full scan.
    pub fn new(storage: SqliteStorage, scan_concurrency: usize) -> Self {
        let resolver = ChainResolver::new(storage.clone());
        let cache = MetadataCache::new(storage.clone(), resolver.clone());
        let healer = OrphanHealer::new(storage.clone());

        Self {
            storage,
            resolver,
            cache,
            healer,
            scan_concurrency: scan_concurrency.max(1),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// The metadata cache.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// The chain resolver.
    pub fn resolver(&self) -> &ChainResolver {
        &self.resolver
    }

    /// A stopped healer scheduler bound to this engine.
    pub fn scheduler(&self) -> HealerScheduler {
        HealerScheduler::new(self.clone())
    }

    /// Whether a full scan or healing pass is running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the in-flight flag for a long-running `operation`.
    ///
    /// Fails with [`ChainError::ScanInProgress`] while another holder is alive.
    pub fn claim(&self, operation: &str) -> ChainResult<InFlightGuard> {
        InFlightGuard::try_acquire(&self.in_flight, operation)
    }

    /// Run the detector on one transcript.
    pub async fn detect(&self, path: &Path) -> DetectionResult {
        detect(path).await
    }

    /// Root of the chain containing `id`.
    pub async fn get_root(&self, id: &str) -> ChainResult<String> {
        validate_session_id(id)?;
        Ok(self.resolver.find_root(id).await?)
    }

    /// The whole chain containing `id`, from any entry point.
    ///
    /// Also fills the cache for the chain, since callers display it next.
    pub async fn get_chain(&self, id: &str) -> ChainResult<ChainView> {
        validate_session_id(id)?;

        let epoch = self.storage.cache_epoch().await?;
        let root = self.resolver.find_root(id).await?;
        let traversal = self.resolver.traverse(&root).await?;
        let cached = self.cache.store_traversal(&traversal, epoch).await?;

        debug!(session_id = %id, root_id = %root, cached, "Chain resolved");
        Ok(traversal.into_view())
    }

    /// Chain metadata for one session.
    pub async fn get_metadata(&self, id: &str) -> ChainResult<ChainMetadata> {
        validate_session_id(id)?;
        Ok(self.cache.get(id).await?.into())
    }

    /// Aggregates over a chain's cached entries; `None` if it was never cached.
    pub async fn cached_chain_stats(&self, root_id: &str) -> ChainResult<Option<CachedChainStats>> {
        validate_session_id(root_id)?;
        Ok(self.cache.chain_stats(root_id).await?)
    }

    /// Totals across every stored chain.
    pub async fn get_stats(&self) -> ChainResult<EngineStats> {
        let edges = self.storage.list_edges().await?;

        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut child_ids: HashSet<&str> = HashSet::new();
        for edge in &edges {
            children
                .entry(edge.parent_id.as_str())
                .or_default()
                .push(edge.child_id.as_str());
            child_ids.insert(edge.child_id.as_str());
        }

        let roots: BTreeSet<&str> = edges
            .iter()
            .map(|e| e.parent_id.as_str())
            .filter(|p| !child_ids.contains(p))
            .collect();

        let mut max_depth = 0i64;
        let mut chained_sessions = 0usize;
        for &root in &roots {
            let mut visited: HashSet<&str> = HashSet::new();
            visited.insert(root);
            let mut queue: VecDeque<(&str, i64)> = VecDeque::new();
            queue.push_back((root, 0));

            while let Some((node, depth)) = queue.pop_front() {
                max_depth = max_depth.max(depth);
                for &child in children.get(node).map(Vec::as_slice).unwrap_or_default() {
                    if visited.insert(child) {
                        queue.push_back((child, depth + 1));
                    }
                }
            }
            chained_sessions += visited.len();
        }

        let total_chains = roots.len();
        let average_chain_length = if total_chains == 0 {
            0.0
        } else {
            chained_sessions as f64 / total_chains as f64
        };

        Ok(EngineStats {
            total_chains,
            total_relationships: edges.len(),
            max_depth,
            orphaned_count: edges.iter().filter(|e| e.is_orphaned).count(),
            average_chain_length,
        })
    }

    /// Detect continuations in every known transcript and store them.
    ///
    /// Detection fans out across transcripts; the resulting edges are written
    /// back sequentially in start-time order so per-parent orders follow
    /// creation time. Item failures are collected, never fatal.
    pub async fn resolve_all(&self) -> ChainResult<ResolveReport> {
        let _guard = self.claim("full scan")?;

        let sessions = self.storage.list_sessions().await?;
        let mut report = ResolveReport {
            total_scanned: sessions.len(),
            ..Default::default()
        };
        info!(sessions = sessions.len(), "Starting continuation scan");

        let semaphore = Arc::new(Semaphore::new(self.scan_concurrency));
        let mut tasks = JoinSet::new();
        for session in sessions {
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = detector::try_detect(&session.file_path).await;
                (session.id, result)
            });
        }

        let mut detections = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(detection))) => detections.push(detection),
                Ok((id, Err(e))) => {
                    warn!(session_id = %id, error = %e, "Detection failed");
                    report.errors.push(format!("{}: {}", id, e));
                }
                Err(e) => report.errors.push(format!("detection task failed: {}", e)),
            }
        }

        let planned = plan_edges(&detections);
        let mut touched = Vec::new();
        for edge in &planned {
            match self
                .storage
                .upsert_edge(&edge.child_id, &edge.parent_id, edge.started_at)
                .await
            {
                Ok(_) => {
                    report.continuations_found += 1;
                    touched.push(edge.child_id.as_str());
                }
                Err(e) => report.errors.push(format!("{}: {}", edge.child_id, e)),
            }
        }

        let mut roots = BTreeSet::new();
        for id in touched {
            match self.resolver.find_root(id).await {
                Ok(root) => {
                    roots.insert(root);
                }
                Err(e) => report.errors.push(format!("{}: {}", id, e)),
            }
        }
        for root in &roots {
            match self.cache.populate_chain(root).await {
                Ok(count) => report.cached_count += count,
                Err(e) => report.errors.push(format!("{}: {}", root, e)),
            }
        }

        report.orphans = self.storage.list_orphaned_edges().await?.len();

        info!(
            scanned = report.total_scanned,
            continuations = report.continuations_found,
            orphans = report.orphans,
            cached = report.cached_count,
            errors = report.errors.len(),
            "Continuation scan complete"
        );

        Ok(report)
    }

    /// Re-check orphaned edges and re-link those whose parent is back.
    pub async fn heal_orphans(&self) -> ChainResult<HealReport> {
        let _guard = self.claim("orphan heal")?;
        Ok(self.healer.heal().await?)
    }
}

/// Turn detections into edges, child-side evidence first.
///
/// A child's own transcript is authoritative for its parent; a parent naming
/// a successor only contributes an edge the successor did not report itself.
fn plan_edges(detections: &[DetectionResult]) -> Vec<PlannedEdge> {
    let mut planned: HashMap<String, PlannedEdge> = HashMap::new();

    for detection in detections {
        let Some(parent_id) = detection.parent_id.as_deref() else {
            continue;
        };
        if !detection.is_child
            || !is_valid_session_id(&detection.session_id)
            || !is_valid_session_id(parent_id)
            || detection.session_id.eq_ignore_ascii_case(parent_id)
        {
            continue;
        }
        planned.insert(
            detection.session_id.clone(),
            PlannedEdge {
                child_id: detection.session_id.clone(),
                parent_id: parent_id.to_string(),
                started_at: detection.child_started_at,
            },
        );
    }

    for detection in detections {
        if !is_valid_session_id(&detection.session_id) {
            continue;
        }
        for successor in &detection.successors {
            planned
                .entry(successor.session_id.clone())
                .or_insert_with(|| PlannedEdge {
                    child_id: successor.session_id.clone(),
                    parent_id: detection.session_id.clone(),
                    started_at: successor.boundary_at,
                });
        }
    }

    let mut edges: Vec<PlannedEdge> = planned.into_values().collect();
    // Undated edges last; ties broken by id for a stable order
    edges.sort_by(|a, b| {
        (a.started_at.is_none(), a.started_at, &a.child_id).cmp(&(
            b.started_at.is_none(),
            b.started_at,
            &b.child_id,
        ))
    });
    edges
}
