//! Orphan healing and its periodic scheduler.
//!
//! An edge is orphaned while its parent session is unknown. Healing re-reads
//! the child's transcript and only re-links the edge when the transcript still
//! names the same parent and that parent exists again; contradicting evidence
//! leaves the edge orphaned.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::detector;
use super::types::HealReport;
use super::ChainEngine;
use crate::error::{ChainError, StorageResult};
use crate::storage::{ContinuationEdge, SessionCatalog, SqliteStorage, Storage};

/// Re-checks orphaned edges and re-links those whose parent came back.
#[derive(Clone)]
pub struct OrphanHealer {
    storage: SqliteStorage,
}

enum HealOutcome {
    Healed,
    Unresolvable,
    Conflict,
    ParentMissing,
}

impl OrphanHealer {
    /// Create a healer over the given storage.
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Try to heal every orphaned edge, continuing past individual failures.
    pub async fn heal(&self) -> StorageResult<HealReport> {
        let orphans = self.storage.list_orphaned_edges().await?;
        let mut report = HealReport::default();

        for edge in &orphans {
            match self.heal_edge(edge).await {
                Ok(HealOutcome::Healed) => report.healed += 1,
                Ok(HealOutcome::Conflict) => {
                    report.conflicts += 1;
                    report.remaining += 1;
                }
                Ok(HealOutcome::Unresolvable | HealOutcome::ParentMissing) => {
                    report.remaining += 1
                }
                Err(e) => {
                    report.remaining += 1;
                    report.errors.push(format!("{}: {}", edge.child_id, e));
                }
            }
        }

        info!(
            orphans = orphans.len(),
            healed = report.healed,
            remaining = report.remaining,
            conflicts = report.conflicts,
            "Orphan healing pass complete"
        );

        Ok(report)
    }

    async fn heal_edge(&self, edge: &ContinuationEdge) -> Result<HealOutcome, String> {
        let path = match self.storage.session_file(&edge.child_id).await {
            Ok(Some(path)) => path,
            Ok(None) => return Ok(HealOutcome::Unresolvable),
            Err(e) => return Err(e.to_string()),
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(HealOutcome::Unresolvable);
        }

        let detection = detector::try_detect(&path)
            .await
            .map_err(|e| e.to_string())?;

        if detection.parent_id.as_deref() != Some(edge.parent_id.as_str()) {
            warn!(
                child_id = %edge.child_id,
                stored_parent = %edge.parent_id,
                detected_parent = ?detection.parent_id,
                "Transcript disagrees with stored parent; leaving edge orphaned"
            );
            return Ok(HealOutcome::Conflict);
        }

        let parent_known = self
            .storage
            .session_exists(&edge.parent_id)
            .await
            .map_err(|e| e.to_string())?;
        if !parent_known {
            return Ok(HealOutcome::ParentMissing);
        }

        self.storage
            .upsert_edge(&edge.child_id, &edge.parent_id, detection.child_started_at)
            .await
            .map_err(|e| e.to_string())?;

        debug!(child_id = %edge.child_id, parent_id = %edge.parent_id, "Orphaned edge healed");
        Ok(HealOutcome::Healed)
    }
}

/// Runs `heal_orphans` on a fixed period until stopped.
///
/// Owned by whoever starts the engine; nothing runs until `start` is called.
pub struct HealerScheduler {
    engine: ChainEngine,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl HealerScheduler {
    /// Create a stopped scheduler.
    pub fn new(engine: ChainEngine) -> Self {
        Self {
            engine,
            shutdown: None,
            handle: None,
        }
    }

    /// Whether the background task is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start healing every `period`. The first pass runs one period from now.
    pub fn start(&mut self, period: Duration) {
        if self.is_running() {
            warn!("Orphan healer already running; ignoring start");
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let engine = self.engine.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.heal_orphans().await {
                            Ok(report) => debug!(
                                healed = report.healed,
                                remaining = report.remaining,
                                "Scheduled orphan healing finished"
                            ),
                            Err(ChainError::ScanInProgress { operation }) => {
                                debug!(operation = %operation, "Skipping scheduled heal; scan in flight")
                            }
                            Err(e) => warn!(error = %e, "Scheduled orphan healing failed"),
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Orphan healer stopped");
        });

        info!(interval_secs = period.as_secs(), "Orphan healer started");
        self.shutdown = Some(tx);
        self.handle = Some(handle);
    }

    /// Stop the background task and wait for an in-progress pass to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Orphan healer task ended abnormally");
            }
        }
    }
}

impl Drop for HealerScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
