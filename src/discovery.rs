//! Transcript discovery.
//!
//! Finds `<root>/<project>/<session-id>.jsonl` transcripts and keeps the
//! session catalog in step with the file system. Registering a session heals
//! edges that were waiting for it; forgetting one applies the deletion
//! cascade.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chains::detector::{is_valid_session_id, session_id_from_path};
use crate::error::{StorageError, StorageResult};
use crate::storage::{SessionCatalog, SessionRecord};

/// Outcome of synchronizing the catalog with the transcript directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Transcripts found on disk.
    pub discovered: usize,
    /// Sessions that were not known before.
    pub registered: usize,
    /// Known sessions whose transcript disappeared.
    pub removed: usize,
    /// Directories that could not be read; sessions under them were kept.
    pub unreadable: usize,
}

/// Transcripts found under a sessions root, plus the places the walk could not see.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Every transcript whose file stem is a session UUID.
    pub sessions: Vec<SessionRecord>,
    /// Directories (or entries) the walk failed to read.
    pub unreadable: Vec<PathBuf>,
    /// Set when a failure could not be tied to a path below the root.
    pub incomplete: bool,
}

impl Discovery {
    /// Whether a known session missing from `sessions` can safely be forgotten.
    ///
    /// A transcript under an unreadable directory may still exist.
    pub fn may_forget(&self, file_path: &Path) -> bool {
        !self.incomplete && !self.unreadable.iter().any(|dir| file_path.starts_with(dir))
    }
}

/// Walk `<root>/<project>/<session-id>.jsonl`.
pub fn discover_sessions(root: &Path) -> Discovery {
    let mut discovery = Discovery::default();

    for entry in WalkDir::new(root).min_depth(1).max_depth(2) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                match e.path().filter(|p| *p != root) {
                    Some(path) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Transcript directory unreadable"
                        );
                        discovery.unreadable.push(path.to_path_buf());
                    }
                    None => {
                        warn!(root = %root.display(), error = %e, "Sessions root unreadable");
                        discovery.incomplete = true;
                    }
                }
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("jsonl")
        {
            continue;
        }
        let Some(id) = session_id_from_path(path).filter(|id| is_valid_session_id(id)) else {
            continue;
        };

        let mut record = SessionRecord::new(id, path);
        if entry.depth() == 2 {
            if let Some(project) = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
            {
                record = record.with_project(project);
            }
        }
        discovery.sessions.push(record);
    }

    discovery
}

/// Register every transcript under `root` and forget sessions whose file is gone.
///
/// Removals are skipped when `root` itself is missing, so an unmounted
/// directory cannot wipe the catalog. Sessions under a directory the walk
/// failed to read are kept as well.
pub async fn sync_catalog<C>(catalog: &C, root: &Path) -> StorageResult<SyncReport>
where
    C: SessionCatalog + ?Sized,
{
    let root_buf: PathBuf = root.to_path_buf();
    let root_present = tokio::fs::try_exists(&root_buf).await.unwrap_or(false);

    let discovery = tokio::task::spawn_blocking(move || discover_sessions(&root_buf))
        .await
        .map_err(|e| StorageError::Query {
            message: format!("Transcript discovery task failed: {}", e),
        })?;

    let mut report = SyncReport {
        discovered: discovery.sessions.len(),
        unreadable: discovery.unreadable.len(),
        ..Default::default()
    };

    let found_ids: HashSet<&str> = discovery.sessions.iter().map(|s| s.id.as_str()).collect();
    for record in &discovery.sessions {
        if catalog.register_session(record).await? {
            report.registered += 1;
        }
    }

    if root_present {
        for known in catalog.list_sessions().await? {
            if found_ids.contains(known.id.as_str()) {
                continue;
            }
            if !discovery.may_forget(&known.file_path) {
                debug!(
                    session_id = %known.id,
                    "Transcript not seen but its directory was unreadable; keeping"
                );
                continue;
            }
            if catalog.forget_session(&known.id).await? {
                report.removed += 1;
            }
        }
    } else {
        warn!(root = %root.display(), "Sessions root missing; not removing known sessions");
    }

    info!(
        discovered = report.discovered,
        registered = report.registered,
        removed = report.removed,
        unreadable = report.unreadable,
        "Session catalog synchronized"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStorage, Storage};
    use tempfile::TempDir;

    const A: &str = "0a000000-0000-4000-8000-000000000000";
    const B: &str = "0b000000-0000-4000-8000-000000000000";

    fn touch(dir: &Path, name: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, "{}\n").unwrap();
        path
    }

    #[test]
    fn test_discover_sessions_filters_by_name() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("-home-me-proj");
        touch(&project, &format!("{}.jsonl", A));
        touch(&project, "notes.jsonl");
        touch(&project, &format!("{}.json", B));

        let found = discover_sessions(root.path()).sessions;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, A);
        assert_eq!(found[0].project.as_deref(), Some("-home-me-proj"));
    }

    #[test]
    fn test_unreadable_directory_blocks_forgetting_its_sessions() {
        let discovery = Discovery {
            unreadable: vec![PathBuf::from("/sessions/locked")],
            ..Default::default()
        };

        assert!(!discovery.may_forget(Path::new("/sessions/locked/a.jsonl")));
        assert!(discovery.may_forget(Path::new("/sessions/open/a.jsonl")));

        let incomplete = Discovery {
            incomplete: true,
            ..Default::default()
        };
        assert!(!incomplete.may_forget(Path::new("/sessions/open/a.jsonl")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_keeps_sessions_in_unreadable_project() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let locked = root.path().join("locked");
        touch(&locked, &format!("{}.jsonl", A));
        touch(&root.path().join("open"), &format!("{}.jsonl", B));

        let storage = SqliteStorage::new_in_memory().await.unwrap();
        sync_catalog(&storage, root.path()).await.unwrap();
        storage.upsert_edge(A, B, None).await.unwrap();

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        let readable = std::fs::read_dir(&locked).is_ok();
        let report = sync_catalog(&storage, root.path()).await.unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        if readable {
            // Permission bits are not enforced for this user (e.g. root)
            return;
        }
        assert_eq!(report.unreadable, 1);
        assert_eq!(report.removed, 0);
        assert!(storage.session_exists(A).await.unwrap());
        assert!(storage.get_edge(A).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_registers_and_forgets() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("proj");
        touch(&project, &format!("{}.jsonl", A));
        let b_path = touch(&project, &format!("{}.jsonl", B));

        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let report = sync_catalog(&storage, root.path()).await.unwrap();
        assert_eq!(report.registered, 2);
        assert!(storage.session_exists(B).await.unwrap());

        storage.upsert_edge(B, A, None).await.unwrap();
        std::fs::remove_file(b_path).unwrap();

        let report = sync_catalog(&storage, root.path()).await.unwrap();
        assert_eq!(report.registered, 0);
        assert_eq!(report.removed, 1);
        assert!(!storage.session_exists(B).await.unwrap());
        assert!(storage.get_edge(B).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_keeps_sessions_when_root_missing() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("proj");
        touch(&project, &format!("{}.jsonl", A));

        let storage = SqliteStorage::new_in_memory().await.unwrap();
        sync_catalog(&storage, root.path()).await.unwrap();

        let missing = root.path().join("does-not-exist");
        let report = sync_catalog(&storage, &missing).await.unwrap();

        assert_eq!(report.removed, 0);
        assert!(storage.session_exists(A).await.unwrap());
    }
}
