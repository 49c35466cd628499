use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use super::{
    CachedChainStats, ChainCacheEntry, ContinuationEdge, EdgeUpsert, SessionCatalog,
    SessionRecord, SessionRemoval, Storage,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const EDGE_COLUMNS: &str = "child_id, parent_id, continuation_order, child_started_at, \
     is_active_continuation, is_orphaned, detected_at, updated_at";

const CACHE_COLUMNS: &str = "session_id, root_id, is_child, is_parent, child_count, \
     chain_position, is_active_continuation, depth_from_root, has_multiple_children, computed_at";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory database on a single pinned connection
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_edge(
        &self,
        child_id: &str,
        parent_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> StorageResult<EdgeUpsert> {
        if child_id == parent_id {
            return Err(StorageError::Query {
                message: format!("Session {} cannot continue itself", child_id),
            });
        }

        let mut tx = self.pool.begin().await?;

        let parent_known = session_known(&mut tx, parent_id).await?;
        let existing = fetch_edge(&mut tx, child_id).await?;
        let old_root = edge_root(&mut tx, child_id).await?;
        let now = Utc::now().to_rfc3339();
        let started = started_at.map(|t| t.to_rfc3339());

        let outcome = match existing {
            Some(edge) if edge.parent_id == parent_id => {
                sqlx::query(
                    r#"
                    UPDATE session_continuations
                    SET child_started_at = COALESCE(?, child_started_at),
                        is_orphaned = ?,
                        updated_at = ?
                    WHERE child_id = ?
                    "#,
                )
                .bind(&started)
                .bind(!parent_known)
                .bind(&now)
                .bind(child_id)
                .execute(&mut *tx)
                .await?;

                EdgeUpsert::Refreshed
            }
            previous => {
                let order: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COALESCE(MAX(continuation_order), 0) + 1
                    FROM session_continuations
                    WHERE parent_id = ?
                    "#,
                )
                .bind(parent_id)
                .fetch_one(&mut *tx)
                .await?;

                // Most recent branch becomes the default continuation
                sqlx::query(
                    r#"
                    UPDATE session_continuations
                    SET is_active_continuation = 0
                    WHERE parent_id = ? AND is_active_continuation = 1
                    "#,
                )
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO session_continuations
                        (child_id, parent_id, continuation_order, child_started_at,
                         is_active_continuation, is_orphaned, detected_at, updated_at)
                    VALUES (?, ?, ?, ?, 1, ?, ?, ?)
                    ON CONFLICT(child_id) DO UPDATE SET
                        parent_id = excluded.parent_id,
                        continuation_order = excluded.continuation_order,
                        child_started_at = COALESCE(excluded.child_started_at, child_started_at),
                        is_active_continuation = 1,
                        is_orphaned = excluded.is_orphaned,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(child_id)
                .bind(parent_id)
                .bind(order)
                .bind(&started)
                .bind(!parent_known)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;

                match previous {
                    Some(edge) => {
                        promote_latest_child(&mut tx, &edge.parent_id).await?;
                        EdgeUpsert::Reparented {
                            previous_parent: edge.parent_id,
                            order,
                        }
                    }
                    None => EdgeUpsert::Inserted { order },
                }
            }
        };

        let mut touched = vec![child_id.to_string(), parent_id.to_string(), old_root];
        if let EdgeUpsert::Reparented {
            previous_parent, ..
        } = &outcome
        {
            touched.push(previous_parent.clone());
        }
        let invalidated = invalidate_chains(&mut tx, &touched).await?;

        tx.commit().await?;

        debug!(
            child_id = %child_id,
            parent_id = %parent_id,
            orphaned = !parent_known,
            outcome = ?outcome,
            invalidated,
            "Continuation edge upserted"
        );

        Ok(outcome)
    }

    async fn get_edge(&self, child_id: &str) -> StorageResult<Option<ContinuationEdge>> {
        let mut conn = self.pool.acquire().await?;
        let row = fetch_edge(&mut conn, child_id).await?;
        Ok(row.map(|r| r.into()))
    }

    async fn get_children(&self, parent_id: &str) -> StorageResult<Vec<ContinuationEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM session_continuations WHERE parent_id = ? \
             ORDER BY continuation_order ASC, child_id ASC",
            EDGE_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn count_children(&self, parent_id: &str) -> StorageResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM session_continuations WHERE parent_id = ?")
                .bind(parent_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn list_edges(&self) -> StorageResult<Vec<ContinuationEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM session_continuations ORDER BY parent_id ASC, continuation_order ASC",
            EDGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn list_orphaned_edges(&self) -> StorageResult<Vec<ContinuationEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM session_continuations WHERE is_orphaned = 1 \
             ORDER BY parent_id ASC, continuation_order ASC",
            EDGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn on_session_deleted(&self, id: &str) -> StorageResult<SessionRemoval> {
        let mut tx = self.pool.begin().await?;
        let removal = cascade_session_deleted(&mut tx, id).await?;
        tx.commit().await?;
        Ok(removal)
    }

    async fn on_session_created(&self, id: &str) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let healed = heal_session_created(&mut tx, id).await?;
        tx.commit().await?;
        Ok(healed)
    }

    async fn cache_epoch(&self) -> StorageResult<i64> {
        let epoch: i64 = sqlx::query_scalar("SELECT epoch FROM chain_cache_epoch WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;

        Ok(epoch)
    }

    async fn get_cache_entry(&self, session_id: &str) -> StorageResult<Option<ChainCacheEntry>> {
        let row: Option<CacheRow> = sqlx::query_as(&format!(
            "SELECT {} FROM continuation_chain_cache WHERE session_id = ?",
            CACHE_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn put_cache_entries(
        &self,
        entries: &[ChainCacheEntry],
        epoch: i64,
    ) -> StorageResult<bool> {
        if entries.is_empty() {
            return Ok(true);
        }

        let mut tx = self.pool.begin().await?;

        for entry in entries {
            // Guarded insert: lands only while no edge mutation has bumped the epoch
            let result = sqlx::query(
                r#"
                INSERT OR REPLACE INTO continuation_chain_cache
                    (session_id, root_id, is_child, is_parent, child_count, chain_position,
                     is_active_continuation, depth_from_root, has_multiple_children, computed_at)
                SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
                WHERE (SELECT epoch FROM chain_cache_epoch WHERE id = 1) = ?
                "#,
            )
            .bind(&entry.session_id)
            .bind(&entry.root_id)
            .bind(entry.is_child)
            .bind(entry.is_parent)
            .bind(entry.child_count)
            .bind(entry.chain_position)
            .bind(entry.is_active_continuation)
            .bind(entry.depth_from_root)
            .bind(entry.has_multiple_children)
            .bind(entry.computed_at.to_rfc3339())
            .bind(epoch)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                debug!(epoch, "Discarding cache write computed under a stale epoch");
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn invalidate_cache(&self, id: &str) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut touched = vec![id.to_string()];
        if let Some(edge) = fetch_edge(&mut tx, id).await? {
            touched.push(edge.parent_id);
        }
        let removed = invalidate_chains(&mut tx, &touched).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn cached_chain_stats(&self, root_id: &str) -> StorageResult<Option<CachedChainStats>> {
        let row: (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(depth_from_root), MAX(has_multiple_children)
            FROM continuation_chain_cache
            WHERE root_id = ?
            "#,
        )
        .bind(root_id)
        .fetch_one(&self.pool)
        .await?;

        let (count, max_depth, any_branch) = row;
        if count == 0 {
            return Ok(None);
        }

        Ok(Some(CachedChainStats {
            root_id: root_id.to_string(),
            max_depth: max_depth.unwrap_or(0),
            session_count: count,
            has_branches: any_branch.unwrap_or(0) != 0,
        }))
    }

    async fn count_cache_entries(&self) -> StorageResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM continuation_chain_cache")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[async_trait]
impl SessionCatalog for SqliteStorage {
    async fn session_exists(&self, id: &str) -> StorageResult<bool> {
        let mut conn = self.pool.acquire().await?;
        session_known(&mut conn, id).await
    }

    async fn session_file(&self, id: &str) -> StorageResult<Option<PathBuf>> {
        let path: Option<String> = sqlx::query_scalar("SELECT file_path FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(path.map(PathBuf::from))
    }

    async fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, file_path, project, discovered_at
            FROM sessions
            ORDER BY discovered_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn register_session(&self, record: &SessionRecord) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        let known = session_known(&mut tx, &record.id).await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, file_path, project, discovered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_path = excluded.file_path,
                project = excluded.project
            "#,
        )
        .bind(&record.id)
        .bind(record.file_path.to_string_lossy().into_owned())
        .bind(&record.project)
        .bind(record.discovered_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if !known {
            heal_session_created(&mut tx, &record.id).await?;
        }

        tx.commit().await?;
        Ok(!known)
    }

    async fn forget_session(&self, id: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let known = result.rows_affected() > 0;
        if known {
            cascade_session_deleted(&mut tx, id).await?;
        }

        tx.commit().await?;
        Ok(known)
    }
}

// ============================================================================
// Write-path helpers (run inside the caller's transaction)
// ============================================================================

async fn session_known(conn: &mut SqliteConnection, id: &str) -> StorageResult<bool> {
    let found: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?)")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(found != 0)
}

async fn fetch_edge(conn: &mut SqliteConnection, child_id: &str) -> StorageResult<Option<EdgeRow>> {
    let row: Option<EdgeRow> = sqlx::query_as(&format!(
        "SELECT {} FROM session_continuations WHERE child_id = ?",
        EDGE_COLUMNS
    ))
    .bind(child_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Topmost ancestor reachable through parent edges, stopping on a revisit.
async fn edge_root(conn: &mut SqliteConnection, id: &str) -> StorageResult<String> {
    let mut current = id.to_string();
    let mut visited = HashSet::new();
    visited.insert(current.clone());

    loop {
        let parent: Option<String> =
            sqlx::query_scalar("SELECT parent_id FROM session_continuations WHERE child_id = ?")
                .bind(&current)
                .fetch_optional(&mut *conn)
                .await?;

        match parent {
            Some(parent) if visited.insert(parent.clone()) => current = parent,
            _ => return Ok(current),
        }
    }
}

/// Give the parent an active child again if it lost the one it had.
async fn promote_latest_child(conn: &mut SqliteConnection, parent_id: &str) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE session_continuations
        SET is_active_continuation = 1
        WHERE child_id = (
            SELECT child_id FROM session_continuations
            WHERE parent_id = ?
            ORDER BY continuation_order DESC
            LIMIT 1
        )
        AND NOT EXISTS (
            SELECT 1 FROM session_continuations
            WHERE parent_id = ? AND is_active_continuation = 1
        )
        "#,
    )
    .bind(parent_id)
    .bind(parent_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Delete every cache entry that could depend on an edge touching `ids`.
///
/// Removes the entries for the ids themselves and for every chain they belong
/// to, whether that chain is known from the cache or from the edges. Also
/// bumps the cache epoch so in-flight computations cannot store stale rows.
async fn invalidate_chains(conn: &mut SqliteConnection, ids: &[String]) -> StorageResult<u64> {
    sqlx::query("UPDATE chain_cache_epoch SET epoch = epoch + 1 WHERE id = 1")
        .execute(&mut *conn)
        .await?;

    let mut roots: HashSet<String> = HashSet::new();
    for id in ids {
        roots.insert(id.clone());
        roots.insert(edge_root(conn, id).await?);

        let cached_root: Option<String> =
            sqlx::query_scalar("SELECT root_id FROM continuation_chain_cache WHERE session_id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(root) = cached_root {
            roots.insert(root);
        }
    }

    let mut removed = 0;
    for id in ids {
        removed += sqlx::query("DELETE FROM continuation_chain_cache WHERE session_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    for root in &roots {
        removed += sqlx::query("DELETE FROM continuation_chain_cache WHERE root_id = ?")
            .bind(root)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }

    Ok(removed)
}

async fn cascade_session_deleted(
    conn: &mut SqliteConnection,
    id: &str,
) -> StorageResult<SessionRemoval> {
    let own_edge = fetch_edge(conn, id).await?;

    let mut touched = vec![id.to_string(), edge_root(conn, id).await?];
    if let Some(edge) = &own_edge {
        touched.push(edge.parent_id.clone());
    }
    // Invalidate against the edge set as it was before removal
    invalidate_chains(conn, &touched).await?;

    let orphaned = sqlx::query(
        r#"
        UPDATE session_continuations
        SET is_orphaned = 1, updated_at = ?
        WHERE parent_id = ? AND is_orphaned = 0
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let removed_edge = match own_edge {
        Some(edge) => {
            sqlx::query("DELETE FROM session_continuations WHERE child_id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            promote_latest_child(conn, &edge.parent_id).await?;
            true
        }
        None => false,
    };

    if orphaned > 0 || removed_edge {
        warn!(
            session_id = %id,
            orphaned_edges = orphaned,
            removed_edge,
            "Session deleted; continuation edges updated"
        );
    }

    Ok(SessionRemoval {
        orphaned_edges: orphaned,
        removed_edge,
    })
}

async fn heal_session_created(conn: &mut SqliteConnection, id: &str) -> StorageResult<u64> {
    let healed = sqlx::query(
        r#"
        UPDATE session_continuations
        SET is_orphaned = 0, updated_at = ?
        WHERE parent_id = ? AND is_orphaned = 1
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if healed > 0 {
        invalidate_chains(conn, &[id.to_string()]).await?;
        info!(session_id = %id, healed, "Parent session reappeared; orphaned edges healed");
    }

    Ok(healed)
}

// ============================================================================
// Internal row types for SQLx mapping
// ============================================================================

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    child_id: String,
    parent_id: String,
    continuation_order: i64,
    child_started_at: Option<String>,
    is_active_continuation: bool,
    is_orphaned: bool,
    detected_at: String,
    updated_at: String,
}

impl From<EdgeRow> for ContinuationEdge {
    fn from(row: EdgeRow) -> Self {
        Self {
            child_id: row.child_id,
            parent_id: row.parent_id,
            order: row.continuation_order,
            child_started_at: row.child_started_at.as_deref().and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
            is_active_continuation: row.is_active_continuation,
            is_orphaned: row.is_orphaned,
            detected_at: parse_timestamp(&row.detected_at),
            updated_at: parse_timestamp(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    session_id: String,
    root_id: String,
    is_child: bool,
    is_parent: bool,
    child_count: i64,
    chain_position: i64,
    is_active_continuation: bool,
    depth_from_root: i64,
    has_multiple_children: bool,
    computed_at: String,
}

impl From<CacheRow> for ChainCacheEntry {
    fn from(row: CacheRow) -> Self {
        Self {
            session_id: row.session_id,
            root_id: row.root_id,
            is_child: row.is_child,
            is_parent: row.is_parent,
            child_count: row.child_count,
            chain_position: row.chain_position,
            is_active_continuation: row.is_active_continuation,
            depth_from_root: row.depth_from_root,
            has_multiple_children: row.has_multiple_children,
            computed_at: parse_timestamp(&row.computed_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    file_path: String,
    project: Option<String>,
    discovered_at: String,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            file_path: PathBuf::from(row.file_path),
            project: row.project,
            discovered_at: parse_timestamp(&row.discovered_at),
        }
    }
}
