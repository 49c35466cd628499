//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::chains::ChainEngine;
use crate::config::Config;
use crate::storage::SqliteStorage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Continuation chain engine.
    pub engine: ChainEngine,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let engine = ChainEngine::new(storage.clone(), config.sessions.scan_concurrency);

        tracing::debug!(
            sessions_root = %config.sessions.root.display(),
            scan_concurrency = config.sessions.scan_concurrency,
            "AppState initialized"
        );

        Self {
            config,
            storage,
            engine,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
