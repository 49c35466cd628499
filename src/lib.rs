//! # Session Chains
//!
//! Tracks conversations that were split across several transcript files when
//! a session ran out of context and continued under a new session id, and
//! serves the reconstructed chains over the Model Context Protocol (MCP).
//!
//! ## Features
//!
//! - **Detection**: streams `.jsonl` transcripts for compaction boundaries
//! - **Relationship store**: ordered parent/child edges with orphan tracking
//! - **Chain resolution**: root lookup and breadth-first chain views
//! - **Metadata cache**: per-session chain metadata, invalidated on every change
//! - **Orphan healing**: periodic re-linking once a missing parent reappears
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (stdio) → ChainEngine → SQLite
//!                                        ↑
//!                      ~/.claude/projects/<project>/<session>.jsonl
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use session_chains::{Config, AppState, McpServer};
//! use session_chains::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let state = Arc::new(AppState::new(config, storage));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Command-line interface and one-shot commands.
pub mod cli;
/// Configuration management loaded from the environment.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Continuation detection, resolution, caching and healing.
pub mod chains;
/// Transcript discovery and catalog synchronization.
pub mod discovery;
/// MCP server implementation and request handling.
pub mod server;
/// SQLite storage layer for persistence.
pub mod storage;

pub use chains::ChainEngine;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, McpServer, SharedState};
