//! Command-line interface.
//!
//! With no subcommand the binary runs the MCP server over stdio. The other
//! subcommands run one engine operation against the configured database and
//! print the result as JSON.

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::chains::{ChainEngine, ResolveReport};
use crate::config::Config;
use crate::discovery::{sync_catalog, SyncReport};

/// Session continuation chain tracker.
#[derive(Parser, Debug)]
#[command(name = "session-chains", version, about, long_about = None)]
pub struct Cli {
    /// Operation to run; defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the MCP server over stdio
    Serve,

    /// Sync the transcript catalog and detect every continuation
    Scan,

    /// Re-link orphaned continuations whose parent is back
    Heal,

    /// Show totals across all chains
    Stats,

    /// Show the full chain containing a session
    Chain {
        /// Any session in the chain
        session_id: String,
    },

    /// Show chain metadata for one session
    Metadata {
        /// The session to describe
        session_id: String,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a one-shot command. `Serve` is handled by the binary itself.
pub async fn execute_command(command: Commands, engine: &ChainEngine, config: &Config) -> CliResult {
    match command {
        Commands::Serve => CliResult::error("serve is not a one-shot command"),
        Commands::Scan => execute_scan(engine, config).await,
        Commands::Heal => render(engine.heal_orphans().await),
        Commands::Stats => render(engine.get_stats().await),
        Commands::Chain { session_id } => render(engine.get_chain(&session_id).await),
        Commands::Metadata { session_id } => render(engine.get_metadata(&session_id).await),
    }
}

#[derive(Serialize)]
struct ScanOutput {
    sync: SyncReport,
    resolve: ResolveReport,
}

async fn execute_scan(engine: &ChainEngine, config: &Config) -> CliResult {
    let sync = match sync_catalog(engine.storage(), &config.sessions.root).await {
        Ok(report) => report,
        Err(e) => return CliResult::error(format!("Catalog sync failed: {}", e)),
    };

    render(
        engine
            .resolve_all()
            .await
            .map(|resolve| ScanOutput { sync, resolve }),
    )
}

fn render<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> CliResult {
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => CliResult::success(json),
            Err(e) => CliResult::error(format!("Failed to serialize output: {}", e)),
        },
        Err(e) => CliResult::error(e.to_string()),
    }
}
