use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use session_chains::{
    cli::{execute_command, Cli, Commands},
    config::{Config, LogFormat},
    discovery::sync_catalog,
    error::{AppError, AppResult},
    server::{AppState, McpServer},
    storage::SqliteStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Session chains starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    let state = Arc::new(AppState::new(config, storage));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => Ok(serve(state).await?),
        command => {
            let result = execute_command(command, &state.engine, &state.config).await;
            if result.exit_code == 0 {
                println!("{}", result.message);
            } else {
                eprintln!("{}", result.message);
            }
            std::process::exit(result.exit_code);
        }
    }
}

async fn serve(state: Arc<AppState>) -> AppResult<()> {
    if let Err(e) = sync_catalog(&state.storage, &state.config.sessions.root).await {
        warn!(error = %e, "Initial catalog sync failed");
    }

    // Initial scan runs alongside the server; tool calls see partial results until it lands
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.resolve_all().await {
            warn!(error = %e, "Initial continuation scan failed");
        }
    });

    let mut scheduler = state.engine.scheduler();
    if state.config.healer.enabled {
        scheduler.start(Duration::from_secs(state.config.healer.interval_secs));
    } else {
        info!("Orphan healer disabled via HEALER_ENABLED");
    }

    let server = McpServer::new(Arc::clone(&state));

    info!("Server ready, waiting for requests on stdin...");

    let result = server.run().await;
    scheduler.stop().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(AppError::Mcp(e));
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
