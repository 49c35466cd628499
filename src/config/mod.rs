use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub sessions: SessionsConfig,
    pub healer: HealerConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Transcript discovery and scan configuration
#[derive(Debug, Clone)]
pub struct SessionsConfig {
    /// Directory holding `<project>/<session-id>.jsonl` transcripts.
    pub root: PathBuf,
    /// Maximum number of transcripts parsed at once during a full scan.
    pub scan_concurrency: usize,
}

/// Orphan healer scheduling configuration
#[derive(Debug, Clone)]
pub struct HealerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH")
                    .unwrap_or_else(|_| "./data/session-chains.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let sessions = SessionsConfig {
            root: env::var("SESSIONS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_sessions_root()),
            scan_concurrency: parse_var("SCAN_CONCURRENCY").unwrap_or(8),
        };

        let healer = HealerConfig {
            enabled: env::var("HEALER_ENABLED")
                .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
                .unwrap_or(true),
            interval_secs: parse_var("HEALER_INTERVAL_SECS").unwrap_or(300),
        };

        let config = Config {
            database,
            logging,
            sessions,
            healer,
        };
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would stall the scanner or the healer loop.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sessions.scan_concurrency == 0 {
            return Err(AppError::Config {
                message: "SCAN_CONCURRENCY must be at least 1".to_string(),
            });
        }
        if self.healer.interval_secs == 0 {
            return Err(AppError::Config {
                message: "HEALER_INTERVAL_SECS must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn default_sessions_root() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root: default_sessions_root(),
            scan_concurrency: 8,
        }
    }
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}
