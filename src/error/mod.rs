use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Continuation chain engine errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Invalid session id: {session_id}")]
    InvalidSessionId { session_id: String },

    #[error("A {operation} is already in progress")]
    ScanInProgress { operation: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Transcript read errors, kept internal to the detector
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to read transcript {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl From<ChainError> for McpError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::InvalidSessionId { .. } => McpError::InvalidRequest {
                message: err.to_string(),
            },
            _ => McpError::ExecutionFailed {
                message: err.to_string(),
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for chain engine operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
