use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::SharedState;
use crate::chains::validate_session_id;
use crate::discovery::sync_catalog;
use crate::error::{McpError, McpResult};
use crate::storage::SessionCatalog;

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct RootParams {
    root_id: String,
}

#[derive(Debug, Serialize)]
struct RootResult {
    session_id: String,
    root_id: String,
}

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "chain_get" => handle_chain_get(state, arguments).await,
        "chain_root" => handle_chain_root(state, arguments).await,
        "chain_metadata" => handle_chain_metadata(state, arguments).await,
        "chain_stats" => handle_chain_stats(state).await,
        "chain_cached_stats" => handle_chain_cached_stats(state, arguments).await,
        "chain_resolve_all" => handle_resolve_all(state).await,
        "chain_heal_orphans" => handle_heal_orphans(state).await,
        "session_detect" => handle_session_detect(state, arguments).await,
        "sessions_sync" => handle_sessions_sync(state).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Handle chain_get - the whole chain containing a session
async fn handle_chain_get(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("chain_get", arguments, |params: SessionParams| async move {
        state.engine.get_chain(&params.session_id).await
    })
    .await
}

/// Handle chain_root - the root of a session's chain
async fn handle_chain_root(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("chain_root", arguments, |params: SessionParams| async move {
        let root_id = state.engine.get_root(&params.session_id).await?;
        Ok::<_, crate::error::ChainError>(RootResult {
            session_id: params.session_id,
            root_id,
        })
    })
    .await
}

/// Handle chain_metadata - per-session chain metadata
async fn handle_chain_metadata(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("chain_metadata", arguments, |params: SessionParams| async move {
        state.engine.get_metadata(&params.session_id).await
    })
    .await
}

/// Handle chain_stats - totals across every chain
async fn handle_chain_stats(state: &SharedState) -> McpResult<Value> {
    let stats = state.engine.get_stats().await?;
    serde_json::to_value(stats).map_err(McpError::Json)
}

/// Handle chain_cached_stats - aggregates from a chain's cached entries
async fn handle_chain_cached_stats(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    execute_handler("chain_cached_stats", arguments, |params: RootParams| async move {
        state.engine.cached_chain_stats(&params.root_id).await
    })
    .await
}

/// Handle chain_resolve_all - full continuation scan
async fn handle_resolve_all(state: &SharedState) -> McpResult<Value> {
    let report = state.engine.resolve_all().await?;
    serde_json::to_value(report).map_err(McpError::Json)
}

/// Handle chain_heal_orphans - one orphan healing pass
async fn handle_heal_orphans(state: &SharedState) -> McpResult<Value> {
    let report = state.engine.heal_orphans().await?;
    serde_json::to_value(report).map_err(McpError::Json)
}

/// Handle session_detect - run the detector on one known transcript
async fn handle_session_detect(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("session_detect", arguments)?;
    validate_session_id(&params.session_id)?;

    let path = state
        .storage
        .session_file(&params.session_id)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?
        .ok_or_else(|| McpError::InvalidRequest {
            message: format!("Unknown session: {}", params.session_id),
        })?;

    let result = state.engine.detect(&path).await;
    serde_json::to_value(result).map_err(McpError::Json)
}

/// Handle sessions_sync - reconcile the catalog with the transcript directory
async fn handle_sessions_sync(state: &SharedState) -> McpResult<Value> {
    let report = sync_catalog(&state.storage, &state.config.sessions.root)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;
    serde_json::to_value(report).map_err(McpError::Json)
}

fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Parse typed arguments, run the operation, and serialize its result.
///
/// Operation errors go through their `McpError` conversion, so an invalid
/// session id surfaces as an invalid request rather than a failed execution.
async fn execute_handler<P, R, E, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: Into<McpError>,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params).await.map_err(Into::<McpError>::into)?;

    serde_json::to_value(result).map_err(McpError::Json)
}
