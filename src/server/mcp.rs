//! Stdio MCP transport for the continuation chain tools.
//!
//! One JSON-RPC 2.0 message per line on stdin, one response per line on
//! stdout. Argument and session id problems are protocol errors
//! (`-32602`) so clients can tell a bad call from a failed one; failures
//! while a tool runs come back as a tool result with `isError` set.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::{handle_tool_call, SharedState};
use crate::error::{McpError, McpResult};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// JSON-RPC error codes used by this server.
pub mod codes {
    /// Line is not valid JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Valid JSON but not a JSON-RPC 2.0 request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Bad tool name, arguments or session id.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Response could not be produced.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Protocol revisions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

const SERVER_NAME: &str = "session-chains";

const SERVER_INSTRUCTIONS: &str = "Tools for continuation chains: transcripts that \
continue an earlier session after its context filled up. Session ids are transcript \
UUIDs. Call chain_resolve_all once to index transcripts, then chain_get or \
chain_metadata for any session.";

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol marker; anything but "2.0" is rejected.
    pub jsonrpc: String,
    /// Absent for notifications.
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0".
    pub jsonrpc: &'static str,
    /// Echo of the request id, `null` when it could not be read.
    pub id: Value,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// One of [`codes`].
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Structured detail, e.g. the tool a bad call was aimed at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Tool name used in `tools/call`.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON Schema of the arguments.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    protocol_version: Option<String>,
    #[serde(rename = "clientInfo")]
    client_info: Option<Value>,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// Text content items; tools here always return exactly one.
    pub content: Vec<Value>,
    /// Set when the tool ran and failed.
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Pretty-printed JSON payload.
    pub fn json(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    /// Failure message for a tool that ran and failed.
    pub fn failure(err: &McpError) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": format!("Error: {}", err) })],
            is_error: true,
        }
    }
}

impl JsonRpcResponse {
    /// Successful response.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Error response without detail.
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    /// Error response carrying structured detail.
    pub fn error_with_data(
        id: Option<Value>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// Protocol error code for a tool failure, or `None` if it belongs in the tool result.
pub fn protocol_error_code(err: &McpError) -> Option<i32> {
    match err {
        McpError::InvalidRequest { .. }
        | McpError::UnknownTool { .. }
        | McpError::InvalidParameters { .. } => Some(codes::INVALID_PARAMS),
        McpError::ExecutionFailed { .. } | McpError::Json(_) | McpError::Transport(_) => None,
    }
}

/// The protocol revision to answer an `initialize` with.
///
/// Echoes the client's revision when supported, otherwise offers the newest.
pub fn negotiate_protocol_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|s| **s == v))
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

#[derive(Debug, PartialEq)]
enum Method<'a> {
    Initialize,
    Initialized,
    Cancelled,
    Ping,
    ToolsList,
    ToolsCall,
    Other(&'a str),
}

impl<'a> From<&'a str> for Method<'a> {
    fn from(method: &'a str) -> Self {
        match method {
            "initialize" => Method::Initialize,
            "notifications/initialized" | "initialized" => Method::Initialized,
            "notifications/cancelled" => Method::Cancelled,
            "ping" => Method::Ping,
            "tools/list" => Method::ToolsList,
            "tools/call" => Method::ToolsCall,
            other => Method::Other(other),
        }
    }
}

/// MCP server bound to the shared chain state.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    /// Create a server over the shared state.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve stdin/stdout until EOF.
    pub async fn run(&self) -> McpResult<()> {
        info!("Session chains MCP server starting...");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve line-delimited JSON-RPC from `reader` to `writer` until EOF.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> McpResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let Some(response) = self.handle_line(line.trim()).await else {
                continue;
            };

            let encoded = serde_json::to_string(&response)?;
            debug!(response = %encoded, "Sending response");
            writer.write_all(encoded.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        Ok(())
    }

    /// Answer one input line; `None` for blank lines and notifications.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        if line.is_empty() {
            return None;
        }
        debug!(request = %line, "Received request");

        let raw: Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Unparseable request line");
                return Some(JsonRpcResponse::error(
                    None,
                    codes::PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
            }
        };
        let id = raw.get("id").cloned();

        let request: JsonRpcRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    id,
                    codes::INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                ));
            }
        };
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id,
                codes::INVALID_REQUEST,
                format!("Unsupported jsonrpc version: {}", request.jsonrpc),
            ));
        }

        self.handle_request(request).await
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match Method::from(request.method.as_str()) {
            Method::Initialize => Some(self.handle_initialize(request.id, request.params)),
            Method::Initialized | Method::Cancelled => {
                debug!(method = %request.method, "Notification received");
                None
            }
            Method::Ping => Some(JsonRpcResponse::success(request.id, json!({}))),
            Method::ToolsList => Some(JsonRpcResponse::success(
                request.id,
                json!({ "tools": all_tools() }),
            )),
            Method::ToolsCall => Some(self.handle_tool_call(request.id, request.params).await),
            Method::Other(method) if is_notification => {
                debug!(method = %method, "Unknown notification, ignoring");
                None
            }
            Method::Other(method) => {
                warn!(method = %method, "Unknown method");
                Some(JsonRpcResponse::error(
                    request.id,
                    codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                ))
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: InitializeParams = params
            .and_then(|p| serde_json::from_value(p).ok())
            .unwrap_or_default();
        let version = negotiate_protocol_version(params.protocol_version.as_deref());

        info!(
            requested = ?params.protocol_version,
            negotiated = version,
            client = ?params.client_info,
            "Handling initialize request"
        );

        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": version,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": SERVER_INSTRUCTIONS,
            }),
        )
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params.map(serde_json::from_value::<ToolCallParams>) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("Invalid params: {}", e),
                );
            }
            None => return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "Missing params"),
        };

        info!(tool = %params.name, "Handling tool call");

        let result = match handle_tool_call(&self.state, &params.name, params.arguments).await {
            Ok(value) => ToolCallResult::json(&value),
            Err(e) => match protocol_error_code(&e) {
                Some(code) => {
                    debug!(tool = %params.name, error = %e, "Rejected tool call");
                    return JsonRpcResponse::error_with_data(
                        id,
                        code,
                        e.to_string(),
                        Some(json!({ "tool": params.name })),
                    );
                }
                None => {
                    warn!(tool = %params.name, error = %e, "Tool call failed");
                    ToolCallResult::failure(&e)
                }
            },
        };

        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                error!(error = %e, "Failed to serialize tool call result");
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        }
    }
}

/// Every tool this server exposes, in listing order.
pub fn all_tools() -> Vec<Tool> {
    vec![
        get_chain_get_tool(),
        get_chain_root_tool(),
        get_chain_metadata_tool(),
        get_chain_stats_tool(),
        get_chain_cached_stats_tool(),
        get_chain_resolve_all_tool(),
        get_chain_heal_orphans_tool(),
        get_session_detect_tool(),
        get_sessions_sync_tool(),
    ]
}

fn session_id_schema(description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "session_id": {
                "type": "string",
                "description": description
            }
        },
        "required": ["session_id"],
        "additionalProperties": false
    })
}

fn no_arguments_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

/// Get the chain tool definition
fn get_chain_get_tool() -> Tool {
    Tool {
        name: "chain_get".to_string(),
        description: "Get the full continuation chain containing a session. Works from any session in the chain and returns the root, descendants ordered by depth and creation order, and branch information.".to_string(),
        input_schema: session_id_schema("Any session in the chain"),
    }
}

/// Get the chain root tool definition
fn get_chain_root_tool() -> Tool {
    Tool {
        name: "chain_root".to_string(),
        description: "Find the root session of the chain containing a session.".to_string(),
        input_schema: session_id_schema("The session to resolve"),
    }
}

/// Get the chain metadata tool definition
fn get_chain_metadata_tool() -> Tool {
    Tool {
        name: "chain_metadata".to_string(),
        description: "Get cached chain metadata for one session: root, depth, position under its parent, and whether it is the active continuation.".to_string(),
        input_schema: session_id_schema("The session to describe"),
    }
}

fn get_chain_stats_tool() -> Tool {
    Tool {
        name: "chain_stats".to_string(),
        description: "Get totals across every stored chain: chain count, relationship count, maximum depth, orphan count and average chain length.".to_string(),
        input_schema: no_arguments_schema(),
    }
}

fn get_chain_cached_stats_tool() -> Tool {
    Tool {
        name: "chain_cached_stats".to_string(),
        description: "Get aggregates over the cached entries of one chain. Returns null if the chain has not been cached since its last change.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "root_id": {
                    "type": "string",
                    "description": "Root session of the chain"
                }
            },
            "required": ["root_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the full scan tool definition
fn get_chain_resolve_all_tool() -> Tool {
    Tool {
        name: "chain_resolve_all".to_string(),
        description: "Scan every known transcript for continuations, store the relationships, and warm the cache for the chains touched. Fails if a scan or healing pass is already running.".to_string(),
        input_schema: no_arguments_schema(),
    }
}

/// Get the orphan healing tool definition
fn get_chain_heal_orphans_tool() -> Tool {
    Tool {
        name: "chain_heal_orphans".to_string(),
        description: "Re-check orphaned continuations and re-link those whose parent session exists again and whose transcript still names it.".to_string(),
        input_schema: no_arguments_schema(),
    }
}

fn get_session_detect_tool() -> Tool {
    Tool {
        name: "session_detect".to_string(),
        description: "Run continuation detection on one known session's transcript without storing anything.".to_string(),
        input_schema: session_id_schema("The session whose transcript to inspect"),
    }
}

fn get_sessions_sync_tool() -> Tool {
    Tool {
        name: "sessions_sync".to_string(),
        description: "Reconcile the session catalog with the transcript directory. New sessions are registered and missing ones are forgotten, which orphans their continuations.".to_string(),
        input_schema: no_arguments_schema(),
    }
}
