//! MCP JSON-RPC protocol handler over stdio.
//!
//! Reads newline-delimited JSON-RPC requests, routes tool calls to the
//! handlers and writes one response line per request. Requests are processed
//! strictly one after another: the next line is not read until the previous
//! response has been written.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::handlers::{self, err_result, ok_result, McpToolResult, ToolContext};
use super::tools::ToolRegistry;
use crate::config::BridgeConfig;

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "siyuan-mcp";

// ---------------------------------------------------------------------------
// JSON-RPC message types
// ---------------------------------------------------------------------------

/// Incoming JSON-RPC message. Fields are optional so that invalid envelopes
/// can be told apart from malformed JSON.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// `None` for notifications (absent or `null`).
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

pub struct McpServer {
    registry: ToolRegistry,
    ctx: ToolContext,
}

impl McpServer {
    pub fn new(config: BridgeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            registry: ToolRegistry::new(),
            ctx: ToolContext::new(config)?,
        })
    }

    /// Process one input line. `None` means nothing is written back.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                warn!("[MCP] Dropping invalid JSON line: {}", e);
                return None;
            }
        };

        if request.jsonrpc.as_deref() != Some("2.0") {
            debug!("[MCP] Dropping message without jsonrpc 2.0");
            return None;
        }
        let method = match request.method.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => return None,
        };
        let Some(id) = request.id.clone() else {
            debug!("[MCP] Ignoring notification: {}", method);
            return None;
        };

        Some(self.handle_request(id, method, &request.params).await)
    }

    async fn handle_request(&self, id: Value, method: &str, params: &Value) -> JsonRpcResponse {
        match method {
            "initialize" => handle_initialize(id, params),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params).await,
            "resources/list" => JsonRpcResponse::success(id, json!({ "resources": [] })),
            "prompts/list" => JsonRpcResponse::success(id, json!({ "prompts": [] })),
            _ => JsonRpcResponse::error(
                id,
                -32601, // Method not found
                format!("Method not found: {}", method),
            ),
        }
    }

    fn handle_tools_list(&self, id: Value) -> JsonRpcResponse {
        let tools: Vec<Value> = self
            .registry
            .list_tools()
            .iter()
            .map(|t| t.to_listing())
            .collect();
        JsonRpcResponse::success(id, json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);

        let result = self.call_tool(tool_name, &args).await;
        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, -32603, format!("Failed to serialize tool result: {}", e)),
        }
    }

    /// Resolve and run a tool; never fails at the protocol level.
    pub async fn call_tool(&self, name: &str, args: &Value) -> McpToolResult {
        if self.registry.get(name).is_none() {
            warn!("[MCP] Unknown tool requested: {}", name);
            return McpToolResult::error(format!("Unknown tool: {}", name));
        }

        let started = Instant::now();
        let outcome = route_tool_call(&self.ctx, name, args).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                info!(tool = name, elapsed_ms, is_error = false, "[MCP] Tool call finished");
                ok_result(&value)
            }
            Err(e) => {
                info!(tool = name, elapsed_ms, is_error = true, "[MCP] Tool call failed: {:#}", e);
                err_result(&e)
            }
        }
    }

    /// Serve until `reader` reaches EOF. Only a failing reader ends the
    /// loop early; a line that is not UTF-8 is logged and dropped.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(());
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    warn!("[MCP] Dropping line that is not valid UTF-8: {}", e);
                    continue;
                }
            };
            if let Some(response) = self.handle_line(line).await {
                write_response(&mut writer, &response).await;
            }
        }
    }
}

/// Handle `initialize`: echo the client's protocol version.
fn handle_initialize(id: Value, params: &Value) -> JsonRpcResponse {
    let protocol_version = match params.get("protocolVersion") {
        Some(Value::String(v)) if !v.is_empty() => Value::String(v.clone()),
        Some(v) if !v.is_null() && v != &Value::Bool(false) => v.clone(),
        _ => Value::String(DEFAULT_PROTOCOL_VERSION.into()),
    };
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": protocol_version,
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": { "tools": {} }
        }),
    )
}

/// Route a tool call to the appropriate handler module.
async fn route_tool_call(ctx: &ToolContext, name: &str, args: &Value) -> anyhow::Result<Value> {
    match name {
        // ---- Notes ----
        "siyuan_sql_query" => handlers::notes::handle_sql_query(ctx, args).await,
        "siyuan_get_block_content" => handlers::notes::handle_get_block_content(ctx, args).await,
        "siyuan_insert_block" => handlers::notes::handle_insert_block(ctx, args).await,
        "siyuan_update_block" => handlers::notes::handle_update_block(ctx, args).await,
        "siyuan_create_document" => handlers::notes::handle_create_document(ctx, args).await,
        "siyuan_list_notebooks" => handlers::notes::handle_list_notebooks(ctx, args).await,
        "siyuan_create_notebook" => handlers::notes::handle_create_notebook(ctx, args).await,
        "siyuan_get_doc_tree" => handlers::notes::handle_get_doc_tree(ctx, args).await,
        "siyuan_rename_document" => handlers::notes::handle_rename_document(ctx, args).await,
        "siyuan_move_documents" => handlers::notes::handle_move_documents(ctx, args).await,
        "siyuan_get_block_attrs" => handlers::notes::handle_get_block_attrs(ctx, args).await,
        "siyuan_set_block_attrs" => handlers::notes::handle_set_block_attrs(ctx, args).await,

        // ---- Database ----
        "siyuan_database" => handlers::database::handle_database(ctx, args).await,

        // ---- Media ----
        "siyuan_import_image_urls" => handlers::media::handle_import_image_urls(ctx, args).await,
        "siyuan_extract_page_images" => handlers::media::handle_extract_page_images(ctx, args).await,
        "siyuan_capture_webpage_screenshot" => {
            handlers::media::handle_capture_webpage_screenshot(ctx, args).await
        }
        "siyuan_insert_images_to_note" => handlers::media::handle_insert_images_to_note(ctx, args).await,

        _ => anyhow::bail!("Unknown tool: {}", name),
    }
}

/// Write a JSON-RPC response as one line and flush.
async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            let line = format!("{}\n", json);
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!("[MCP] Failed to write response: {}", e);
            }
            if let Err(e) = writer.flush().await {
                error!("[MCP] Failed to flush stdout: {}", e);
            }
        }
        Err(e) => {
            error!("[MCP] Failed to serialize response: {}", e);
        }
    }
}

/// Run the MCP server on stdin/stdout until stdin closes.
pub async fn run_server(config: BridgeConfig) -> anyhow::Result<()> {
    info!(
        api_url = %config.api_url,
        read_only = config.read_only,
        "[MCP] siyuan-mcp server {} starting",
        env!("CARGO_PKG_VERSION")
    );
    let server = McpServer::new(config)?;

    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    server.serve(reader, writer).await?;

    info!("[MCP] stdin closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::tools::ToolAccess;
    use crate::test_support::{FakeResponse, FakeServer};

    fn server_for(backend: &FakeServer, read_only: bool) -> McpServer {
        McpServer::new(BridgeConfig {
            api_url: backend.base_url().to_string(),
            read_only,
            log_dir: None,
            ..BridgeConfig::default()
        })
        .unwrap()
    }

    async fn offline_server() -> (FakeServer, McpServer) {
        let backend = FakeServer::start(|_| FakeResponse::envelope(json!([]))).await;
        let server = server_for(&backend, true);
        (backend, server)
    }

    async fn respond(server: &McpServer, line: &str) -> Value {
        let resp = server.handle_line(line).await.expect("expected a response");
        serde_json::to_value(&resp).unwrap()
    }

    #[test]
    fn test_json_rpc_response_shapes() {
        let ok = serde_json::to_string(&JsonRpcResponse::success(json!(1), json!({}))).unwrap();
        assert!(ok.contains("\"result\""));
        assert!(!ok.contains("\"error\""));
        let err = serde_json::to_string(&JsonRpcResponse::error(json!(1), -32601, "x")).unwrap();
        assert!(err.contains("-32601"));
        assert!(!err.contains("\"result\""));
    }

    #[tokio::test]
    async fn test_notifications_and_invalid_lines_are_silent() {
        let (_backend, server) = offline_server().await;
        for line in [
            "",
            "   ",
            "{not json",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
            r#"{"id":1,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
        ] {
            assert!(server.handle_line(line).await.is_none(), "{line}");
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (_backend, server) = offline_server().await;
        let resp = respond(&server, r#"{"jsonrpc":"2.0","id":7,"method":"bogus/x"}"#).await;
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["error"]["message"], "Method not found: bogus/x");
    }

    #[tokio::test]
    async fn test_initialize_echoes_protocol_version() {
        let (_backend, server) = offline_server().await;
        let resp = respond(
            &server,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2025-03-26"}}"#,
        )
        .await;
        assert_eq!(resp["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(resp["result"]["serverInfo"]["name"], "siyuan-mcp");
        assert_eq!(resp["result"]["capabilities"], json!({"tools": {}}));

        let resp = respond(&server, r#"{"jsonrpc":"2.0","id":"a","method":"initialize"}"#).await;
        assert_eq!(resp["id"], "a");
        assert_eq!(resp["result"]["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_ping_resources_prompts() {
        let (_backend, server) = offline_server().await;
        let resp = respond(&server, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
        assert_eq!(resp["result"], json!({}));
        let resp = respond(&server, r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#).await;
        assert_eq!(resp["result"], json!({"resources": []}));
        let resp = respond(&server, r#"{"jsonrpc":"2.0","id":3,"method":"prompts/list"}"#).await;
        assert_eq!(resp["result"], json!({"prompts": []}));
    }

    #[tokio::test]
    async fn test_tools_list() {
        let (_backend, server) = offline_server().await;
        let resp = respond(&server, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await;
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 17);
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let (_backend, server) = offline_server().await;
        let resp = respond(
            &server,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"nope","arguments":{}}}"#,
        )
        .await;
        assert!(resp.get("error").is_none());
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(resp["result"]["content"][0]["text"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_every_registered_tool_is_routed() {
        let (_backend, server) = offline_server().await;
        for tool in server.registry.list_tools() {
            let result = server.call_tool(tool.name, &json!({})).await;
            assert!(
                !result.first_text().starts_with("Unknown tool"),
                "{} is not routed",
                tool.name
            );
        }
    }

    #[tokio::test]
    async fn test_read_only_blocks_writes_before_any_request() {
        let (backend, server) = offline_server().await;
        for tool in server.registry.list_tools() {
            if !matches!(tool.access, ToolAccess::Write | ToolAccess::WriteUnlessDryRun) {
                continue;
            }
            let result = server.call_tool(tool.name, &json!({})).await;
            assert!(result.is_error, "{}", tool.name);
            assert!(result.first_text().contains("read-only mode"), "{}: {}", tool.name, result.first_text());
        }
        let result = server
            .call_tool("siyuan_database", &json!({"operation": "removeRows"}))
            .await;
        assert!(result.first_text().starts_with("siyuan_database.removeRows is not allowed"));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_successful_tool_result_is_pretty_json() {
        let backend = FakeServer::start(|_| {
            FakeResponse::envelope(json!({"notebooks": [{"id": "nb", "name": "Inbox"}]}))
        })
        .await;
        let server = server_for(&backend, true);
        let result = server.call_tool("siyuan_list_notebooks", &Value::Null).await;
        assert!(!result.is_error);
        let parsed: Value = serde_json::from_str(result.first_text()).unwrap();
        assert_eq!(parsed["notebooks"][0]["name"], "Inbox");
        assert!(result.first_text().contains('\n'));
    }

    #[tokio::test]
    async fn test_backend_rejection_becomes_tool_error() {
        let backend = FakeServer::start(|_| {
            FakeResponse::json(200, json!({"code": -1, "msg": "notebook not found", "data": null}))
        })
        .await;
        let server = server_for(&backend, false);
        let result = server
            .call_tool("siyuan_create_notebook", &json!({"name": "x"}))
            .await;
        assert!(result.is_error);
        assert!(result.first_text().contains("notebook not found"), "{}", result.first_text());
    }

    #[tokio::test]
    async fn test_serve_writes_one_line_per_request_in_order() {
        let (_backend, server) = offline_server().await;
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\r\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "garbage\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"nope\"}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"what\"}\n",
        );
        let mut out: Vec<u8> = Vec::new();
        server.serve(input.as_bytes(), &mut out).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["id"], 2);
        assert_eq!(lines[1]["result"]["isError"], true);
        assert_eq!(lines[2]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_serve_survives_non_utf8_line() {
        let (_backend, server) = offline_server().await;
        let mut input: Vec<u8> = Vec::new();
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}");
        let mut out: Vec<u8> = Vec::new();
        server.serve(&input[..], &mut out).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["id"], 2);
        assert_eq!(lines[1]["result"], json!({}));
    }
}
