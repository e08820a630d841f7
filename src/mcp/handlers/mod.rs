//! MCP tool handler implementations.
//!
//! Each module implements a group of related tools:
//! - `notes`    -- blocks, documents, notebooks, attributes, SQL
//! - `database` -- the multi-operation `siyuan_database` tool
//! - `media`    -- image import, page scraping, screenshots, image insertion
//!
//! Handlers take typed arguments parsed from the raw JSON and return
//! `anyhow::Result<Value>`; the dispatcher turns that into a [`McpToolResult`].

pub mod database;
pub mod media;
pub mod notes;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::BridgeConfig;
use crate::media::import::ImagePipeline;
use crate::media::screenshot::ScreenshotService;
use crate::net::Fetcher;
use crate::siyuan::SiyuanClient;

/// Result type returned by all MCP tool handlers.
///
/// Matches the MCP protocol's tool result format:
/// ```json
/// {
///   "content": [{ "type": "text", "text": "..." }],
///   "isError": false
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContent {
    #[serde(rename = "text")]
    Text { text: String },
}

impl McpToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// First text item, if any.
    pub fn first_text(&self) -> &str {
        match self.content.first() {
            Some(McpContent::Text { text }) => text,
            None => "",
        }
    }
}

/// Successful handler output as pretty-printed JSON.
pub fn ok_result(value: &Value) -> McpToolResult {
    match serde_json::to_string_pretty(value) {
        Ok(text) => McpToolResult::text(text),
        Err(e) => McpToolResult::error(format!("Failed to serialize result: {}", e)),
    }
}

/// Handler failure with its full context chain.
pub fn err_result(err: &anyhow::Error) -> McpToolResult {
    McpToolResult::error(format!("{:#}", err))
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is not allowed in read-only mode (set SIYUAN_MCP_READ_ONLY=0 to enable writes)")]
pub struct ReadOnlyError(pub String);

/// Everything a handler needs, built once at startup.
pub struct ToolContext {
    pub config: BridgeConfig,
    pub backend: SiyuanClient,
    pub pipeline: ImagePipeline,
    pub screenshots: ScreenshotService,
}

impl ToolContext {
    pub fn new(config: BridgeConfig) -> anyhow::Result<Self> {
        let fetcher = Fetcher::new(&config.user_agent).context("creating outbound HTTP client")?;
        let backend = SiyuanClient::new(&config.api_url, &config.api_token)
            .context("creating SiYuan client")?;
        let pipeline = ImagePipeline::new(
            fetcher,
            backend.clone(),
            config.max_image_bytes,
            config.remote,
        );
        let screenshots = ScreenshotService::new(
            pipeline.clone(),
            config.screenshot_providers.clone(),
            config.local_screenshot.clone(),
        );
        Ok(Self {
            config,
            backend,
            pipeline,
            screenshots,
        })
    }

    /// Must run before any network or backend call of a mutating tool.
    pub fn assert_write_allowed(&self, tool: &str) -> Result<(), ReadOnlyError> {
        if self.config.read_only {
            Err(ReadOnlyError(tool.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Deserialize tool arguments; a missing `arguments` object counts as `{}`.
pub fn parse_args<T: DeserializeOwned>(args: &Value) -> anyhow::Result<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args.clone()
    };
    serde_json::from_value(args).context("invalid arguments")
}

/// Trimmed, non-empty string argument.
pub fn required<'a>(value: &'a Option<String>, name: &str) -> anyhow::Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument: {}", name))
}

/// Trimmed string argument, `None` when empty.
pub fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mcp_tool_result_text() {
        let result = McpToolResult::text("hello");
        assert!(!result.is_error);
        assert_eq!(result.first_text(), "hello");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"content": [{"type": "text", "text": "hello"}], "isError": false}));
    }

    #[test]
    fn test_err_result_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("uploading asset");
        let result = err_result(&err);
        assert!(result.is_error);
        assert_eq!(result.first_text(), "uploading asset: connection refused");
    }

    #[test]
    fn test_ok_result_is_pretty_json() {
        let result = ok_result(&json!({"a": 1}));
        assert_eq!(result.first_text(), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_read_only_guard() {
        let ctx = ToolContext::new(BridgeConfig::default()).unwrap();
        let err = ctx.assert_write_allowed("siyuan_update_block").unwrap_err();
        assert!(err.to_string().starts_with("siyuan_update_block is not allowed in read-only mode"));

        let ctx = ToolContext::new(BridgeConfig {
            read_only: false,
            ..BridgeConfig::default()
        })
        .unwrap();
        assert!(ctx.assert_write_allowed("siyuan_update_block").is_ok());
    }

    #[test]
    fn test_required_and_parse_args() {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            id: Option<String>,
        }
        let a: Args = parse_args(&Value::Null).unwrap();
        assert!(required(&a.id, "id").is_err());
        let a: Args = parse_args(&json!({"id": "  x  "})).unwrap();
        assert_eq!(required(&a.id, "id").unwrap(), "x");
        assert!(parse_args::<Args>(&json!({"id": 5})).is_err());
    }
}
