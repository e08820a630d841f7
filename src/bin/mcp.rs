//! Standalone MCP server binary for SiYuan.
//!
//! Spawned by an MCP client as a tool server. It communicates:
//! - With the client via **stdio** (JSON-RPC 2.0, one message per line)
//! - With the SiYuan kernel via its HTTP API (`SIYUAN_API_URL`, `SIYUAN_API_TOKEN`)
//!
//! Logs go to stderr and, unless disabled, to `SIYUAN_MCP_LOG_DIR`.

use siyuan_mcp_lib::config::BridgeConfig;
use siyuan_mcp_lib::mcp::server::run_server;
use siyuan_mcp_lib::services::logger;

#[tokio::main]
async fn main() {
    let config = BridgeConfig::from_env();

    if let Err(e) = logger::init(config.log_dir.as_deref()) {
        eprintln!("[MCP] Logging init failed: {}", e);
    }

    // Blocks until stdin closes.
    if let Err(e) = run_server(config).await {
        eprintln!("[MCP] Server error: {:#}", e);
        std::process::exit(1);
    }
}
