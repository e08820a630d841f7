//! MCP (Model Context Protocol) server implementation.
//!
//! Provides a JSON-RPC over stdio server that exposes SiYuan note tools to
//! MCP clients.
//!
//! Architecture:
//! - `server.rs` -- JSON-RPC protocol handler (stdin/stdout)
//! - `tools.rs`  -- Static tool registry (names, descriptions, input schemas)
//! - `handlers/` -- Tool handler implementations (notes, database, media)

pub mod handlers;
pub mod server;
pub mod tools;
