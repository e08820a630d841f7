//! SiYuan MCP bridge: exposes a SiYuan note backend as MCP tools over stdio.

pub mod config;
pub mod mcp;
pub mod media;
pub mod net;
pub mod services;
pub mod siyuan;

#[cfg(test)]
mod test_support;
