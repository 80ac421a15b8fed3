//! MCP Protocol
//!
//! JSON-RPC 2.0 types and the stdio transport.

pub mod stdio;
pub mod types;
