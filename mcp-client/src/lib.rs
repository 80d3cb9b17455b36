//! Client side of MCP JSON-RPC 2.0 over a child process's stdio.
//!
//! One [`McpClient`] owns one child. Messages are line-delimited JSON; the
//! client allocates integer request ids, correlates responses to waiting
//! callers, and classifies failures into transport, protocol, and upstream
//! errors so the proxy can decide what a given fault means for the child's
//! lifecycle.

mod client;
mod error;

pub use client::McpClient;
pub use error::McpClientError;
pub use error::Result;
