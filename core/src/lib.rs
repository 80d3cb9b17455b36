//! Runtime engine of the toolmux proxy: configuration, the persistent schema
//! cache with its routing table, the BM25 tool index, the child lifecycle
//! manager, and the transport-agnostic request dispatcher.
//!
//! The host-facing transports live in `toolmux-server`; the per-child MCP
//! client lives in `toolmux-mcp-client`.

pub mod child_manager;
pub mod config;
pub mod error;
pub mod error_code;
pub mod meta_tools;
pub mod proxy;
pub mod schema_cache;
pub mod search;

pub use child_manager::ChildManager;
pub use error::ProxyError;
pub use proxy::ProxyHandler;
pub use schema_cache::SchemaCache;
