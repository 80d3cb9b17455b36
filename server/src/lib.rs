//! Host-facing transports for the toolmux proxy.
//!
//! Two ways for a host to reach the same [`toolmux_core::ProxyHandler`]:
//! line-delimited JSON-RPC over stdio (stdout is reserved for protocol, all
//! logging goes to stderr), and a loopback HTTP listener speaking the MCP
//! SSE transport. The thin dashboard REST surface and the config/cache
//! hot-reload watcher live here too.

pub mod dashboard;
pub mod sse;
pub mod stdio;
pub mod watcher;

pub use dashboard::DEFAULT_DASHBOARD_PORT;
pub use dashboard::run_dashboard;
pub use sse::DEFAULT_SSE_PORT;
pub use sse::run_sse;
pub use stdio::run_stdio;
pub use watcher::spawn_watcher;
