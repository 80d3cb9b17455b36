use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, McpClientError>;

/// Failure classes for one upstream conversation.
///
/// `Upstream` is the child answering with a JSON-RPC error object; the
/// connection is still healthy. Everything else means the request never
/// completed normally.
#[derive(Debug, Error)]
pub enum McpClientError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child's stdio channel is gone (EOF, broken pipe, or the client
    /// was shut down while the request was in flight).
    #[error("transport closed")]
    TransportClosed,

    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The bytes on the wire were not the JSON-RPC we expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error response from the child.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },
}

impl McpClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, McpClientError::TransportClosed)
    }
}
