use thiserror::Error;
use toolmux_mcp_client::McpClientError;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error kinds the proxy distinguishes. Startup and upstream failures are
/// surfaced to the host as tool-call results with `isError: true`; they never
/// take the proxy down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    /// Unreadable cache. Treated as a cache miss by callers.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("failed to start server `{server}`: {reason}")]
    Startup { server: String, reason: String },

    #[error("upstream error from `{server}`: {message}")]
    Upstream {
        server: String,
        code: i64,
        message: String,
    },

    #[error("transport error for `{server}`: {reason}")]
    Transport { server: String, reason: String },

    #[error("unknown server `{0}`")]
    UnknownServer(String),

    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ProxyError {
    /// Classify a client-level failure against the server it came from.
    pub fn from_client(server: &str, err: McpClientError) -> Self {
        match err {
            McpClientError::Upstream { code, message } => ProxyError::Upstream {
                server: server.to_string(),
                code,
                message,
            },
            McpClientError::TransportClosed => ProxyError::Transport {
                server: server.to_string(),
                reason: "connection closed".to_string(),
            },
            other => ProxyError::Transport {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
