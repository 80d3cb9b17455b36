use std::collections::HashMap;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::ListToolsRequestParams;
use mcp_types::ListToolsResult;
use mcp_types::RequestId;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::error::McpClientError;
use crate::error::Result;

/// Size of the bounded channel between callers and the stdin writer task.
const CHANNEL_CAPACITY: usize = 128;

/// Applied when the caller does not supply a per-request deadline.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const METHOD_NOT_FOUND_ERROR_CODE: i64 = -32601;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JSONRPCMessage>>>>;

/// MCP client over one child process's stdin/stdout.
#[derive(Debug)]
pub struct McpClient {
    outgoing_tx: Mutex<Option<mpsc::Sender<JSONRPCMessage>>>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    child: tokio::sync::Mutex<Option<Child>>,
    closed_rx: watch::Receiver<bool>,
}

impl McpClient {
    /// Spawn `program` with `args`, inheriting this process's environment and
    /// overlaying `env` on top (entry values win), then wire up the reader
    /// and writer tasks. The returned client has not yet performed the
    /// initialize handshake.
    pub async fn new_stdio_client(
        program: OsString,
        args: Vec<OsString>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut command = Command::new(&program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // stderr is the child's log channel; let it share ours.
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(env) = env {
            command.envs(env);
        }

        let mut child = command.spawn().map_err(|source| McpClientError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            McpClientError::Protocol("child process has no piped stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpClientError::Protocol("child process has no piped stdout".to_string())
        })?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, closed_rx) = watch::channel(false);

        // Writer: drain the outgoing channel onto the child's stdin. Dropping
        // every sender closes the channel, which in turn closes stdin and
        // gives the child its EOF before any hard kill.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to serialize outgoing message: {e}");
                        continue;
                    }
                };
                if stdin.write_all(json.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
            debug!("stdin writer finished");
        });

        // Reader: route responses to their waiters until EOF. It only gets a
        // weak sender: a strong clone here would keep stdin open after
        // shutdown and rob the child of its EOF.
        let reader_pending = pending.clone();
        let reader_reply_tx = outgoing_tx.downgrade();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JSONRPCMessage>(line) {
                            Ok(message) => {
                                dispatch_incoming(message, &reader_pending, &reader_reply_tx).await;
                            }
                            Err(e) => warn!("discarding undecodable frame from child: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("error reading from child stdout: {e}");
                        break;
                    }
                }
            }
            debug!("stdout reader finished (EOF)");
            let _ = closed_tx.send(true);
            // Fail every in-flight request; dropping the senders wakes the
            // waiters with a transport-closed error.
            reader_pending.lock().map(|mut map| map.clear()).ok();
        });

        Ok(Self {
            outgoing_tx: Mutex::new(Some(outgoing_tx)),
            pending,
            next_request_id: AtomicI64::new(1),
            child: tokio::sync::Mutex::new(Some(child)),
            closed_rx,
        })
    }

    /// Perform the MCP initialize handshake, then emit
    /// `notifications/initialized` as the protocol requires.
    pub async fn initialize(
        &self,
        params: InitializeRequestParams,
        timeout: Option<Duration>,
    ) -> Result<InitializeResult> {
        let params = serde_json::to_value(params)
            .map_err(|e| McpClientError::Protocol(format!("initialize params: {e}")))?;
        let result = self.request("initialize", params, timeout).await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpClientError::Protocol(format!("bad initialize result: {e}")))?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    pub async fn list_tools(
        &self,
        cursor: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<ListToolsResult> {
        let params = serde_json::to_value(ListToolsRequestParams { cursor })
            .map_err(|e| McpClientError::Protocol(format!("tools/list params: {e}")))?;
        let result = self.request("tools/list", params, timeout).await?;
        serde_json::from_value(result)
            .map_err(|e| McpClientError::Protocol(format!("bad tools/list result: {e}")))
    }

    pub async fn call_tool(
        &self,
        name: String,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolRequestParams { name, arguments })
            .map_err(|e| McpClientError::Protocol(format!("tools/call params: {e}")))?;
        let result = self.request("tools/call", params, timeout).await?;
        serde_json::from_value(result)
            .map_err(|e| McpClientError::Protocol(format!("bad tools/call result: {e}")))
    }

    /// Send an arbitrary request and return the raw result. Used for the
    /// prompts/resources methods the proxy forwards without interpreting.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let request = JSONRPCMessage::Request(JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::Integer(id),
            method: method.to_string(),
            params: if params.is_null() { None } else { Some(params) },
        });

        if self.send_message(request).await.is_err() {
            self.forget_pending(id);
            return Err(McpClientError::TransportClosed);
        }

        let message = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => return Err(McpClientError::TransportClosed),
            Err(_) => {
                self.forget_pending(id);
                return Err(McpClientError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        match message {
            JSONRPCMessage::Response(response) => Ok(response.result),
            JSONRPCMessage::Error(err) => Err(McpClientError::Upstream {
                code: err.error.code,
                message: err.error.message,
            }),
            other => Err(McpClientError::Protocol(format!(
                "unexpected frame in response position: {other:?}"
            ))),
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JSONRPCMessage::Notification(JSONRPCNotification {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.to_string(),
            params,
        });
        self.send_message(notification)
            .await
            .map_err(|_| McpClientError::TransportClosed)
    }

    /// Best-effort `notifications/cancelled` for a host request this child
    /// may be servicing.
    pub async fn notify_cancelled(&self, request_id: RequestId, reason: Option<String>) {
        let params = serde_json::to_value(mcp_types::CancelledNotificationParams {
            request_id,
            reason,
        })
        .ok();
        let _ = self.notify("notifications/cancelled", params).await;
    }

    /// Resolves once the child's stdout reaches EOF.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Close stdin, give the child `grace` to exit on its own, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        if let Ok(mut guard) = self.outgoing_tx.lock() {
            guard.take();
        }
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => trace!("child exited with {status}"),
                Ok(Err(e)) => warn!("error awaiting child exit: {e}"),
                Err(_) => {
                    debug!("child did not exit within {grace:?}; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }

    /// Immediate termination, used when the startup handshake times out.
    pub async fn kill(&self) {
        if let Ok(mut guard) = self.outgoing_tx.lock() {
            guard.take();
        }
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    async fn send_message(&self, message: JSONRPCMessage) -> std::result::Result<(), ()> {
        let tx = match self.outgoing_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(message).await.map_err(|_| ()),
            None => Err(()),
        }
    }

    fn forget_pending(&self, id: i64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

async fn dispatch_incoming(
    message: JSONRPCMessage,
    pending: &PendingMap,
    reply_tx: &mpsc::WeakSender<JSONRPCMessage>,
) {
    match message {
        JSONRPCMessage::Response(ref response) => {
            route_to_waiter(&response.id, message.clone(), pending);
        }
        JSONRPCMessage::Error(ref err) => {
            route_to_waiter(&err.id, message.clone(), pending);
        }
        JSONRPCMessage::Notification(notification) => {
            trace!("notification from child: {}", notification.method);
        }
        JSONRPCMessage::Request(request) => {
            // Server-to-client requests (sampling, elicitation) are not
            // supported by the proxy; answer so the child does not hang.
            debug!("rejecting server-to-client request `{}`", request.method);
            let reply = JSONRPCMessage::error(
                request.id,
                JSONRPCErrorError {
                    code: METHOD_NOT_FOUND_ERROR_CODE,
                    message: format!("method not supported by proxy: {}", request.method),
                    data: None,
                },
            );
            if let Some(tx) = reply_tx.upgrade() {
                let _ = tx.send(reply).await;
            }
        }
    }
}

fn route_to_waiter(id: &RequestId, message: JSONRPCMessage, pending: &PendingMap) {
    let RequestId::Integer(id) = id else {
        warn!("child produced response with non-integer id {id:?}");
        return;
    };
    let waiter = match pending.lock() {
        Ok(mut map) => map.remove(id),
        Err(_) => None,
    };
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => debug!("no waiter for response id {id} (timed out or cancelled)"),
    }
}
