//! Lifecycle manager for upstream MCP children.
//!
//! Owns one [`ManagedServer`] record per configured server and is the only
//! component that mutates them. Children are spawned lazily on first use,
//! idle-reaped after their effective idle timeout, and restarted by the next
//! call after a crash. Callers only ever receive an opaque client handle.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use mcp_types::CallToolResult;
use mcp_types::ClientCapabilities;
use mcp_types::Implementation;
use mcp_types::InitializeRequestParams;
use mcp_types::MCP_SCHEMA_VERSION;
use mcp_types::RequestId;
use mcp_types::Tool;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::config::ServerEntry;
use crate::config::Settings;
use crate::error::ProxyError;
use crate::error::Result;
use toolmux_mcp_client::McpClient;
use toolmux_mcp_client::McpClientError;

/// Timeout for the `tools/list` request.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stopping child gets to exit after its stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Pause between sequential preload starts, so N servers booting at once do
/// not spike CPU and IO.
const PRELOAD_STAGGER: Duration = Duration::from_secs(2);

/// In-flight spawn, shared by every caller that arrives while the child is
/// still `Starting`. The error side is a plain string so the future's output
/// stays cheaply cloneable.
type SharedStart = Shared<BoxFuture<'static, std::result::Result<Arc<McpClient>, String>>>;

enum ServerState {
    Stopped,
    Starting(SharedStart),
    Running(Arc<McpClient>),
    Error(String),
}

impl ServerState {
    fn label(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting(_) => "starting",
            ServerState::Running(_) => "running",
            ServerState::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerMetrics {
    pub call_count: u64,
    pub error_count: u64,
    pub total_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runtime record for one configured server. Never leaves the manager.
struct ManagedServer {
    entry: ServerEntry,
    state: ServerState,
    last_activity: Option<Instant>,
    /// Bumped on every activity; an idle timer only fires if its generation
    /// is still current, which is what makes each timer one-shot.
    idle_generation: u64,
    metrics: ServerMetrics,
}

impl ManagedServer {
    fn new(entry: ServerEntry) -> Self {
        ManagedServer {
            entry,
            state: ServerState::Stopped,
            last_activity: None,
            idle_generation: 0,
            metrics: ServerMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: String,
    pub persistent: bool,
    /// Seconds since the last successful call, if the server ever ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
    #[serde(flatten)]
    pub metrics: ServerMetrics,
}

struct ManagerInner {
    settings: RwLock<Settings>,
    servers: tokio::sync::Mutex<HashMap<String, ManagedServer>>,
}

#[derive(Clone)]
pub struct ChildManager {
    inner: Arc<ManagerInner>,
}

impl ChildManager {
    pub fn new(config: &Config) -> Self {
        let servers = config
            .servers
            .iter()
            .map(|(name, entry)| (name.clone(), ManagedServer::new(entry.clone())))
            .collect();
        ChildManager {
            inner: Arc::new(ManagerInner {
                settings: RwLock::new(config.settings.clone()),
                servers: tokio::sync::Mutex::new(servers),
            }),
        }
    }

    /// Apply a reloaded config: adopt new and changed entries, stop and drop
    /// servers that disappeared. Changed spawn instructions take effect on
    /// the next start.
    pub async fn update_config(&self, config: &Config) {
        if let Ok(mut settings) = self.inner.settings.write() {
            *settings = config.settings.clone();
        }
        let removed: Vec<(String, Arc<McpClient>)> = {
            let mut servers = self.inner.servers.lock().await;
            for (name, entry) in &config.servers {
                match servers.get_mut(name) {
                    Some(server) => server.entry = entry.clone(),
                    None => {
                        servers.insert(name.clone(), ManagedServer::new(entry.clone()));
                    }
                }
            }
            let gone: Vec<String> = servers
                .keys()
                .filter(|name| !config.servers.contains_key(*name))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|name| {
                    let server = servers.remove(&name)?;
                    match server.state {
                        ServerState::Running(client) => Some((name, client)),
                        _ => None,
                    }
                })
                .collect()
        };
        for (name, client) in removed {
            info!("stopping removed server `{name}`");
            client.shutdown(SHUTDOWN_GRACE).await;
        }
    }

    /// A ready client for `server`, spawning the child if needed. Callers
    /// arriving while the child is `Starting` await the same in-flight spawn;
    /// at most one child process exists per server at any instant.
    pub async fn get_client(&self, server: &str) -> Result<Arc<McpClient>> {
        let shared = {
            let mut servers = self.inner.servers.lock().await;
            let record = servers
                .get_mut(server)
                .ok_or_else(|| ProxyError::UnknownServer(server.to_string()))?;
            match &record.state {
                ServerState::Running(client) => return Ok(client.clone()),
                ServerState::Starting(shared) => shared.clone(),
                ServerState::Stopped | ServerState::Error(_) => {
                    let startup_timeout = self.settings().startup_timeout_duration();
                    let start = start_server(
                        self.inner.clone(),
                        server.to_string(),
                        record.entry.clone(),
                        startup_timeout,
                    )
                    .boxed()
                    .shared();
                    record.state = ServerState::Starting(start.clone());
                    // Drive the spawn to completion even if every waiter is
                    // cancelled, so the record cannot wedge in `Starting`.
                    tokio::spawn({
                        let start = start.clone();
                        async move {
                            let _ = start.await;
                        }
                    });
                    start
                }
            }
        };

        shared.await.map_err(|reason| ProxyError::Startup {
            server: server.to_string(),
            reason,
        })
    }

    /// `get_client` + `tools/list`.
    pub async fn discover_tools(&self, server: &str) -> Result<Vec<Tool>> {
        let client = self.get_client(server).await?;
        let result = client
            .list_tools(None, Some(LIST_TOOLS_TIMEOUT))
            .await
            .map_err(|e| self.classify(server, e))?;
        self.touch(server).await;
        Ok(result.tools)
    }

    /// Forward one tool call upstream, recording activity and metrics.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        let client = self.get_client(server).await?;
        let started = Instant::now();
        let outcome = client.call_tool(tool.to_string(), arguments, None).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.record_call(server, elapsed_ms, None).await;
                self.touch(server).await;
                Ok(result)
            }
            Err(e) => {
                let err = self.classify(server, e);
                self.record_call(server, elapsed_ms, Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Forward an arbitrary request (prompts/resources passthrough), starting
    /// the child if necessary.
    pub async fn request(&self, server: &str, method: &str, params: Value) -> Result<Value> {
        let client = self.get_client(server).await?;
        let result = client
            .request(method, params, None)
            .await
            .map_err(|e| self.classify(server, e))?;
        self.touch(server).await;
        Ok(result)
    }

    /// Fan an aggregation request out to every *running* child; servers that
    /// are stopped stay stopped.
    pub async fn request_all_running(
        &self,
        method: &str,
        params: Value,
    ) -> Vec<(String, Result<Value>)> {
        let clients = self.running_clients().await;
        let mut join_set = JoinSet::new();
        for (name, client) in clients {
            let method = method.to_string();
            let params = params.clone();
            join_set.spawn(async move {
                let result = client.request(&method, params, None).await;
                (name, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((name, result)) = joined {
                let mapped = result.map_err(|e| ProxyError::from_client(&name, e));
                results.push((name, mapped));
            }
        }
        results
    }

    /// Best-effort cancellation fan-out to every running child.
    pub async fn cancel_running(&self, request_id: RequestId, reason: Option<String>) {
        for (_, client) in self.running_clients().await {
            client
                .notify_cancelled(request_id.clone(), reason.clone())
                .await;
        }
    }

    /// Gracefully stop one server: close its client and return to `Stopped`.
    pub async fn stop_server(&self, server: &str) -> Result<()> {
        enum StopAction {
            Shutdown(Arc<McpClient>),
            AwaitSpawn(SharedStart),
            Nothing,
        }

        loop {
            let action = {
                let mut servers = self.inner.servers.lock().await;
                let record = servers
                    .get_mut(server)
                    .ok_or_else(|| ProxyError::UnknownServer(server.to_string()))?;
                match &record.state {
                    ServerState::Running(client) => {
                        let client = client.clone();
                        record.state = ServerState::Stopped;
                        record.idle_generation += 1;
                        StopAction::Shutdown(client)
                    }
                    ServerState::Starting(shared) => StopAction::AwaitSpawn(shared.clone()),
                    ServerState::Stopped | ServerState::Error(_) => StopAction::Nothing,
                }
            };
            match action {
                StopAction::Shutdown(client) => {
                    info!("stopping server `{server}`");
                    client.shutdown(SHUTDOWN_GRACE).await;
                    return Ok(());
                }
                StopAction::AwaitSpawn(shared) => {
                    // Let the in-flight spawn settle, then stop the result.
                    let _ = shared.await;
                }
                StopAction::Nothing => return Ok(()),
            }
        }
    }

    /// Stop every server concurrently and wait for all of them.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = {
            let servers = self.inner.servers.lock().await;
            servers.keys().cloned().collect()
        };
        let mut join_set = JoinSet::new();
        for name in names {
            let manager = self.clone();
            join_set.spawn(async move {
                if let Err(e) = manager.stop_server(&name).await {
                    debug!("error stopping `{name}`: {e}");
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    /// Warm the given servers sequentially with a stagger between starts.
    /// Failures are logged and do not abort the rest.
    pub async fn preload(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        info!("preloading {} servers", names.len());
        for (i, name) in names.iter().enumerate() {
            if let Err(e) = self.get_client(name).await {
                warn!("preload of `{name}` failed: {e}");
            }
            if i + 1 < names.len() {
                tokio::time::sleep(PRELOAD_STAGGER).await;
            }
        }
    }

    pub async fn running_count(&self) -> usize {
        let servers = self.inner.servers.lock().await;
        servers
            .values()
            .filter(|s| matches!(s.state, ServerState::Running(_)))
            .count()
    }

    pub async fn status(&self) -> Vec<ServerStatus> {
        let servers = self.inner.servers.lock().await;
        let mut statuses: Vec<ServerStatus> = servers
            .iter()
            .map(|(name, server)| ServerStatus {
                name: name.clone(),
                state: server.state.label().to_string(),
                persistent: server.entry.persistent,
                idle_secs: server.last_activity.map(|at| at.elapsed().as_secs()),
                metrics: server.metrics.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn server_names(&self) -> Vec<String> {
        let servers = self.inner.servers.lock().await;
        servers.keys().cloned().collect()
    }

    fn settings(&self) -> Settings {
        match self.inner.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn classify(&self, server: &str, err: McpClientError) -> ProxyError {
        if err.is_transport() {
            // The close watcher will usually have won this race already.
            let inner = self.inner.clone();
            let server = server.to_string();
            tokio::spawn(async move {
                mark_stopped_if_closed(&inner, &server).await;
            });
        }
        ProxyError::from_client(server, err)
    }

    async fn running_clients(&self) -> Vec<(String, Arc<McpClient>)> {
        let servers = self.inner.servers.lock().await;
        servers
            .iter()
            .filter_map(|(name, server)| match &server.state {
                ServerState::Running(client) => Some((name.clone(), client.clone())),
                _ => None,
            })
            .collect()
    }

    async fn touch(&self, server: &str) {
        touch_activity(&self.inner, server).await;
    }

    async fn record_call(&self, server: &str, elapsed_ms: u64, error: Option<String>) {
        let mut servers = self.inner.servers.lock().await;
        if let Some(record) = servers.get_mut(server) {
            record.metrics.call_count += 1;
            record.metrics.total_latency_ms += elapsed_ms;
            if let Some(error) = error {
                record.metrics.error_count += 1;
                record.metrics.last_error = Some(error);
            }
        }
    }
}

fn build_initialize_params() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "toolmux".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("toolmux".to_string()),
        },
        protocol_version: MCP_SCHEMA_VERSION.to_string(),
    }
}

/// Spawn the child and race its initialize handshake against the startup
/// timeout. On success the record transitions to `Running` and an idle timer
/// is armed; on failure the child is killed and the record lands in `Error`.
async fn start_server(
    inner: Arc<ManagerInner>,
    name: String,
    entry: ServerEntry,
    startup_timeout: Duration,
) -> std::result::Result<Arc<McpClient>, String> {
    info!("starting MCP server `{name}`");
    let started = Instant::now();

    let outcome = async {
        let client = McpClient::new_stdio_client(
            OsString::from(&entry.command),
            entry.args.iter().map(OsString::from).collect(),
            Some(entry.env.clone()),
        )
        .await
        .map_err(|e| e.to_string())?;
        let client = Arc::new(client);

        match client
            .initialize(build_initialize_params(), Some(startup_timeout))
            .await
        {
            Ok(_) => Ok(client),
            Err(McpClientError::Timeout { .. }) => {
                client.kill().await;
                Err(format!("startup timeout after {startup_timeout:?}"))
            }
            Err(e) => {
                client.kill().await;
                Err(format!("initialize handshake failed: {e}"))
            }
        }
    }
    .await;

    match outcome {
        Ok(client) => {
            {
                let mut servers = inner.servers.lock().await;
                if let Some(record) = servers.get_mut(&name) {
                    record.state = ServerState::Running(client.clone());
                    record.last_activity = Some(Instant::now());
                }
            }
            info!(
                "server `{name}` ready in {:?}",
                started.elapsed()
            );
            spawn_close_watcher(inner.clone(), name.clone(), client.clone());
            touch_activity(&inner, &name).await;
            Ok(client)
        }
        Err(reason) => {
            warn!("failed to start `{name}`: {reason}");
            let mut servers = inner.servers.lock().await;
            if let Some(record) = servers.get_mut(&name) {
                record.state = ServerState::Error(reason.clone());
            }
            Err(reason)
        }
    }
}

/// Transition `Running -> Stopped` when the child's transport closes
/// underneath us. No auto-restart: the next call re-spawns.
fn spawn_close_watcher(inner: Arc<ManagerInner>, name: String, client: Arc<McpClient>) {
    tokio::spawn(async move {
        client.wait_closed().await;
        let mut servers = inner.servers.lock().await;
        if let Some(record) = servers.get_mut(&name) {
            if let ServerState::Running(current) = &record.state {
                if Arc::ptr_eq(current, &client) {
                    warn!("server `{name}` closed unexpectedly");
                    record.state = ServerState::Stopped;
                    record.idle_generation += 1;
                }
            }
        }
    });
}

/// Record activity and re-arm the one-shot idle timer. Persistent servers
/// never get a timer.
async fn touch_activity(inner: &Arc<ManagerInner>, name: &str) {
    let timer = {
        let mut servers = inner.servers.lock().await;
        let Some(record) = servers.get_mut(name) else {
            return;
        };
        record.last_activity = Some(Instant::now());
        record.idle_generation += 1;
        if record.entry.persistent {
            None
        } else {
            let settings = match inner.settings.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            Some((
                record.idle_generation,
                settings.effective_idle_timeout(&record.entry),
            ))
        }
    };

    if let Some((generation, idle_timeout)) = timer {
        let inner = inner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            reap_if_idle(&inner, &name, generation).await;
        });
    }
}

async fn reap_if_idle(inner: &Arc<ManagerInner>, name: &str, generation: u64) {
    let client = {
        let mut servers = inner.servers.lock().await;
        let Some(record) = servers.get_mut(name) else {
            return;
        };
        if record.idle_generation != generation {
            return;
        }
        match &record.state {
            ServerState::Running(client) => {
                let client = client.clone();
                record.state = ServerState::Stopped;
                record.idle_generation += 1;
                Some(client)
            }
            _ => None,
        }
    };
    if let Some(client) = client {
        info!("idle timeout reached for `{name}`; stopping");
        client.shutdown(SHUTDOWN_GRACE).await;
    }
}

async fn mark_stopped_if_closed(inner: &Arc<ManagerInner>, name: &str) {
    let mut servers = inner.servers.lock().await;
    if let Some(record) = servers.get_mut(name) {
        if let ServerState::Running(client) = &record.state {
            if client.is_closed() {
                record.state = ServerState::Stopped;
                record.idle_generation += 1;
            }
        }
    }
}
