//! Transport-agnostic request dispatcher for the host-facing MCP server.
//!
//! Both transports (stdio and SSE) feed [`JSONRPCMessage`]s into
//! [`ProxyHandler::handle_message`] and write whatever comes back. Tool-call
//! failures — unknown tools, startup timeouts, upstream faults — are answered
//! as tool results with `isError: true`; a JSON-RPC protocol error is
//! reserved for malformed requests and unknown methods.

use std::sync::Arc;
use std::sync::RwLock;

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CancelledNotificationParams;
use mcp_types::ClientRequest;
use mcp_types::InitializeRequestParams;
use mcp_types::InitializeResult;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::ListToolsResult;
use mcp_types::RequestId;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesTools;
use mcp_types::Tool;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::child_manager::ChildManager;
use crate::config::Config;
use crate::config::Mode;
use crate::error_code;
use crate::meta_tools;
use crate::meta_tools::DiscoverParams;
use crate::meta_tools::ExecuteParams;
use crate::schema_cache::RouteEntry;
use crate::schema_cache::SchemaCache;
use crate::schema_cache::log_load_outcome;
use crate::schema_cache::qualified_tool_name;
use crate::search::IndexedTool;
use crate::search::SearchIndex;

/// Characters truncated descriptions keep in discover results.
const DISCOVER_DESCRIPTION_LIMIT: usize = 200;

pub struct ProxyHandler {
    config: RwLock<Arc<Config>>,
    cache: Arc<SchemaCache>,
    manager: ChildManager,
    search: RwLock<Arc<SearchIndex>>,
}

impl ProxyHandler {
    pub fn new(config: Config, cache: Arc<SchemaCache>, manager: ChildManager) -> Arc<Self> {
        let handler = Arc::new(ProxyHandler {
            config: RwLock::new(Arc::new(config)),
            cache,
            manager,
            search: RwLock::new(Arc::new(SearchIndex::default())),
        });
        handler.rebuild_search_index();
        handler
    }

    pub fn config(&self) -> Arc<Config> {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    pub fn manager(&self) -> &ChildManager {
        &self.manager
    }

    /// Load the persistent cache and warm things up: discover servers the
    /// cache does not know yet, then preload whatever the settings ask for.
    /// Returns once the cache is usable; discovery and preload continue in
    /// the background.
    pub async fn init(self: &Arc<Self>) {
        let outcome = self.cache.load().await;
        log_load_outcome(&outcome, self.cache.cache_path());
        self.rebuild_search_index();

        let handler = self.clone();
        tokio::spawn(async move {
            handler.discover_uncached_servers().await;
            let config = handler.config();
            let names = config.settings.preload.select(&config.server_names());
            handler.manager.preload(&names).await;
        });
    }

    /// Swap in a reloaded config snapshot and propagate it everywhere.
    pub async fn reload_config(&self, config: Config) {
        info!("config reloaded: {} servers", config.servers.len());
        self.manager.update_config(&config).await;
        self.cache.retain_servers(&config.server_names());
        let config = Arc::new(config);
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        self.rebuild_search_index();
    }

    /// Rebuild the BM25 index from the current cache snapshot.
    pub fn rebuild_search_index(&self) {
        let mut docs = Vec::new();
        for server in self.cache.server_names() {
            let Some(tools) = self.cache.tools_for_server(&server) else {
                continue;
            };
            for tool in tools {
                docs.push(IndexedTool {
                    exposed_name: qualified_tool_name(&server, &tool.name),
                    original_name: tool.name.clone(),
                    server: server.clone(),
                    tool,
                });
            }
        }
        let index = Arc::new(SearchIndex::build(docs));
        match self.search.write() {
            Ok(mut guard) => *guard = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
    }

    fn search_index(&self) -> Arc<SearchIndex> {
        match self.search.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Spawn each configured server the cache has never seen, capture its
    /// tool list, and persist. Sequential so a cold start does not fork the
    /// whole fleet at once.
    async fn discover_uncached_servers(self: &Arc<Self>) {
        let config = self.config();
        let cached = self.cache.server_names();
        let missing: Vec<String> = config
            .server_names()
            .into_iter()
            .filter(|name| !cached.contains(name))
            .collect();
        if missing.is_empty() {
            return;
        }
        info!("discovering tools for {} uncached servers", missing.len());
        let mut changed = false;
        for name in missing {
            match self.manager.discover_tools(&name).await {
                Ok(tools) => {
                    debug!("discovered {} tools from `{name}`", tools.len());
                    self.cache.update_server(&name, tools);
                    changed = true;
                }
                Err(e) => warn!("discovery failed for `{name}`: {e}"),
            }
        }
        if changed {
            self.rebuild_search_index();
            if let Err(e) = self.cache.save().await {
                warn!("failed to persist schema cache: {e}");
            }
        }
    }

    /// Dispatch one frame from the host. `None` means nothing goes back
    /// (notifications, and frames that are not requests).
    pub async fn handle_message(&self, message: JSONRPCMessage) -> Option<JSONRPCMessage> {
        match message {
            JSONRPCMessage::Request(request) => Some(self.handle_request(request).await),
            JSONRPCMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                None
            }
            JSONRPCMessage::Response(_) | JSONRPCMessage::Error(_) => None,
        }
    }

    async fn handle_request(&self, request: JSONRPCRequest) -> JSONRPCMessage {
        let request_id = request.id.clone();
        let method = request.method.clone();
        let client_request = match ClientRequest::try_from(request) {
            Ok(client_request) => client_request,
            Err(_) => {
                warn!("unknown method from host: {method}");
                return JSONRPCMessage::error(
                    request_id,
                    JSONRPCErrorError {
                        code: error_code::METHOD_NOT_FOUND_ERROR_CODE,
                        message: format!("Method not found: {method}"),
                        data: None,
                    },
                );
            }
        };

        match client_request {
            ClientRequest::Initialize(params) => {
                respond(request_id, self.handle_initialize(params))
            }
            ClientRequest::ListTools(_) => respond(request_id, self.handle_tools_list()),
            ClientRequest::CallTool(params) => {
                let result = self.handle_tools_call(params).await;
                respond(request_id, result)
            }
            ClientRequest::Ping => respond(request_id, json!({})),
            ClientRequest::Complete(_) => {
                respond(request_id, json!({ "completion": { "values": [] } }))
            }
            ClientRequest::ListPrompts(_) => {
                let result = self.aggregate_list("prompts/list", "prompts", "name").await;
                respond(request_id, result)
            }
            ClientRequest::GetPrompt(params) => {
                self.forward_prefixed(request_id, "prompts/get", "name", params)
                    .await
            }
            ClientRequest::ListResources(_) => {
                let result = self.aggregate_list("resources/list", "resources", "uri").await;
                respond(request_id, result)
            }
            ClientRequest::ListResourceTemplates(_) => {
                let result = self
                    .aggregate_list(
                        "resources/templates/list",
                        "resourceTemplates",
                        "uriTemplate",
                    )
                    .await;
                respond(request_id, result)
            }
            ClientRequest::ReadResource(params) => {
                self.forward_prefixed(request_id, "resources/read", "uri", params)
                    .await
            }
        }
    }

    async fn handle_notification(&self, notification: JSONRPCNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => debug!("host finished initialize"),
            "notifications/cancelled" => {
                let params = notification.params.unwrap_or(Value::Null);
                match serde_json::from_value::<CancelledNotificationParams>(params) {
                    Ok(params) => {
                        // The manager does not track which child owns the id;
                        // children ignore cancellations they do not recognize.
                        self.manager
                            .cancel_running(params.request_id, params.reason)
                            .await;
                    }
                    Err(e) => debug!("ignoring malformed cancellation: {e}"),
                }
            }
            other => debug!("ignoring notification: {other}"),
        }
    }

    fn handle_initialize(&self, params: InitializeRequestParams) -> InitializeResult {
        let config = self.config();
        info!(
            "initialize from {} (mode={:?}, servers={})",
            params.client_info.name,
            config.settings.mode,
            config.servers.len()
        );
        let instructions = match config.settings.mode {
            Mode::ToolSearch => Some(
                "Tools are exposed through two meta-tools. Call discover(query) to find \
                 tools across the connected servers, then execute(tool_name, arguments) \
                 to run one."
                    .to_string(),
            ),
            Mode::Passthrough => None,
        };
        InitializeResult {
            capabilities: ServerCapabilities {
                completions: None,
                experimental: None,
                logging: None,
                prompts: Some(json!({})),
                resources: Some(json!({})),
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(true),
                }),
            },
            instructions,
            protocol_version: params.protocol_version,
            server_info: mcp_types::Implementation {
                name: "toolmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("toolmux".to_string()),
            },
        }
    }

    fn handle_tools_list(&self) -> ListToolsResult {
        let config = self.config();
        let tools: Vec<Tool> = match config.settings.mode {
            Mode::Passthrough => self
                .cache
                .all_tools(config.settings.prefix_tools)
                .into_iter()
                .map(|exposed| exposed.tool)
                .collect(),
            Mode::ToolSearch => {
                meta_tools::descriptors(&config.server_names(), self.cache.tool_count())
            }
        };
        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    async fn handle_tools_call(&self, params: CallToolRequestParams) -> CallToolResult {
        let config = self.config();
        let CallToolRequestParams { name, arguments } = params;
        match config.settings.mode {
            Mode::Passthrough => self.forward_tool_call(&name, arguments).await,
            Mode::ToolSearch => match name.as_str() {
                meta_tools::DISCOVER_TOOL_NAME => self.handle_discover(arguments),
                meta_tools::EXECUTE_TOOL_NAME => self.handle_execute(arguments).await,
                other => CallToolResult::error_text(format!(
                    "Unknown tool `{other}`. This proxy exposes `discover` and `execute`; \
                     call `discover` first to find tools."
                )),
            },
        }
    }

    async fn forward_tool_call(&self, exposed: &str, arguments: Option<Value>) -> CallToolResult {
        let Some(route) = self.cache.resolve_tool(exposed) else {
            return CallToolResult::error_text(format!(
                "Unknown tool `{exposed}`: no cached server declares it"
            ));
        };
        self.call_route(&route, arguments).await
    }

    async fn call_route(&self, route: &RouteEntry, arguments: Option<Value>) -> CallToolResult {
        match self
            .manager
            .call_tool(&route.server, &route.tool, arguments)
            .await
        {
            Ok(result) => result,
            Err(e) => CallToolResult::error_text(e.to_string()),
        }
    }

    fn handle_discover(&self, arguments: Option<Value>) -> CallToolResult {
        let params: DiscoverParams =
            match serde_json::from_value(arguments.unwrap_or_else(|| json!({}))) {
                Ok(params) => params,
                Err(e) => {
                    return CallToolResult::error_text(format!("Invalid discover arguments: {e}"));
                }
            };

        let config = self.config();
        let mut available_servers = config.server_names();
        available_servers.sort();
        let index = self.search_index();

        let query = params.query.trim();
        if query.is_empty() {
            let body = json!({
                "query": "",
                "total_indexed": index.len(),
                "total_servers": available_servers.len(),
                "available_servers": available_servers,
                "results": [],
                "usage": "Provide a natural language query, e.g. discover(\"git commit\") \
                          or discover(\"read a file\"). Then call execute(tool_name, \
                          arguments) with a tool from the results.",
            });
            return text_result(&body);
        }

        let hits = index.search(query, params.limit());
        let results: Vec<Value> = hits
            .iter()
            .map(|hit| {
                let description: String = hit
                    .tool
                    .tool
                    .description
                    .as_deref()
                    .unwrap_or("")
                    .chars()
                    .take(DISCOVER_DESCRIPTION_LIMIT)
                    .collect();
                json!({
                    "server": hit.tool.server,
                    "tool": hit.tool.original_name,
                    "description": description,
                    "score": hit.score,
                    "inputSchema": meta_tools::strip_schema(&hit.tool.tool.input_schema),
                })
            })
            .collect();

        let body = json!({
            "query": query,
            "total_indexed": index.len(),
            "total_servers": available_servers.len(),
            "available_servers": available_servers,
            "results": results,
            "usage": "Call execute(tool_name, arguments) to run one of these tools.",
        });
        text_result(&body)
    }

    async fn handle_execute(&self, arguments: Option<Value>) -> CallToolResult {
        let params: ExecuteParams =
            match serde_json::from_value(arguments.unwrap_or_else(|| json!({}))) {
                Ok(params) => params,
                Err(e) => {
                    return CallToolResult::error_text(format!("Invalid execute arguments: {e}"));
                }
            };

        let Some(route) = self.resolve_execute(&params.tool_name, params.server.as_deref()) else {
            return CallToolResult::error_text(format!(
                "Unknown tool `{}`. Call `discover` to list available tools.",
                params.tool_name
            ));
        };
        let arguments = Some(params.arguments.unwrap_or_else(|| json!({})));
        self.call_route(&route, arguments).await
    }

    /// Resolve an `execute` target. The tool name is the primary key: exact
    /// exposed/bare names first, then a separator- and case-insensitive
    /// match. An explicit server narrows the search the same way.
    fn resolve_execute(&self, tool_name: &str, server: Option<&str>) -> Option<RouteEntry> {
        if server.is_none() {
            if let Some(route) = self.cache.resolve_tool(tool_name) {
                return Some(route);
            }
        }

        let wanted_server = server.map(normalize);
        let wanted_tool = normalize(tool_name);
        let index = self.search_index();
        index
            .tools()
            .iter()
            .find(|doc| {
                let server_matches = match &wanted_server {
                    Some(wanted) => normalize(&doc.server) == *wanted,
                    None => true,
                };
                server_matches
                    && (doc.original_name == tool_name || normalize(&doc.original_name) == wanted_tool)
            })
            .map(|doc| RouteEntry {
                server: doc.server.clone(),
                tool: doc.original_name.clone(),
            })
    }

    /// Aggregate a list-shaped method across running children, prefixing the
    /// `key` field of each item with the owning server.
    async fn aggregate_list(&self, method: &str, field: &str, key: &str) -> Value {
        let results = self.manager.request_all_running(method, json!({})).await;
        let mut merged = Vec::new();
        for (server_name, result) in results {
            let Ok(mut value) = result else {
                continue;
            };
            if let Some(items) = value.get_mut(field).and_then(Value::as_array_mut) {
                for item in items.iter_mut() {
                    if let Some(id) = item.get(key).and_then(Value::as_str) {
                        item[key] = json!(format!("{server_name}__{id}"));
                    }
                    merged.push(item.clone());
                }
            }
        }
        json!({ field: merged })
    }

    /// Forward a `prompts/get` / `resources/read` style request whose `key`
    /// field carries a `<server>__` prefix.
    async fn forward_prefixed(
        &self,
        request_id: RequestId,
        method: &str,
        key: &str,
        params: Value,
    ) -> JSONRPCMessage {
        let prefixed = params.get(key).and_then(Value::as_str).unwrap_or("");
        let Some((server, original)) = prefixed
            .split_once("__")
            .map(|(s, o)| (s.to_string(), o.to_string()))
        else {
            return JSONRPCMessage::error(
                request_id,
                JSONRPCErrorError {
                    code: error_code::INVALID_PARAMS_ERROR_CODE,
                    message: format!("expected `{key}` of the form <server>__<{key}>"),
                    data: None,
                },
            );
        };
        let mut forwarded = params;
        forwarded[key] = json!(original);
        match self.manager.request(&server, method, forwarded).await {
            Ok(result) => JSONRPCMessage::response(request_id, result),
            Err(e) => JSONRPCMessage::error(
                request_id,
                JSONRPCErrorError {
                    code: error_code::INTERNAL_ERROR_CODE,
                    message: e.to_string(),
                    data: None,
                },
            ),
        }
    }
}

fn respond<T: Serialize>(id: RequestId, result: T) -> JSONRPCMessage {
    match serde_json::to_value(result) {
        Ok(value) => JSONRPCMessage::response(id, value),
        Err(e) => JSONRPCMessage::error(
            id,
            JSONRPCErrorError {
                code: error_code::INTERNAL_ERROR_CODE,
                message: format!("failed to serialize response: {e}"),
                data: None,
            },
        ),
    }
}

fn text_result(body: &Value) -> CallToolResult {
    let text = serde_json::to_string(body).unwrap_or_else(|_| body.to_string());
    CallToolResult {
        content: vec![mcp_types::ContentBlock::text(text)],
        is_error: None,
        structured_content: None,
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
