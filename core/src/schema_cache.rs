//! Persistent tool-schema cache and the routing table derived from it.
//!
//! The cache is the reason the host never waits on N servers at boot: tool
//! schemas are served from the last `generate`/discovery run while children
//! stay stopped. Readers are lock-free in spirit — every mutation builds a
//! fresh immutable snapshot and swaps an `Arc`, so a concurrent
//! `all_tools` sees either the old table or the new one, never a tear.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use mcp_types::Tool;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha1::Digest;
use sha1::Sha1;
use tracing::info;
use tracing::warn;

use crate::error::ProxyError;
use crate::error::Result;

pub const SCHEMA_CACHE_FILE: &str = "schema-cache.json";

const CACHE_VERSION: u32 = 1;

/// Separates the server name from the tool name in a prefixed tool name.
/// Hosts commonly restrict tool names to `^[a-zA-Z0-9_-]+$`, so the
/// delimiter must come from that set.
pub const TOOL_NAME_DELIMITER: &str = "__";
const MAX_TOOL_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSchemaCache {
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub tools: Vec<Tool>,
    #[serde(rename = "cachedAt")]
    pub cached_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullCache {
    pub version: u32,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    pub servers: IndexMap<String, ServerSchemaCache>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for FullCache {
    fn default() -> Self {
        FullCache {
            version: CACHE_VERSION,
            generated_at: Utc::now(),
            servers: IndexMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Where a host-visible tool name leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub server: String,
    /// Tool name as the upstream server declared it.
    pub tool: String,
}

/// One tool as offered to the host in a given exposure mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposedTool {
    pub exposed_name: String,
    pub server: String,
    pub tool: Tool,
}

struct CacheSnapshot {
    cache: FullCache,
    routes: HashMap<String, RouteEntry>,
    prefixed: Vec<ExposedTool>,
    bare: Vec<ExposedTool>,
}

pub enum CacheLoadOutcome {
    Loaded { servers: usize, tools: usize },
    Missing,
    /// Reported and then treated exactly like `Missing`.
    Corrupt(String),
}

pub struct SchemaCache {
    cache_path: PathBuf,
    inner: RwLock<Arc<CacheSnapshot>>,
}

impl SchemaCache {
    pub fn new(cache_dir: &Path) -> Self {
        SchemaCache {
            cache_path: cache_dir.join(SCHEMA_CACHE_FILE),
            inner: RwLock::new(Arc::new(build_snapshot(FullCache::default()))),
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Read the cache file if present. Corruption is a warning, not an
    /// error: the proxy starts with an empty cache and repopulates on
    /// first discovery.
    pub async fn load(&self) -> CacheLoadOutcome {
        let contents = match tokio::fs::read_to_string(&self.cache_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CacheLoadOutcome::Missing;
            }
            Err(e) => return CacheLoadOutcome::Corrupt(e.to_string()),
        };
        match serde_json::from_str::<FullCache>(&contents) {
            Ok(cache) => {
                let servers = cache.servers.len();
                let tools = cache.servers.values().map(|s| s.tools.len()).sum();
                self.swap(cache);
                CacheLoadOutcome::Loaded { servers, tools }
            }
            Err(e) => CacheLoadOutcome::Corrupt(e.to_string()),
        }
    }

    /// Persist atomically: serialize to a sibling temp file, then rename.
    pub async fn save(&self) -> Result<()> {
        let json = {
            let snapshot = self.snapshot();
            serde_json::to_string_pretty(&snapshot.cache)
                .map_err(|e| ProxyError::Cache(format!("serializing cache: {e}")))?
        };
        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::Cache(format!("creating {}: {e}", parent.display())))?;
        }
        let tmp = self.cache_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ProxyError::Cache(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.cache_path)
            .await
            .map_err(|e| {
                ProxyError::Cache(format!("renaming into {}: {e}", self.cache_path.display()))
            })?;
        Ok(())
    }

    /// Replace one server's tools and rebuild the routing table.
    pub fn update_server(&self, name: &str, tools: Vec<Tool>) {
        let mut cache = self.snapshot().cache.clone();
        cache.servers.insert(
            name.to_string(),
            ServerSchemaCache {
                server_name: name.to_string(),
                tools,
                cached_at: Utc::now(),
                extra: serde_json::Map::new(),
            },
        );
        cache.generated_at = Utc::now();
        self.swap(cache);
    }

    /// Drop cached servers that are no longer configured (config reload).
    pub fn retain_servers(&self, configured: &[String]) {
        let mut cache = self.snapshot().cache.clone();
        let before = cache.servers.len();
        cache.servers.retain(|name, _| configured.contains(name));
        if cache.servers.len() != before {
            cache.generated_at = Utc::now();
            self.swap(cache);
        }
    }

    /// Tools as the host should see them. With `prefix` set every name is
    /// rewritten to `<server>__<tool>`; without it, colliding names expose
    /// only the first server's tool.
    pub fn all_tools(&self, prefix: bool) -> Vec<ExposedTool> {
        let snapshot = self.snapshot();
        if prefix {
            snapshot.prefixed.clone()
        } else {
            snapshot.bare.clone()
        }
    }

    /// Owning server for an exposed tool name, if any.
    pub fn server_for_tool(&self, name: &str) -> Option<String> {
        self.snapshot().routes.get(name).map(|r| r.server.clone())
    }

    /// Full route (server + original tool name) for an exposed name.
    pub fn resolve_tool(&self, name: &str) -> Option<RouteEntry> {
        self.snapshot().routes.get(name).cloned()
    }

    /// Strip the `<server>__` prefix when prefixing is enabled. Names that
    /// were sha1-truncated resolve through the routing table instead of
    /// textually.
    pub fn original_tool_name(&self, exposed: &str, prefix: bool) -> String {
        if !prefix {
            return exposed.to_string();
        }
        if let Some(route) = self.resolve_tool(exposed) {
            return route.tool;
        }
        exposed
            .split_once(TOOL_NAME_DELIMITER)
            .map(|(_, tool)| tool.to_string())
            .unwrap_or_else(|| exposed.to_string())
    }

    pub fn server_names(&self) -> Vec<String> {
        self.snapshot().cache.servers.keys().cloned().collect()
    }

    pub fn tool_count(&self) -> usize {
        let snapshot = self.snapshot();
        snapshot.cache.servers.values().map(|s| s.tools.len()).sum()
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.snapshot().cache.generated_at
    }

    pub fn tools_for_server(&self, name: &str) -> Option<Vec<Tool>> {
        self.snapshot()
            .cache
            .servers
            .get(name)
            .map(|s| s.tools.clone())
    }

    fn snapshot(&self) -> Arc<CacheSnapshot> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn swap(&self, cache: FullCache) {
        let snapshot = Arc::new(build_snapshot(cache));
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// Rebuild the routing table from scratch. Server iteration follows the
/// cache's insertion order, which follows the config's declared order; that
/// order is what makes the "first server wins" collision policy
/// deterministic.
fn build_snapshot(cache: FullCache) -> CacheSnapshot {
    let mut routes: HashMap<String, RouteEntry> = HashMap::new();
    let mut prefixed = Vec::new();
    let mut bare: Vec<ExposedTool> = Vec::new();
    let mut bare_owner: HashMap<String, String> = HashMap::new();

    for (server_name, server) in &cache.servers {
        for tool in &server.tools {
            let route = RouteEntry {
                server: server_name.clone(),
                tool: tool.name.clone(),
            };

            let qualified = qualified_tool_name(server_name, &tool.name);
            if routes.contains_key(&qualified) {
                warn!("skipping duplicated tool {qualified}");
            } else {
                routes.insert(qualified.clone(), route.clone());
                let mut exposed = tool.clone();
                exposed.name = qualified.clone();
                prefixed.push(ExposedTool {
                    exposed_name: qualified,
                    server: server_name.clone(),
                    tool: exposed,
                });
            }

            match bare_owner.get(&tool.name) {
                Some(first) => {
                    warn!(
                        "tool `{}` is declared by both `{first}` and `{server_name}`; \
                         keeping `{first}` (enable prefixTools to expose both)",
                        tool.name
                    );
                }
                None => {
                    bare_owner.insert(tool.name.clone(), server_name.clone());
                    routes.entry(tool.name.clone()).or_insert(route);
                    bare.push(ExposedTool {
                        exposed_name: tool.name.clone(),
                        server: server_name.clone(),
                        tool: tool.clone(),
                    });
                }
            }
        }
    }

    CacheSnapshot {
        cache,
        routes,
        prefixed,
        bare,
    }
}

/// `<server>__<tool>`, truncated with a sha1 suffix when the result would
/// exceed the 64-character tool-name limit.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    let mut qualified = format!("{server}{TOOL_NAME_DELIMITER}{tool}");
    if qualified.len() > MAX_TOOL_NAME_LENGTH {
        let mut hasher = Sha1::new();
        hasher.update(qualified.as_bytes());
        let sha1 = hasher.finalize();
        let sha1_str = format!("{sha1:x}");

        // Truncate to make room for the hash suffix
        let prefix_len = MAX_TOOL_NAME_LENGTH - sha1_str.len();
        qualified = format!("{}{}", &qualified[..prefix_len], sha1_str);
    }
    qualified
}

/// Load outcome logging shared by the CLI entry points.
pub fn log_load_outcome(outcome: &CacheLoadOutcome, cache_path: &Path) {
    match outcome {
        CacheLoadOutcome::Loaded { servers, tools } => {
            info!("schema cache ready: {tools} tools from {servers} servers");
        }
        CacheLoadOutcome::Missing => {
            warn!(
                "no schema cache at {}; run `toolmux generate` for instant startup",
                cache_path.display()
            );
        }
        CacheLoadOutcome::Corrupt(reason) => {
            warn!(
                "schema cache at {} is unreadable ({reason}); treating as missing",
                cache_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: json!({ "type": "object" }),
            extra: serde_json::Map::new(),
        }
    }

    fn cache_in(dir: &Path) -> SchemaCache {
        SchemaCache::new(dir)
    }

    #[tokio::test]
    async fn save_then_load_round_trips_up_to_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.update_server("git", vec![tool("commit", "Create a commit")]);
        cache.update_server("fs", vec![tool("read", "Read a file")]);
        cache.save().await.unwrap();

        let reloaded = cache_in(dir.path());
        match reloaded.load().await {
            CacheLoadOutcome::Loaded { servers, tools } => {
                assert_eq!(servers, 2);
                assert_eq!(tools, 2);
            }
            _ => panic!("expected loaded cache"),
        }
        assert_eq!(reloaded.server_names(), vec!["git", "fs"]);
        assert_eq!(
            reloaded.tools_for_server("git").unwrap(),
            vec![tool("commit", "Create a commit")]
        );
    }

    #[tokio::test]
    async fn corrupt_cache_behaves_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SCHEMA_CACHE_FILE), "{ not json").unwrap();
        let cache = cache_in(dir.path());
        assert!(matches!(
            cache.load().await,
            CacheLoadOutcome::Corrupt(_)
        ));
        assert_eq!(cache.tool_count(), 0);
    }

    #[tokio::test]
    async fn reader_tolerates_forward_compatible_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SCHEMA_CACHE_FILE),
            serde_json::to_string(&json!({
                "version": 1,
                "generatedAt": "2026-01-05T12:00:00Z",
                "checksum": "abc123",
                "servers": {
                    "echo": {
                        "serverName": "echo",
                        "cachedAt": "2026-01-05T12:00:00Z",
                        "ttlSecs": 60,
                        "tools": [ { "name": "ping", "inputSchema": {} } ]
                    }
                }
            }))
            .unwrap(),
        )
        .unwrap();
        let cache = cache_in(dir.path());
        assert!(matches!(
            cache.load().await,
            CacheLoadOutcome::Loaded { servers: 1, tools: 1 }
        ));
        assert_eq!(cache.server_for_tool("ping"), Some("echo".to_string()));
    }

    #[test]
    fn prefix_round_trip_resolves_server_and_original_name() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.update_server("git", vec![tool("commit", "Create a commit")]);

        let exposed = cache.all_tools(true);
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed[0].exposed_name, "git__commit");
        assert_eq!(cache.server_for_tool("git__commit"), Some("git".into()));
        assert_eq!(cache.original_tool_name("git__commit", true), "commit");
        // Without prefixing the exposed name is already the original.
        assert_eq!(cache.original_tool_name("commit", false), "commit");
    }

    #[test]
    fn collision_without_prefix_keeps_first_server() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.update_server("alpha", vec![tool("list", "List things")]);
        cache.update_server("beta", vec![tool("list", "List other things")]);

        let bare = cache.all_tools(false);
        let listed: Vec<&str> = bare.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(listed, vec!["list"]);
        assert_eq!(cache.server_for_tool("list"), Some("alpha".into()));

        // Prefixed view exposes both.
        let prefixed = cache.all_tools(true);
        let names: Vec<&str> = prefixed.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["alpha__list", "beta__list"]);
        assert_eq!(cache.server_for_tool("beta__list"), Some("beta".into()));
    }

    #[test]
    fn routing_table_never_maps_a_tool_to_a_missing_server() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.update_server("git", vec![tool("commit", "c"), tool("push", "p")]);
        cache.update_server("fs", vec![tool("read", "r")]);
        cache.retain_servers(&["fs".to_string()]);

        assert_eq!(cache.server_for_tool("commit"), None);
        assert_eq!(cache.server_for_tool("git__push"), None);
        assert_eq!(cache.server_for_tool("read"), Some("fs".into()));
    }

    #[test]
    fn long_qualified_names_are_sha1_truncated() {
        let name = qualified_tool_name(
            "my_server",
            "extremely_lengthy_function_name_that_absolutely_surpasses_all_reasonable_limits",
        );
        assert_eq!(name.len(), 64);
        assert_eq!(
            name,
            "my_server__extremely_lena02e507efc5a9de88637e436690364fd4219e4ef"
        );
    }

    #[test]
    fn truncated_names_still_resolve_through_the_routing_table() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let long = "extremely_lengthy_function_name_that_absolutely_surpasses_all_reasonable_limits";
        cache.update_server("my_server", vec![tool(long, "long")]);

        let exposed = cache.all_tools(true);
        assert_eq!(exposed[0].exposed_name.len(), 64);
        let route = cache.resolve_tool(&exposed[0].exposed_name).unwrap();
        assert_eq!(route.server, "my_server");
        assert_eq!(route.tool, long);
        assert_eq!(
            cache.original_tool_name(&exposed[0].exposed_name, true),
            long
        );
    }
}
