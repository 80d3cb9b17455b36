//! End-to-end dispatcher flows: cold start with an absent cache, passthrough
//! calls, and the discover/execute meta-tools — all against the bundled
//! `mcp-echo-server` child.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use toolmux_core::ChildManager;
use toolmux_core::ProxyHandler;
use toolmux_core::SchemaCache;
use toolmux_core::config::Config;
use toolmux_core::config::Mode;

const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_mcp-echo-server");

fn echo_config(mode: Mode) -> Config {
    let mut config = Config::default();
    config.settings.mode = mode;
    config.servers.insert(
        "echo".to_string(),
        serde_json::from_value(json!({ "command": ECHO_SERVER })).unwrap(),
    );
    config
}

fn handler_in(dir: &Path, config: Config) -> Arc<ProxyHandler> {
    let cache = Arc::new(SchemaCache::new(dir));
    let manager = ChildManager::new(&config);
    ProxyHandler::new(config, cache, manager)
}

async fn request(handler: &Arc<ProxyHandler>, id: i64, method: &str, params: Value) -> Value {
    let message = handler
        .handle_message(mcp_types::JSONRPCMessage::Request(
            mcp_types::JSONRPCRequest {
                jsonrpc: mcp_types::JSONRPC_VERSION.into(),
                id: mcp_types::RequestId::Integer(id),
                method: method.to_string(),
                params: Some(params),
            },
        ))
        .await
        .expect("expected a response");
    match message {
        mcp_types::JSONRPCMessage::Response(response) => response.result,
        other => panic!("expected a response, got {other:?}"),
    }
}

fn first_text(result: &Value) -> &str {
    result["content"][0]["text"].as_str().expect("text content")
}

#[tokio::test]
async fn cold_start_discovers_tools_then_serves_calls() {
    let dir = tempfile::tempdir().unwrap();
    let handler = handler_in(dir.path(), echo_config(Mode::Passthrough));

    // Cache absent: tools/list is empty until background discovery lands.
    handler.init().await;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let result = request(&handler, 1, "tools/list", json!({})).await;
        let tools = result["tools"].as_array().unwrap();
        if !tools.is_empty() {
            assert_eq!(tools[0]["name"], json!("ping"));
            break;
        }
        assert!(Instant::now() < deadline, "discovery never completed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let result = request(
        &handler,
        2,
        "tools/call",
        json!({ "name": "ping", "arguments": { "msg": "hi" } }),
    )
    .await;
    assert_eq!(first_text(&result), "hi");

    // Discovery persisted the cache for the next cold start.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !dir.path().join("schema-cache.json").exists() {
        assert!(Instant::now() < deadline, "cache never persisted");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    handler.manager().shutdown_all().await;
}

#[tokio::test]
async fn tool_search_mode_discover_then_execute() {
    let dir = tempfile::tempdir().unwrap();
    let handler = handler_in(dir.path(), echo_config(Mode::ToolSearch));
    // Seed the cache as a previous `generate` run would have.
    handler.cache().update_server(
        "echo",
        vec![mcp_types::Tool {
            name: "ping".to_string(),
            description: Some("Echo the given message back".to_string()),
            input_schema: json!({ "type": "object" }),
            extra: serde_json::Map::new(),
        }],
    );
    handler.rebuild_search_index();

    let result = request(&handler, 1, "tools/list", json!({})).await;
    let names: Vec<&str> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["discover", "execute"]);

    let result = request(
        &handler,
        2,
        "tools/call",
        json!({ "name": "discover", "arguments": { "query": "echo message" } }),
    )
    .await;
    let body: Value = serde_json::from_str(first_text(&result)).unwrap();
    assert_eq!(body["results"][0]["tool"], json!("ping"));
    assert_eq!(body["results"][0]["server"], json!("echo"));

    let result = request(
        &handler,
        3,
        "tools/call",
        json!({
            "name": "execute",
            "arguments": { "tool_name": "ping", "arguments": { "msg": "via-execute" } }
        }),
    )
    .await;
    assert_eq!(first_text(&result), "via-execute");

    handler.manager().shutdown_all().await;
}

#[tokio::test]
async fn initialize_and_ping_answer_locally() {
    let dir = tempfile::tempdir().unwrap();
    let handler = handler_in(dir.path(), echo_config(Mode::Passthrough));

    let result = request(
        &handler,
        1,
        "initialize",
        json!({
            "capabilities": {},
            "clientInfo": { "name": "test-host", "version": "0" },
            "protocolVersion": mcp_types::MCP_SCHEMA_VERSION,
        }),
    )
    .await;
    assert_eq!(result["serverInfo"]["name"], json!("toolmux"));

    let result = request(&handler, 2, "ping", json!({})).await;
    assert_eq!(result, json!({}));

    // No children were started by any of this.
    assert_eq!(handler.manager().running_count().await, 0);
}
