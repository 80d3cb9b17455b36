//! Child lifecycle tests against a real MCP child process (the bundled
//! `mcp-echo-server` binary).

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::json;
use toolmux_core::ChildManager;
use toolmux_core::ProxyError;
use toolmux_core::config::Config;

const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_mcp-echo-server");

fn config_with_entry(name: &str, entry: serde_json::Value) -> Config {
    let mut config = Config::default();
    config
        .servers
        .insert(name.to_string(), serde_json::from_value(entry).unwrap());
    config
}

fn echo_config(idle_timeout_secs: Option<u64>, persistent: bool) -> Config {
    let mut entry = json!({ "command": ECHO_SERVER });
    if let Some(secs) = idle_timeout_secs {
        entry["idleTimeout"] = json!(secs);
    }
    if persistent {
        entry["persistent"] = json!(true);
    }
    config_with_entry("echo", entry)
}

fn text_of(result: &mcp_types::CallToolResult) -> &str {
    match &result.content[0] {
        mcp_types::ContentBlock::TextContent(text) => &text.text,
        other => panic!("expected text content, got {other:?}"),
    }
}

#[tokio::test]
async fn cold_start_call_returns_echo() {
    let manager = ChildManager::new(&echo_config(None, false));
    let result = manager
        .call_tool("echo", "ping", Some(json!({ "msg": "hi" })))
        .await
        .unwrap();
    assert_eq!(text_of(&result), "hi");
    assert_eq!(manager.running_count().await, 1);
    manager.shutdown_all().await;
    assert_eq!(manager.running_count().await, 0);
}

#[tokio::test]
async fn concurrent_first_calls_share_one_spawn() {
    let manager = ChildManager::new(&echo_config(None, false));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(
            async move { manager.get_client("echo").await },
        ));
    }
    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap().unwrap());
    }

    // Every caller resolved to the same client handle: one child process.
    for client in &clients[1..] {
        assert!(Arc::ptr_eq(&clients[0], client));
    }
    assert_eq!(manager.running_count().await, 1);
    manager.shutdown_all().await;
}

#[tokio::test]
async fn concurrent_tool_calls_both_succeed() {
    let manager = ChildManager::new(&echo_config(None, false));
    let (a, b) = tokio::join!(
        manager.call_tool("echo", "ping", Some(json!({ "msg": "a" }))),
        manager.call_tool("echo", "ping", Some(json!({ "msg": "b" }))),
    );
    assert_eq!(text_of(&a.unwrap()), "a");
    assert_eq!(text_of(&b.unwrap()), "b");
    assert_eq!(manager.running_count().await, 1);
    manager.shutdown_all().await;
}

#[tokio::test]
async fn idle_child_is_reaped_after_its_timeout() {
    let manager = ChildManager::new(&echo_config(Some(1), false));
    manager
        .call_tool("echo", "ping", Some(json!({ "msg": "x" })))
        .await
        .unwrap();
    assert_eq!(manager.running_count().await, 1);

    // Not reaped before the timeout elapses...
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.running_count().await, 1);

    // ...but reaped shortly after.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if manager.running_count().await == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "child was never idle-reaped");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn persistent_child_is_never_reaped() {
    let manager = ChildManager::new(&echo_config(Some(1), true));
    manager
        .call_tool("echo", "ping", Some(json!({ "msg": "x" })))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(manager.running_count().await, 1);
    manager.shutdown_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn startup_timeout_kills_child_and_fails_callers() {
    let mut config = config_with_entry("slow", json!({ "command": "sleep", "args": ["60"] }));
    config.settings.startup_timeout = 500;

    let manager = ChildManager::new(&config);
    let started = Instant::now();
    let err = manager
        .call_tool("slow", "anything", None)
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("startup timeout"),
        "unexpected error: {err}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.running_count().await, 0);

    let status = manager.status().await;
    assert_eq!(status[0].state, "error");
}

#[tokio::test]
async fn spawn_failure_is_a_startup_error() {
    let config = config_with_entry(
        "ghost",
        json!({ "command": "/nonexistent/toolmux-test-binary" }),
    );
    let manager = ChildManager::new(&config);
    let err = manager.get_client("ghost").await.unwrap_err();
    assert!(matches!(err, ProxyError::Startup { .. }), "got {err:?}");
}

#[tokio::test]
async fn unknown_server_is_rejected() {
    let manager = ChildManager::new(&Config::default());
    let err = manager.get_client("nope").await.unwrap_err();
    assert!(matches!(err, ProxyError::UnknownServer(_)));
}

#[tokio::test]
async fn stopped_server_respawns_on_next_call() {
    let manager = ChildManager::new(&echo_config(None, false));
    manager
        .call_tool("echo", "ping", Some(json!({ "msg": "one" })))
        .await
        .unwrap();
    manager.stop_server("echo").await.unwrap();
    assert_eq!(manager.running_count().await, 0);

    let result = manager
        .call_tool("echo", "ping", Some(json!({ "msg": "two" })))
        .await
        .unwrap();
    assert_eq!(text_of(&result), "two");
    assert_eq!(manager.running_count().await, 1);
    manager.shutdown_all().await;
}

#[tokio::test]
async fn discover_tools_lists_ping() {
    let manager = ChildManager::new(&echo_config(None, false));
    let tools = manager.discover_tools("echo").await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "ping");
    manager.shutdown_all().await;
}

#[tokio::test]
async fn metrics_count_calls_and_errors() {
    let manager = ChildManager::new(&echo_config(None, false));
    manager
        .call_tool("echo", "ping", Some(json!({ "msg": "x" })))
        .await
        .unwrap();
    let status = manager.status().await;
    assert_eq!(status[0].metrics.call_count, 1);
    assert_eq!(status[0].metrics.error_count, 0);
    manager.shutdown_all().await;
}
