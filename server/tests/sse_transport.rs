//! Drives the SSE transport in-process: open the stream, pick up the
//! endpoint event, post JSON-RPC, and read responses off the stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use toolmux_core::ChildManager;
use toolmux_core::ProxyHandler;
use toolmux_core::SchemaCache;
use toolmux_core::config::Config;
use toolmux_core::config::Mode;

struct SseClient {
    stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>,
    >,
    buffer: String,
}

impl SseClient {
    /// Next full SSE dispatch (up to a blank line), as (event, data).
    async fn next_event(&mut self) -> (String, String) {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..end + 2).collect();
                let mut event = String::new();
                let mut data = String::new();
                for line in raw.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        data.push_str(rest);
                    }
                }
                if event.is_empty() && data.is_empty() {
                    // Comment-only dispatch (keepalive); skip it.
                    continue;
                }
                return (event, data);
            }
            let chunk = tokio::time::timeout(Duration::from_secs(10), self.stream.next())
                .await
                .expect("timed out waiting for SSE data")
                .expect("stream ended")
                .expect("stream error");
            self.buffer
                .push_str(std::str::from_utf8(&chunk).expect("utf8"));
        }
    }
}

async fn start_server(mode: Mode) -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.settings.mode = mode;
    let cache = Arc::new(SchemaCache::new(dir.path()));
    cache.update_server(
        "echo",
        vec![mcp_types::Tool {
            name: "ping".to_string(),
            description: Some("Echo a message".to_string()),
            input_schema: json!({ "type": "object" }),
            extra: serde_json::Map::new(),
        }],
    );
    config.servers.insert(
        "echo".to_string(),
        serde_json::from_value(json!({ "command": "true" })).unwrap(),
    );
    let manager = ChildManager::new(&config);
    let handler = ProxyHandler::new(config, cache, manager);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, toolmux_server::sse::app(handler))
            .await
            .unwrap();
    });
    (format!("http://{addr}"), dir)
}

async fn open_session(base: &str) -> (SseClient, String) {
    let response = reqwest::get(format!("{base}/sse")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let mut client = SseClient {
        stream: Box::pin(response.bytes_stream()),
        buffer: String::new(),
    };
    let (event, endpoint) = client.next_event().await;
    assert_eq!(event, "endpoint");
    assert!(endpoint.starts_with("/message?sessionId="));
    (client, format!("{base}{endpoint}"))
}

#[tokio::test]
async fn sse_round_trip_initialize_and_tools_list() {
    let (base, _dir) = start_server(Mode::Passthrough).await;
    let (mut client, endpoint) = open_session(&base).await;

    let http = reqwest::Client::new();
    let post = http
        .post(&endpoint)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "capabilities": {},
                "clientInfo": { "name": "sse-test", "version": "0" },
                "protocolVersion": mcp_types::MCP_SCHEMA_VERSION,
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 202);

    let (event, data) = client.next_event().await;
    assert_eq!(event, "message");
    let message: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(message["id"], json!(1));
    assert_eq!(message["result"]["serverInfo"]["name"], json!("toolmux"));

    let post = http
        .post(&endpoint)
        .json(&json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 202);

    let (_, data) = client.next_event().await;
    let message: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(message["id"], json!(2));
    assert_eq!(message["result"]["tools"][0]["name"], json!("ping"));
}

#[tokio::test]
async fn posting_to_an_unknown_session_is_not_found() {
    let (base, _dir) = start_server(Mode::Passthrough).await;
    let http = reqwest::Client::new();
    let post = http
        .post(format!("{base}/message?sessionId=not-a-session"))
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 404);
}

#[tokio::test]
async fn dropped_session_does_not_affect_a_new_one() {
    let (base, _dir) = start_server(Mode::ToolSearch).await;

    {
        let (_client, _endpoint) = open_session(&base).await;
        // Dropped here: the host went away without closing cleanly.
    }

    let (mut client, endpoint) = open_session(&base).await;
    let http = reqwest::Client::new();
    http.post(&endpoint)
        .json(&json!({ "jsonrpc": "2.0", "id": 7, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    let (_, data) = client.next_event().await;
    let message: Value = serde_json::from_str(&data).unwrap();
    let names: Vec<&str> = message["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["discover", "execute"]);
}
