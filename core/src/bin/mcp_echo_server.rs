//! Minimal MCP server over stdio, exposing a single `ping` tool that echoes
//! its `msg` argument. Used by the lifecycle integration tests as a real
//! child process; also handy as a smoke-test upstream for a local config.

use mcp_types::CallToolResult;
use mcp_types::ContentBlock;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCRequest;
use mcp_types::ListToolsResult;
use mcp_types::Tool;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(JSONRPCMessage::Request(request)) = serde_json::from_str::<JSONRPCMessage>(line)
        else {
            continue;
        };
        let response = handle_request(request);
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn handle_request(request: JSONRPCRequest) -> JSONRPCMessage {
    match request.method.as_str() {
        "initialize" => JSONRPCMessage::response(
            request.id,
            json!({
                "protocolVersion": mcp_types::MCP_SCHEMA_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "tools/list" => {
            let result = ListToolsResult {
                tools: vec![Tool {
                    name: "ping".to_string(),
                    description: Some("Echo the given message back".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "msg": { "type": "string" } }
                    }),
                    extra: serde_json::Map::new(),
                }],
                next_cursor: None,
            };
            match serde_json::to_value(result) {
                Ok(value) => JSONRPCMessage::response(request.id, value),
                Err(e) => internal_error(request.id, e.to_string()),
            }
        }
        "tools/call" => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let result = if name == "ping" {
                let msg = params
                    .get("arguments")
                    .and_then(|a| a.get("msg"))
                    .and_then(Value::as_str)
                    .unwrap_or("pong");
                CallToolResult {
                    content: vec![ContentBlock::text(msg)],
                    is_error: None,
                    structured_content: None,
                }
            } else {
                CallToolResult::error_text(format!("Unknown tool '{name}'"))
            };
            match serde_json::to_value(result) {
                Ok(value) => JSONRPCMessage::response(request.id, value),
                Err(e) => internal_error(request.id, e.to_string()),
            }
        }
        "ping" => JSONRPCMessage::response(request.id, json!({})),
        other => JSONRPCMessage::error(
            request.id,
            JSONRPCErrorError {
                code: -32601,
                message: format!("Method not found: {other}"),
                data: None,
            },
        ),
    }
}

fn internal_error(id: mcp_types::RequestId, message: String) -> JSONRPCMessage {
    JSONRPCMessage::error(
        id,
        JSONRPCErrorError {
            code: -32603,
            message,
            data: None,
        },
    )
}
