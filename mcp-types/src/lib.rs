//! Serde bindings for the subset of the Model Context Protocol (JSON-RPC 2.0
//! framing plus the tool-related requests) that the proxy speaks on both its
//! host-facing and upstream-facing sides.
//!
//! Tool input schemas are deliberately kept as opaque [`serde_json::Value`]s:
//! the proxy forwards them unchanged and must never normalize or re-shape a
//! schema an upstream server produced.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision advertised during the initialize handshake.
pub const MCP_SCHEMA_VERSION: &str = "2024-11-05";

/// JSON-RPC `Result` payloads are opaque at the framing layer.
pub type Result = Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCErrorError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}

/// Any frame that may travel over a JSON-RPC channel. Variant order matters:
/// serde tries them in sequence, and a request (id + method) must win over a
/// notification (method only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
    Notification(JSONRPCNotification),
}

impl JSONRPCMessage {
    pub fn response(id: RequestId, result: Result) -> Self {
        JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: JSONRPCErrorError) -> Self {
        JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error,
        })
    }
}

/// A tool as declared by an upstream server. `input_schema` round-trips
/// untouched; fields this crate does not model (annotations, output schemas,
/// …) are preserved in `extra` so a proxied `tools/list` loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub r#type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    TextContent(TextContent),
    Other(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::TextContent(TextContent {
            r#type: "text".to_string(),
            text: text.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// A tool-call failure surfaced as content, not as a protocol error.
    pub fn error_text(text: impl Into<String>) -> Self {
        CallToolResult {
            content: vec![ContentBlock::text(text)],
            is_error: Some(true),
            structured_content: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListToolsRequestParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilitiesTools {
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ServerCapabilitiesTools>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequestParams {
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    pub capabilities: ServerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledNotificationParams {
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ties a method name to its params/result types, so response plumbing can be
/// written once and stay type-checked per request kind.
pub trait ModelContextProtocolRequest {
    const METHOD: &'static str;
    type Params;
    type Result;
}

pub enum InitializeRequest {}
impl ModelContextProtocolRequest for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Params = InitializeRequestParams;
    type Result = InitializeResult;
}

pub enum ListToolsRequest {}
impl ModelContextProtocolRequest for ListToolsRequest {
    const METHOD: &'static str = "tools/list";
    type Params = Option<ListToolsRequestParams>;
    type Result = ListToolsResult;
}

pub enum CallToolRequest {}
impl ModelContextProtocolRequest for CallToolRequest {
    const METHOD: &'static str = "tools/call";
    type Params = CallToolRequestParams;
    type Result = CallToolResult;
}

pub enum PingRequest {}
impl ModelContextProtocolRequest for PingRequest {
    const METHOD: &'static str = "ping";
    type Params = Option<Value>;
    type Result = Value;
}

/// A host request after method dispatch. Aggregation-only methods
/// (prompts/resources/completion) keep raw params: the proxy forwards them
/// verbatim and has no reason to model their shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeRequestParams),
    ListTools(Option<ListToolsRequestParams>),
    CallTool(CallToolRequestParams),
    Ping,
    ListPrompts(Value),
    GetPrompt(Value),
    ListResources(Value),
    ListResourceTemplates(Value),
    ReadResource(Value),
    Complete(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownMethodError {
    pub method: String,
}

impl std::fmt::Display for UnknownMethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown method `{}`", self.method)
    }
}

impl std::error::Error for UnknownMethodError {}

impl TryFrom<JSONRPCRequest> for ClientRequest {
    type Error = serde_json::Error;

    fn try_from(request: JSONRPCRequest) -> std::result::Result<Self, Self::Error> {
        let params = request.params.unwrap_or(Value::Null);
        let raw = |params: Value| {
            if params.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                params
            }
        };
        match request.method.as_str() {
            "initialize" => Ok(ClientRequest::Initialize(serde_json::from_value(params)?)),
            "tools/list" => Ok(ClientRequest::ListTools(serde_json::from_value(params)?)),
            "tools/call" => Ok(ClientRequest::CallTool(serde_json::from_value(params)?)),
            "ping" => Ok(ClientRequest::Ping),
            "prompts/list" => Ok(ClientRequest::ListPrompts(raw(params))),
            "prompts/get" => Ok(ClientRequest::GetPrompt(raw(params))),
            "resources/list" => Ok(ClientRequest::ListResources(raw(params))),
            "resources/templates/list" => Ok(ClientRequest::ListResourceTemplates(raw(params))),
            "resources/read" => Ok(ClientRequest::ReadResource(raw(params))),
            "completion/complete" => Ok(ClientRequest::Complete(raw(params))),
            _ => Err(serde::de::Error::custom(UnknownMethodError {
                method: request.method.clone(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_and_notification_deserialize_to_distinct_variants() {
        let request: JSONRPCMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/list"
        }))
        .unwrap();
        assert!(matches!(request, JSONRPCMessage::Request(_)));

        let notification: JSONRPCMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(notification, JSONRPCMessage::Notification(_)));
    }

    #[test]
    fn tool_round_trips_unmodeled_fields() {
        let wire = json!({
            "name": "ping",
            "description": "Echo a message back",
            "inputSchema": {
                "type": "object",
                "properties": { "msg": { "type": "string" } }
            },
            "annotations": { "readOnlyHint": true }
        });
        let tool: Tool = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(tool.name, "ping");
        assert_eq!(serde_json::to_value(&tool).unwrap(), wire);
    }

    #[test]
    fn call_tool_error_result_serializes_is_error() {
        let result = CallToolResult::error_text("startup timeout for server `slow`");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isError"], json!(true));
        assert_eq!(value["content"][0]["type"], json!("text"));
    }

    #[test]
    fn client_request_dispatches_known_methods() {
        let request = JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::Integer(7),
            method: "tools/call".into(),
            params: Some(json!({ "name": "fs__read", "arguments": { "path": "/tmp" } })),
        };
        match ClientRequest::try_from(request).unwrap() {
            ClientRequest::CallTool(params) => {
                assert_eq!(params.name, "fs__read");
                assert_eq!(params.arguments, Some(json!({ "path": "/tmp" })));
            }
            other => panic!("expected CallTool, got {other:?}"),
        }
    }

    #[test]
    fn client_request_rejects_unknown_method() {
        let request = JSONRPCRequest {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RequestId::String("x".into()),
            method: "sampling/createMessage".into(),
            params: None,
        };
        assert!(ClientRequest::try_from(request).is_err());
    }

    #[test]
    fn request_id_accepts_strings_and_integers() {
        let ids: Vec<RequestId> = serde_json::from_value(json!(["abc", 42])).unwrap();
        assert_eq!(
            ids,
            vec![RequestId::String("abc".into()), RequestId::Integer(42)]
        );
    }
}
