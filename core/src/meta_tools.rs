//! The two meta-tools that replace the full tool list in tool-search mode.

use mcp_types::Tool;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use serde::Deserialize;
use serde_json::Value;

pub const DISCOVER_TOOL_NAME: &str = "discover";
pub const EXECUTE_TOOL_NAME: &str = "execute";

pub const DEFAULT_DISCOVER_RESULTS: u64 = 10;
pub const MAX_DISCOVER_RESULTS: u64 = 30;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DiscoverParams {
    /// Natural language search query (e.g. "git commit", "deploy worker",
    /// "database query").
    #[serde(default)]
    pub query: String,
    /// Maximum results to return (1-30, default 10).
    #[serde(default)]
    pub max_results: Option<u64>,
}

impl DiscoverParams {
    pub fn limit(&self) -> usize {
        self.max_results
            .unwrap_or(DEFAULT_DISCOVER_RESULTS)
            .clamp(1, MAX_DISCOVER_RESULTS) as usize
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// Tool name, taken from discover results.
    pub tool_name: String,
    /// Arguments object matching the tool's input schema.
    #[serde(default)]
    pub arguments: Option<Value>,
    /// Optional owning server, only needed when the tool name is ambiguous
    /// across servers. Matching ignores case and separators.
    #[serde(default)]
    pub server: Option<String>,
}

/// Descriptors for `tools/list` in tool-search mode. The available server
/// list is embedded in the descriptions so the model can steer its queries.
pub fn descriptors(server_names: &[String], tool_count: usize) -> Vec<Tool> {
    let mut sorted = server_names.to_vec();
    sorted.sort();
    let server_list = sorted.join(", ");

    let discover_description = format!(
        "Search for available MCP tools across all connected servers ({tool_count} tools \
         indexed). Returns matching tools with schemas, owning server, and relevance \
         score. Available servers: [{server_list}]. Call this FIRST when you need to \
         find the right tool for a task, then use 'execute' with a tool name from the \
         results."
    );
    let execute_description = format!(
        "Execute a tool on one of the connected MCP servers. Available servers: \
         [{server_list}]. Pass the tool name exactly as returned by 'discover'; if you \
         don't know it, call 'discover' first with a natural language query."
    );

    vec![
        Tool {
            name: DISCOVER_TOOL_NAME.to_string(),
            description: Some(discover_description),
            input_schema: schema_for::<DiscoverParams>(),
            extra: serde_json::Map::new(),
        },
        Tool {
            name: EXECUTE_TOOL_NAME.to_string(),
            description: Some(execute_description),
            input_schema: schema_for::<ExecuteParams>(),
            extra: serde_json::Map::new(),
        },
    ]
}

fn schema_for<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft2019_09()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false;
        })
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object" })
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// Strip noise from an input schema before embedding it in discover results:
/// drops `title`, `examples`, `$schema`, `additionalProperties`, `$id`,
/// `$comment`, and `default`, recursing into `properties` and `items`.
pub fn strip_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut clean = serde_json::Map::new();
            for (k, v) in map {
                match k.as_str() {
                    "title" | "examples" | "$schema" | "additionalProperties" | "$id"
                    | "$comment" | "default" => continue,
                    "properties" => {
                        if let Some(props) = v.as_object() {
                            let mut cleaned = serde_json::Map::new();
                            for (pk, pv) in props {
                                cleaned.insert(pk.clone(), strip_schema(pv));
                            }
                            clean.insert(k.clone(), Value::Object(cleaned));
                        }
                    }
                    "items" => {
                        clean.insert(k.clone(), strip_schema(v));
                    }
                    _ => {
                        clean.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(clean)
        }
        other => other.clone(),
    }
}
