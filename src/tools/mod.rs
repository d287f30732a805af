//! Memory tools the model may call
//!
//! The catalog is closed: four tools, each a thin wrapper around exactly one
//! [`MemoryStore`] operation. Names are resolved to a [`Tool`] once per call
//! and anything unrecognised becomes an error result rather than a failure of
//! the surrounding exchange.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::conversation::{Message, ToolCall};
use crate::core::memory::{MemoryError, MemoryStore, DEFAULT_LIST_LIMIT, DEFAULT_SEARCH_LIMIT};

/// Errors raised while running a tool. Always reported back as data.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    Execution(#[from] MemoryError),
}

impl ToolError {
    /// JSON payload handed to the model (or `/run` caller) for this error
    pub fn to_payload(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

/// Definition of a tool advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique name of the tool (e.g., "memory_save")
    pub name: String,

    /// Human-readable description for the model
    pub description: String,

    /// JSON Schema for the arguments
    pub parameters: Value,
}

/// Outcome of one tool call, correlated to the call by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,

    /// JSON text of the result or of an `{"error": ...}` object
    pub content: String,

    #[serde(skip)]
    pub success: bool,
}

impl From<ToolResult> for Message {
    fn from(result: ToolResult) -> Self {
        Message::tool(result.tool_call_id, result.name, result.content)
    }
}

/// The closed set of tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    MemorySave,
    MemorySearch,
    MemoryForget,
    MemoryList,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::MemorySave,
        Tool::MemorySearch,
        Tool::MemoryForget,
        Tool::MemoryList,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::MemorySave => "memory_save",
            Tool::MemorySearch => "memory_search",
            Tool::MemoryForget => "memory_forget",
            Tool::MemoryList => "memory_list",
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match self {
            Tool::MemorySave => (
                "Save a note to long-term memory under a short key",
                json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string", "description": "Short label for the note" },
                        "value": { "type": "string", "description": "The note itself" }
                    },
                    "required": ["key", "value"]
                }),
            ),
            Tool::MemorySearch => (
                "Find saved notes whose key or value contains the query (case-insensitive), newest first",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "limit": { "type": "integer", "default": DEFAULT_SEARCH_LIMIT }
                    },
                    "required": ["query"]
                }),
            ),
            Tool::MemoryForget => (
                "Permanently delete every note saved today (UTC)",
                json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                }),
            ),
            Tool::MemoryList => (
                "List saved notes, newest first",
                json!({
                    "type": "object",
                    "properties": {
                        "limit": { "type": "integer", "default": DEFAULT_SEARCH_LIMIT }
                    },
                    "required": []
                }),
            ),
        };

        ToolDefinition {
            name: self.name().to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    /// Run the tool's single store operation
    async fn execute(&self, store: &MemoryStore, args: &Value) -> Result<Value, MemoryError> {
        match self {
            Tool::MemorySave => {
                let key = string_arg(args, "key");
                let value = string_arg(args, "value");
                let item = store.save(&key, &value).await?;
                Ok(serde_json::to_value(item)?)
            }
            Tool::MemorySearch => {
                let query = string_arg(args, "query");
                let limit = limit_arg(args, DEFAULT_SEARCH_LIMIT, DEFAULT_LIST_LIMIT);
                let results = store.search(&query, limit).await?;
                Ok(json!({ "results": results }))
            }
            Tool::MemoryForget => Ok(serde_json::to_value(store.forget_today().await?)?),
            Tool::MemoryList => {
                let limit = limit_arg(args, DEFAULT_SEARCH_LIMIT, DEFAULT_LIST_LIMIT);
                let results = store.list_all(limit).await?;
                Ok(json!({ "results": results }))
            }
        }
    }
}

/// Missing or null string arguments become "", other scalars their JSON text
fn string_arg(args: &Value, field: &str) -> String {
    match args.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Accepts integers, floats and numeric strings; clamps to `max`
fn limit_arg(args: &Value, default: usize, max: usize) -> usize {
    let requested = match args.get("limit") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    requested
        .map(|n| usize::try_from(n).unwrap_or(max))
        .unwrap_or(default)
        .min(max)
}

/// Dispatches tool calls against the shared memory store
pub struct ToolRegistry {
    memory: Arc<MemoryStore>,
}

impl ToolRegistry {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }

    /// Catalog advertised to the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        Tool::ALL.iter().map(Tool::definition).collect()
    }

    /// Run a tool by name with a raw argument payload
    pub async fn run(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        let tool = Tool::from_name(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let empty = Value::Object(Default::default());
        let args = if args.is_object() { args } else { &empty };

        Ok(tool.execute(&self.memory, args).await?)
    }

    /// Execute one model-issued call. Never fails: errors become the content.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let outcome = self.run(&call.name, &call.arguments).await;

        let (payload, success) = match outcome {
            Ok(value) => (value, true),
            Err(err) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call failed");
                (err.to_payload(), false)
            }
        };

        ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: payload.to_string(),
            success,
        }
    }
}
