//! Agent event model and the stream-json record parser.
//!
//! The agent child process emits one self-contained JSON object per stdout
//! line. `parse_record` maps a decoded record to at most one [`AgentEvent`];
//! records that carry nothing the bridge cares about map to `None`. The
//! parser is total: missing or mistyped fields default to empty / zero /
//! false, and no input makes it fail.

use serde_json::{Map, Value};

/// Events surfaced from one conversational turn of the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The child announced itself; carries the session id to resume later.
    Init { session_id: String },
    /// A fragment of assistant prose.
    TextDelta { text: String },
    /// A tool invocation began streaming (name only; input not yet known).
    ToolStart { tool_name: String },
    /// A complete tool invocation with its input mapping.
    ToolUse {
        tool_name: String,
        tool_input: Map<String, Value>,
    },
    /// Output of a tool invocation.
    ToolResult { text: String, is_error: bool },
    /// The turn terminator, carrying session totals. `text` duplicates
    /// already-streamed prose and is never re-rendered to the chat.
    Result {
        session_id: String,
        duration_ms: u64,
        num_turns: u32,
        cost_usd: f64,
        text: String,
    },
}

impl AgentEvent {
    /// Session id carried by this event, when it is one of the variants
    /// that track it (`Init`, `Result`).
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Init { session_id } | Self::Result { session_id, .. }
                if !session_id.is_empty() =>
            {
                Some(session_id)
            }
            _ => None,
        }
    }
}

/// Map one decoded stream-json record to at most one event.
pub fn parse_record(record: &Value) -> Option<AgentEvent> {
    match record.get("type").and_then(Value::as_str) {
        Some("system") => parse_system(record),
        Some("stream_event") => parse_stream_event(record),
        Some("assistant") => parse_assistant(record),
        Some("user") => parse_user(record),
        Some("result") => Some(parse_result(record)),
        _ => None,
    }
}

fn parse_system(record: &Value) -> Option<AgentEvent> {
    if record.get("subtype").and_then(Value::as_str) == Some("init") {
        return Some(AgentEvent::Init {
            session_id: str_field(record, "session_id"),
        });
    }
    None
}

fn parse_stream_event(record: &Value) -> Option<AgentEvent> {
    let inner = record.get("event")?;
    match inner.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = inner.get("delta")?;
            if delta.get("type").and_then(Value::as_str) == Some("text_delta") {
                return Some(AgentEvent::TextDelta {
                    text: str_field(delta, "text"),
                });
            }
            None
        }
        Some("content_block_start") => {
            let block = inner.get("content_block")?;
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                return Some(AgentEvent::ToolStart {
                    tool_name: str_field(block, "name"),
                });
            }
            None
        }
        _ => None,
    }
}

fn parse_assistant(record: &Value) -> Option<AgentEvent> {
    for block in content_blocks(record) {
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            let tool_input = block
                .get("input")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            return Some(AgentEvent::ToolUse {
                tool_name: str_field(block, "name"),
                tool_input,
            });
        }
    }
    None
}

fn parse_user(record: &Value) -> Option<AgentEvent> {
    for block in content_blocks(record) {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            return Some(AgentEvent::ToolResult {
                text: result_content_text(block.get("content")),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
    }
    None
}

fn parse_result(record: &Value) -> AgentEvent {
    AgentEvent::Result {
        session_id: str_field(record, "session_id"),
        duration_ms: record
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        num_turns: record
            .get("num_turns")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        cost_usd: record
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        text: str_field(record, "result"),
    }
}

fn content_blocks(record: &Value) -> impl Iterator<Item = &Value> {
    record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// A tool result's `content` is either a bare string or a list of content
/// blocks whose text parts we join.
fn result_content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
