//! JSONL wire format spoken with the agent CLI.
//!
//! Every stdout line is an independent JSON object. Several shapes are in
//! use across CLI versions, so a line is first read as a `Value` and then
//! matched by its discriminating key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::harness::events::{AgentEvent, Usage};
use crate::harness::shared::{str_field, truncate};

/// Commands written to the CLI's stdin, one per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StdinCommand<'a> {
    SetSystemPrompt {
        content: &'a str,
    },
    SendPrompt {
        content: &'a str,
    },
    ToolResult {
        tool_call_id: &'a str,
        content: &'a str,
        is_error: bool,
    },
}

impl StdinCommand<'_> {
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default, alias = "text")]
    result: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default, alias = "total_cost_usd")]
    cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    session_id: Option<String>,
}

impl ResultLine {
    fn into_event(self) -> AgentEvent {
        let success = self.success.unwrap_or_else(|| {
            !self.is_error.unwrap_or(false)
                && self.subtype.as_deref().map_or(true, |s| s == "success")
        });
        AgentEvent::Result {
            success,
            text: self.result,
            usage: self.usage,
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            session_id: self.session_id,
        }
    }
}

/// Render tool result content that may be a string or structured JSON.
fn content_to_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn parse_entry(entry_type: &str, value: &Value) -> Vec<AgentEvent> {
    match entry_type {
        "message" => {
            if value.get("role").and_then(|r| r.as_str()) == Some("user") {
                return vec![];
            }
            match value.get("content") {
                Some(Value::Array(_)) => parse_blocks(value),
                _ => str_field(value, &["content", "text"])
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![AgentEvent::text(t)])
                    .unwrap_or_default(),
            }
        }
        "tool_call" => {
            let Some(name) = str_field(value, &["tool_name", "name"]) else {
                return vec![];
            };
            let id = str_field(value, &["id", "tool_call_id"]).unwrap_or_default();
            let input = value
                .get("input")
                .or_else(|| value.get("arguments"))
                .cloned()
                .unwrap_or(Value::Null);
            vec![AgentEvent::ToolUse {
                name: name.to_string(),
                id: id.to_string(),
                input,
            }]
        }
        "tool_result" => {
            let id = str_field(value, &["tool_call_id", "tool_use_id", "id"]).unwrap_or_default();
            vec![AgentEvent::ToolResult {
                tool_use_id: id.to_string(),
                content: content_to_string(value.get("content").unwrap_or(&Value::Null)),
                is_error: value
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }]
        }
        other => {
            debug!("Ignoring CLI entry type {}", other);
            vec![]
        }
    }
}

/// Text/tool blocks from `content` or `message.content`.
fn parse_blocks(value: &Value) -> Vec<AgentEvent> {
    let blocks = value
        .get("content")
        .filter(|c| c.is_array())
        .or_else(|| value.get("message").and_then(|m| m.get("content")))
        .cloned();
    let Some(blocks) = blocks else {
        return vec![];
    };
    let blocks: Vec<ContentBlock> = match serde_json::from_value(blocks) {
        Ok(blocks) => blocks,
        Err(e) => {
            debug!("Dropping malformed content blocks: {}", e);
            return vec![];
        }
    };

    blocks
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(AgentEvent::text(text)),
            ContentBlock::ToolUse { id, name, input } => {
                Some(AgentEvent::ToolUse { name, id, input })
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(AgentEvent::ToolResult {
                tool_use_id,
                content: content_to_string(&content),
                is_error,
            }),
            _ => None,
        })
        .collect()
}

/// Translate one stdout line. Malformed or unknown lines yield nothing.
pub fn parse_line(line: &str) -> Vec<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return vec![];
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!("Dropping malformed CLI line ({}): {}", e, truncate(line, 200));
            return vec![];
        }
    };

    if let Some(entry_type) = value.get("entry_type").and_then(|t| t.as_str()) {
        return parse_entry(entry_type, &value);
    }

    match value.get("type").and_then(|t| t.as_str()) {
        Some("result") => match serde_json::from_value::<ResultLine>(value) {
            Ok(result) => vec![result.into_event()],
            Err(e) => {
                debug!("Dropping malformed result line: {}", e);
                vec![]
            }
        },
        Some("error") => {
            let message = str_field(&value, &["message", "error"])
                .map(str::to_string)
                .or_else(|| {
                    value
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "unknown CLI error".to_string());
            vec![AgentEvent::error(message)]
        }
        Some("user") => vec![],
        _ => parse_blocks(&value),
    }
}
