use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counters reported by a backend for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Harness-agnostic session events.
///
/// Every fully consumed turn ends with exactly one `Result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A complete chunk of assistant text.
    Text { body: String },
    /// The agent invoked a tool.
    ToolUse {
        name: String,
        id: String,
        input: Value,
    },
    /// A tool invocation finished.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// The backend reported an error. The turn still ends with a `Result`.
    Error { message: String, retryable: bool },
    /// Terminal event of a turn.
    Result {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl AgentEvent {
    pub fn text(body: impl Into<String>) -> Self {
        AgentEvent::Text { body: body.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = crate::retry::is_retryable_error(&message);
        AgentEvent::Error { message, retryable }
    }

    /// A bare terminal result with no usage information.
    pub fn synthesized_result(success: bool, session_id: Option<String>) -> Self {
        AgentEvent::Result {
            success,
            text: None,
            usage: None,
            cost_usd: None,
            duration_ms: None,
            session_id,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, AgentEvent::Result { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_serializes_without_empty_optionals() {
        let event = AgentEvent::synthesized_result(true, None);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "result", "success": true}));
    }

    #[test]
    fn error_marks_rate_limits_retryable() {
        match AgentEvent::error("429 rate limit exceeded") {
            AgentEvent::Error { retryable, .. } => assert!(retryable),
            other => panic!("Expected Error, got {:?}", other),
        }
        match AgentEvent::error("invalid api key") {
            AgentEvent::Error { retryable, .. } => assert!(!retryable),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = Usage::default();
        assert!(usage.is_empty());
        usage.add(Usage {
            input_tokens: 10,
            output_tokens: 2,
        });
        usage.add(Usage {
            input_tokens: 5,
            output_tokens: 1,
        });
        assert_eq!(usage.input_tokens, 15);
        assert_eq!(usage.output_tokens, 3);
    }
}
