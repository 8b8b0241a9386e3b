//! Minimal Messages API client.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::harness::events::Usage;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("ANTHROPIC_API_KEY not set")]
    MissingApiKey,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{0}")]
    Network(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Rate limits, overload, server errors and network failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http { status, .. } => *status == 429 || *status >= 500,
            ApiError::Network(_) => true,
            ApiError::MissingApiKey | ApiError::Parse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Thinking and other block types; never sent back.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct MessagesClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl MessagesClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            std::env::var("ANTHROPIC_API_KEY").ok(),
        )
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn create(&self, request: &MessagesRequest) -> Result<MessagesResponse, ApiError> {
        let api_key = self.api_key.as_deref().ok_or(ApiError::MissingApiKey)?;

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Network(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    ApiError::Network(format!("Connection failed: {}", e))
                } else {
                    ApiError::Network(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ApiError::Parse(format!("{}, body: {}", e, body)))
    }
}

/// Estimated cost in USD from per-million-token list prices.
pub fn estimate_cost(model: &str, usage: Usage) -> f64 {
    let model = model.to_lowercase();
    let (input, output) = if model.contains("opus") {
        (15.0, 75.0)
    } else if model.contains("haiku") {
        (0.8, 4.0)
    } else {
        (3.0, 15.0)
    };
    (usage.input_tokens as f64 * input + usage.output_tokens as f64 * output) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_blocks_tolerate_unknown_types() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "...", "signature": "x"},
                {"type": "text", "text": "Hi"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 3, "cache_read_input_tokens": 0}
        }))
        .unwrap();
        assert_eq!(response.content[0], ContentBlock::Other);
        assert_eq!(response.usage.input_tokens, 12);
    }

    #[test]
    fn tool_result_omits_false_error_flag() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "t".to_string(),
            content: "ok".to_string(),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({"type": "tool_result", "tool_use_id": "t", "content": "ok"})
        );
    }

    #[test]
    fn cost_uses_model_family() {
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        assert_eq!(estimate_cost("claude-opus-4", usage), 90.0);
        assert_eq!(estimate_cost("claude-sonnet-4-5", usage), 18.0);
        assert!((estimate_cost("claude-haiku-4-5", usage) - 4.8).abs() < 1e-9);
    }

    #[test]
    fn retryable_statuses() {
        let status = |status| ApiError::Http {
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(529).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!ApiError::MissingApiKey.is_retryable());
    }
}
