//! Translation of the server's SSE event feed into [`AgentEvent`]s.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::harness::events::{AgentEvent, Usage};
use crate::harness::shared::str_field;

/// What one SSE message produced.
#[derive(Debug, Default, PartialEq)]
pub struct Translation {
    pub events: Vec<AgentEvent>,
    /// The session went idle; the turn is over.
    pub idle: bool,
    /// Permission request id awaiting approval.
    pub permission: Option<String>,
}

/// Per-session translation state.
#[derive(Debug, Default)]
pub struct SseTranslator {
    session_id: String,
    message_roles: HashMap<String, String>,
    emitted_parts: HashSet<String>,
    emitted_tools: HashSet<String>,
    usage: Usage,
    cost_usd: f64,
    errored: bool,
    last_text: Option<String>,
}

impl SseTranslator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Clear per-turn accumulators before a new prompt.
    pub fn start_turn(&mut self) {
        self.usage = Usage::default();
        self.cost_usd = 0.0;
        self.errored = false;
        self.last_text = None;
    }

    /// Terminal result for the current turn.
    pub fn finish(&mut self, success: bool) -> AgentEvent {
        AgentEvent::Result {
            success: success && !self.errored,
            text: self.last_text.take(),
            usage: (!self.usage.is_empty()).then_some(self.usage),
            cost_usd: (self.cost_usd > 0.0).then_some(self.cost_usd),
            duration_ms: None,
            session_id: Some(self.session_id.clone()),
        }
    }

    pub fn translate(&mut self, event_name: Option<&str>, data: &str) -> Translation {
        let json: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                debug!("Dropping malformed SSE data ({}): {}", e, data);
                return Translation::default();
            }
        };
        let Some(event_type) = json.get("type").and_then(|v| v.as_str()).or(event_name) else {
            return Translation::default();
        };
        let props = json.get("properties").unwrap_or(&json);

        let event_session = props
            .get("sessionID")
            .or_else(|| props.get("info").and_then(|v| v.get("sessionID")))
            .or_else(|| props.get("part").and_then(|v| v.get("sessionID")))
            .and_then(|v| v.as_str());
        if is_session_scoped(event_type) && event_session != Some(self.session_id.as_str()) {
            if event_session.is_none() {
                debug!("Dropping {} without a session id", event_type);
            }
            return Translation::default();
        }

        let mut out = Translation::default();
        match event_type {
            "message.updated" => {
                if let Some(info) = props.get("info") {
                    if let (Some(id), Some(role)) = (
                        info.get("id").and_then(|v| v.as_str()),
                        info.get("role").and_then(|v| v.as_str()),
                    ) {
                        self.message_roles.insert(id.to_string(), role.to_string());
                    }
                }
            }
            "message.part.updated" => {
                if let Some(part) = props.get("part") {
                    self.handle_part(part, &mut out);
                }
            }
            "session.error" => {
                self.errored = true;
                out.events.push(AgentEvent::error(error_message(props)));
            }
            "session.idle" => out.idle = true,
            "session.status" => {
                let status = props.get("status");
                let status_type = status
                    .and_then(|s| s.get("type"))
                    .or(status)
                    .or_else(|| props.get("type"))
                    .and_then(|v| v.as_str());
                out.idle = status_type == Some("idle");
            }
            "permission.updated" | "permission.asked" => {
                out.permission = str_field(props, &["id", "permissionID"]).map(str::to_string);
            }
            other => debug!("Ignoring SSE event {}", other),
        }
        out
    }

    fn handle_part(&mut self, part: &Value, out: &mut Translation) {
        let Some(part_type) = part.get("type").and_then(|v| v.as_str()) else {
            return;
        };
        match part_type {
            "text" => self.handle_text_part(part, out),
            "tool" => self.handle_tool_part(part, out),
            "step-finish" => {
                if let Some(tokens) = part.get("tokens") {
                    self.usage.add(Usage {
                        input_tokens: tokens.get("input").and_then(|v| v.as_u64()).unwrap_or(0),
                        output_tokens: tokens.get("output").and_then(|v| v.as_u64()).unwrap_or(0),
                    });
                }
                if let Some(cost) = part.get("cost").and_then(|v| v.as_f64()) {
                    self.cost_usd += cost;
                }
            }
            _ => {}
        }
    }

    fn handle_text_part(&mut self, part: &Value, out: &mut Translation) {
        // Only complete parts are surfaced.
        let finished = part
            .get("time")
            .and_then(|t| t.get("end"))
            .is_some_and(|end| !end.is_null());
        if !finished {
            return;
        }
        if let Some(message_id) = str_field(part, &["messageID", "messageId"]) {
            // Unknown role means message.updated has not arrived; skip rather
            // than risk echoing the user's prompt.
            if self.message_roles.get(message_id).map(String::as_str) != Some("assistant") {
                return;
            }
        }
        let part_id = str_field(part, &["id", "partID"]).unwrap_or_default();
        if !part_id.is_empty() && !self.emitted_parts.insert(part_id.to_string()) {
            return;
        }
        let text = part.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        if text.trim().is_empty() {
            return;
        }
        self.last_text = Some(text.to_string());
        out.events.push(AgentEvent::text(text));
    }

    fn handle_tool_part(&mut self, part: &Value, out: &mut Translation) {
        let Some(state) = part.get("state") else {
            return;
        };
        let Some(status) = state.get("status").and_then(|v| v.as_str()) else {
            return;
        };
        let (content, is_error) = match status {
            "completed" => (output_string(state.get("output")), false),
            "error" => (
                state
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown error")
                    .to_string(),
                true,
            ),
            _ => return,
        };

        let call_id = str_field(part, &["callID", "id"]).unwrap_or("unknown").to_string();
        if !self.emitted_tools.insert(call_id.clone()) {
            return;
        }
        let name = str_field(part, &["tool", "name"]).unwrap_or("unknown").to_string();
        let input = state.get("input").cloned().unwrap_or(Value::Null);

        out.events.push(AgentEvent::ToolUse {
            name,
            id: call_id.clone(),
            input,
        });
        out.events.push(AgentEvent::ToolResult {
            tool_use_id: call_id,
            content,
            is_error,
        });
    }
}

/// Event kinds that belong to one session and are dropped unless they name ours.
fn is_session_scoped(event_type: &str) -> bool {
    event_type.starts_with("session.")
        || event_type.starts_with("permission.")
        || event_type.starts_with("message.")
}

fn output_string(output: Option<&Value>) -> String {
    match output {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn error_message(props: &Value) -> String {
    let Some(error) = props.get("error") else {
        return "Unknown session error".to_string();
    };
    if let Some(s) = error.as_str() {
        return s.to_string();
    }
    error
        .get("data")
        .and_then(|d| d.get("message"))
        .or_else(|| error.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(translator: &mut SseTranslator, event: Value) -> Translation {
        translator.translate(None, &event.to_string())
    }

    fn assistant(translator: &mut SseTranslator, message_id: &str) {
        feed(
            translator,
            json!({
                "type": "message.updated",
                "properties": {"info": {"id": message_id, "role": "assistant", "sessionID": "ses_1"}}
            }),
        );
    }

    fn text_part(message_id: &str, text: &str, end: Option<u64>) -> Value {
        let mut time = json!({"start": 1});
        if let Some(end) = end {
            time["end"] = json!(end);
        }
        json!({
            "type": "message.part.updated",
            "properties": {"part": {
                "id": format!("prt_{}", text.len()),
                "type": "text",
                "text": text,
                "sessionID": "ses_1",
                "messageID": message_id,
                "time": time
            }}
        })
    }

    #[test]
    fn text_is_emitted_once_when_finished() {
        let mut t = SseTranslator::new("ses_1");
        assistant(&mut t, "msg_a");
        assert!(feed(&mut t, text_part("msg_a", "Hello", None)).events.is_empty());
        let out = feed(&mut t, text_part("msg_a", "Hello", Some(2)));
        assert_eq!(out.events, vec![AgentEvent::text("Hello")]);
        assert!(feed(&mut t, text_part("msg_a", "Hello", Some(2))).events.is_empty());
    }

    #[test]
    fn user_and_unknown_messages_are_skipped() {
        let mut t = SseTranslator::new("ses_1");
        assert!(feed(&mut t, text_part("msg_u", "prompt", Some(2))).events.is_empty());
        feed(
            &mut t,
            json!({
                "type": "message.updated",
                "properties": {"info": {"id": "msg_u", "role": "user", "sessionID": "ses_1"}}
            }),
        );
        assert!(feed(&mut t, text_part("msg_u", "prompt!", Some(2))).events.is_empty());
    }

    #[test]
    fn events_for_other_sessions_are_filtered() {
        let mut t = SseTranslator::new("ses_1");
        let out = feed(
            &mut t,
            json!({"type": "session.idle", "properties": {"sessionID": "ses_other"}}),
        );
        assert!(!out.idle);
        let out = feed(
            &mut t,
            json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
        );
        assert!(out.idle);
    }

    #[test]
    fn session_events_without_an_id_are_dropped() {
        let mut t = SseTranslator::new("ses_1");
        let out = feed(&mut t, json!({"type": "session.idle", "properties": {}}));
        assert!(!out.idle);
        let out = feed(&mut t, json!({"type": "session.status", "properties": {"status": "idle"}}));
        assert!(!out.idle);
        let out = feed(
            &mut t,
            json!({"type": "session.error", "properties": {"error": {"name": "APIError"}}}),
        );
        assert!(out.events.is_empty());
        assert!(matches!(t.finish(true), AgentEvent::Result { success: true, .. }));

        let out = feed(&mut t, json!({"type": "permission.updated", "properties": {"id": "per_x"}}));
        assert_eq!(out.permission, None);
        let out = feed(&mut t, json!({"type": "server.connected", "properties": {}}));
        assert_eq!(out, Translation::default());
    }

    #[test]
    fn completed_and_failed_tools() {
        let mut t = SseTranslator::new("ses_1");
        let tool = |status: &str, extra: Value| {
            let mut state = json!({"status": status, "input": {"command": "ls"}});
            if let (Some(state), Some(extra)) = (state.as_object_mut(), extra.as_object()) {
                state.extend(extra.clone());
            }
            json!({
                "type": "message.part.updated",
                "properties": {"part": {
                    "type": "tool", "tool": "bash", "callID": format!("call_{}", status),
                    "sessionID": "ses_1", "state": state
                }}
            })
        };

        assert!(feed(&mut t, tool("running", json!({}))).events.is_empty());
        let out = feed(&mut t, tool("completed", json!({"output": "a.txt"})));
        assert_eq!(out.events.len(), 2);
        assert_eq!(
            out.events[1],
            AgentEvent::ToolResult {
                tool_use_id: "call_completed".to_string(),
                content: "a.txt".to_string(),
                is_error: false,
            }
        );

        let out = feed(&mut t, tool("error", json!({"error": "denied"})));
        assert!(matches!(
            &out.events[1],
            AgentEvent::ToolResult { is_error: true, content, .. } if content == "denied"
        ));
    }

    #[test]
    fn step_finish_accumulates_into_result() {
        let mut t = SseTranslator::new("ses_1");
        for _ in 0..2 {
            feed(
                &mut t,
                json!({
                    "type": "message.part.updated",
                    "properties": {"part": {
                        "type": "step-finish", "sessionID": "ses_1",
                        "tokens": {"input": 100, "output": 10}, "cost": 0.5
                    }}
                }),
            );
        }
        match t.finish(true) {
            AgentEvent::Result {
                success,
                usage,
                cost_usd,
                session_id,
                ..
            } => {
                assert!(success);
                assert_eq!(usage.unwrap().input_tokens, 200);
                assert_eq!(cost_usd, Some(1.0));
                assert_eq!(session_id.as_deref(), Some("ses_1"));
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn session_error_fails_the_turn() {
        let mut t = SseTranslator::new("ses_1");
        let out = feed(
            &mut t,
            json!({
                "type": "session.error",
                "properties": {"sessionID": "ses_1", "error": {"name": "APIError", "data": {"message": "Rate limit reached"}}}
            }),
        );
        assert!(matches!(
            &out.events[0],
            AgentEvent::Error { message, retryable: true } if message == "Rate limit reached"
        ));
        assert!(matches!(t.finish(true), AgentEvent::Result { success: false, .. }));
        t.start_turn();
        assert!(matches!(t.finish(true), AgentEvent::Result { success: true, .. }));
    }

    #[test]
    fn status_idle_in_object_form() {
        let mut t = SseTranslator::new("ses_1");
        let out = feed(
            &mut t,
            json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "busy"}}}),
        );
        assert!(!out.idle);
        let out = feed(
            &mut t,
            json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "idle"}}}),
        );
        assert!(out.idle);
    }

    #[test]
    fn permission_requests_are_surfaced() {
        let mut t = SseTranslator::new("ses_1");
        let out = feed(
            &mut t,
            json!({"type": "permission.updated", "properties": {"id": "per_1", "sessionID": "ses_1"}}),
        );
        assert_eq!(out.permission.as_deref(), Some("per_1"));
    }

    #[test]
    fn malformed_data_is_dropped() {
        let mut t = SseTranslator::new("ses_1");
        assert_eq!(t.translate(Some("message"), "{not json"), Translation::default());
    }
}
