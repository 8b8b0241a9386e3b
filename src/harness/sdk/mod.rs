//! In-process harness: the agent loop runs here against the Messages API.
//!
//! Each turn alternates model calls with local tool dispatch until the
//! model stops asking for tools, the turn cap is hit, or the budget is spent.
//! The model sees the built-in file and shell tools from [`tools`] that pass
//! the session's allow and deny lists, plus every local tool server.

pub mod client;
pub mod tools;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{AgentEvent, Usage};
use super::{AgentConfig, AgentConfigUpdate, Harness, HarnessSession};
use client::{
    estimate_cost, ApiError, ContentBlock, Message, MessagesClient, MessagesRequest, ToolSpec,
};
use tools::BuiltinTools;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 8192;

pub struct SdkHarness {
    client: Arc<MessagesClient>,
    default_model: String,
}

impl SdkHarness {
    pub fn new() -> Self {
        Self::with_client(MessagesClient::from_env())
    }

    pub fn with_client(client: MessagesClient) -> Self {
        Self {
            client: Arc::new(client),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn start_session(&self, config: AgentConfig, prompt: &str) -> SdkSession {
        SdkSession {
            client: Arc::clone(&self.client),
            default_model: self.default_model.clone(),
            config,
            session_id: Uuid::new_v4().to_string(),
            history: Vec::new(),
            queued: VecDeque::from([prompt.to_string()]),
            pending: VecDeque::new(),
            turn: None,
            sandbox_noted: false,
            closed: false,
        }
    }
}

impl Default for SdkHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Harness for SdkHarness {
    fn id(&self) -> &str {
        "sdk"
    }

    fn name(&self) -> &str {
        "In-process SDK"
    }

    fn run(&self, config: AgentConfig, prompt: &str) -> Box<dyn HarnessSession> {
        Box::new(self.start_session(config, prompt))
    }
}

/// Counters for the turn in flight.
struct TurnState {
    requests: u32,
    usage: Usage,
    cost_usd: f64,
    started: Instant,
    last_text: Option<String>,
    /// The prompt was appended to a trailing user message instead of pushed.
    prompt_merged: bool,
}

pub struct SdkSession {
    client: Arc<MessagesClient>,
    default_model: String,
    config: AgentConfig,
    session_id: String,
    history: Vec<Message>,
    queued: VecDeque<String>,
    pending: VecDeque<AgentEvent>,
    turn: Option<TurnState>,
    sandbox_noted: bool,
    closed: bool,
}

impl SdkSession {
    fn model(&self) -> String {
        self.config
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn start_turn(&mut self, prompt: String) -> Result<()> {
        if !self.client.has_api_key() {
            return Err(anyhow!(ApiError::MissingApiKey));
        }
        if self.config.sandbox_enabled() && !self.sandbox_noted {
            debug!("Sandbox profile ignored by the in-process harness");
            self.sandbox_noted = true;
        }
        // A turn stopped by its caps ends on tool results; keep roles alternating.
        let prompt_merged = match self.history.last_mut() {
            Some(last) if last.role == "user" => {
                last.content.push(ContentBlock::Text { text: prompt });
                true
            }
            _ => {
                self.history
                    .push(Message::user(vec![ContentBlock::Text { text: prompt }]));
                false
            }
        };
        self.turn = Some(TurnState {
            requests: 0,
            usage: Usage::default(),
            cost_usd: 0.0,
            started: Instant::now(),
            last_text: None,
            prompt_merged,
        });
        Ok(())
    }

    fn finish_turn(&mut self, success: bool, text: Option<String>) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        info!(
            "SDK turn finished: success={} requests={} tokens={}/{}",
            success, turn.requests, turn.usage.input_tokens, turn.usage.output_tokens
        );
        self.pending.push_back(AgentEvent::Result {
            success,
            text: text.or(turn.last_text),
            usage: Some(turn.usage),
            cost_usd: Some(turn.cost_usd),
            duration_ms: Some(turn.started.elapsed().as_millis() as u64),
            session_id: Some(self.session_id.clone()),
        });
    }

    /// Remove the turn's prompt from history when no request for it succeeded.
    fn drop_unanswered_prompt(&mut self) {
        let Some(turn) = self.turn.as_ref() else {
            return;
        };
        if turn.requests > 0 {
            return;
        }
        if turn.prompt_merged {
            if let Some(last) = self.history.last_mut() {
                last.content.pop();
            }
        } else {
            self.history.pop();
        }
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = BuiltinTools::for_config(&self.config).specs();
        specs.extend(self.config.local_tools().into_iter().map(|tool| ToolSpec {
            name: tool.definition.name.clone(),
            description: tool.definition.description.clone(),
            input_schema: tool.definition.input_schema.clone(),
        }));
        specs
    }

    /// One model round trip plus any tool dispatch it asks for.
    async fn step(&mut self) {
        let Some((requests, spent)) = self.turn.as_ref().map(|t| (t.requests, t.cost_usd)) else {
            return;
        };

        if let Some(max_turns) = self.config.max_turns {
            if requests >= max_turns {
                warn!("SDK turn hit max turns ({})", max_turns);
                self.finish_turn(false, Some(format!("Reached max turns ({})", max_turns)));
                return;
            }
        }
        if let Some(budget) = self.config.max_budget_usd {
            if spent >= budget {
                warn!("SDK turn exhausted budget (${:.4})", budget);
                self.finish_turn(false, Some(format!("Budget of ${:.2} exhausted", budget)));
                return;
            }
        }

        let model = self.model();
        let request = MessagesRequest {
            model: model.clone(),
            max_tokens: MAX_TOKENS,
            system: self.config.system_prompt.clone(),
            messages: self.history.clone(),
            tools: self.tool_specs(),
        };

        let response = match self.client.create(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Messages API call failed: {}", e);
                self.drop_unanswered_prompt();
                let message = e.to_string();
                self.pending.push_back(AgentEvent::Error {
                    message: message.clone(),
                    retryable: e.is_retryable() || crate::retry::is_retryable_error(&message),
                });
                self.finish_turn(false, Some(message));
                return;
            }
        };

        if let Some(turn) = self.turn.as_mut() {
            turn.requests += 1;
            turn.usage.add(response.usage);
            turn.cost_usd += estimate_cost(&model, response.usage);
        }

        let content: Vec<ContentBlock> = response
            .content
            .into_iter()
            .filter(|block| !matches!(block, ContentBlock::Other))
            .collect();

        let mut tool_calls = Vec::new();
        for block in &content {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    if let Some(turn) = self.turn.as_mut() {
                        turn.last_text = Some(text.clone());
                    }
                    self.pending.push_back(AgentEvent::text(text.clone()));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.pending.push_back(AgentEvent::ToolUse {
                        name: name.clone(),
                        id: id.clone(),
                        input: input.clone(),
                    });
                    tool_calls.push((id.clone(), name.clone(), input.clone()));
                }
                _ => {}
            }
        }
        self.history.push(Message::assistant(content));

        if response.stop_reason.as_deref() != Some("tool_use") || tool_calls.is_empty() {
            self.finish_turn(true, None);
            return;
        }

        let builtins = BuiltinTools::for_config(&self.config);
        let mut results = Vec::with_capacity(tool_calls.len());
        for (id, name, input) in tool_calls {
            let output = match self.config.resolve_tool(&name) {
                Some(tool) => tool.handler.call(input).await,
                None => builtins
                    .call(&name, input)
                    .await
                    .unwrap_or_else(|| super::ToolOutput::error(format!("Unknown tool: {}", name))),
            };
            self.pending.push_back(AgentEvent::ToolResult {
                tool_use_id: id.clone(),
                content: output.content.clone(),
                is_error: output.is_error,
            });
            results.push(ContentBlock::ToolResult {
                tool_use_id: id,
                content: output.content,
                is_error: output.is_error,
            });
        }
        self.history.push(Message::user(results));
    }
}

#[async_trait]
impl HarnessSession for SdkSession {
    async fn next_event(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.turn.is_none() {
                let prompt = self.queued.pop_front()?;
                if let Err(e) = self.start_turn(prompt) {
                    return Some(Err(e));
                }
            }
            self.step().await;
        }
    }

    fn send(&mut self, prompt: &str) {
        self.queued.push_back(prompt.to_string());
    }

    fn update_config(&mut self, update: AgentConfigUpdate) {
        self.config.apply(update);
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.queued.clear();
        self.pending.clear();
        self.turn = None;
        debug!("SDK session {} closed", self.session_id);
    }
}
