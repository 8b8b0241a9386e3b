//! Harness layer: one session contract, several agent runtimes.
//!
//! A [`Harness`] turns an [`AgentConfig`] and a prompt into a
//! [`HarnessSession`]. Sessions are pull-based: the caller drives progress by
//! awaiting [`HarnessSession::next_event`], and that is the only point where
//! backend I/O happens. `run` itself never touches the backend.
//!
//! ## Runtimes
//! - `sdk`: in-process agent loop against the Messages API
//! - `subprocess`: one CLI child process per turn, JSONL over stdio
//! - `server`: shared HTTP server, events over SSE

pub mod events;
pub mod registry;
pub mod sdk;
pub mod server;
pub mod shared;
pub mod subprocess;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use async_trait::async_trait;
use futures::Stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use events::{AgentEvent, Usage};

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

/// Filesystem/network restrictions requested for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProfile {
    pub enabled: bool,
    #[serde(default)]
    pub read_paths: Vec<PathBuf>,
    #[serde(default)]
    pub write_paths: Vec<PathBuf>,
    #[serde(default)]
    pub block_network: bool,
}

/// The external sandboxing mechanism, seen only as a command rewriter.
pub trait CommandWrapper: Send + Sync {
    /// Rewrite `program args..` into the command that runs it sandboxed.
    fn wrap(
        &self,
        program: &str,
        args: &[String],
        profile: &SandboxProfile,
    ) -> (String, Vec<String>);
}

// ── Local tools ───────────────────────────────────────────────────

/// Tool definition advertised to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// JSON Schema for a tool's typed arguments with subschemas inlined, so
/// backends that ignore `$ref` still see every field.
pub fn json_schema_for<T: JsonSchema>() -> Value {
    let settings = schemars::gen::SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema)
        .unwrap_or_else(|_| json!({"type": "object", "properties": {}}));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}

/// What a local tool hands back to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Handler invoked when the agent calls a local tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value) -> ToolOutput;
}

#[derive(Clone)]
pub struct LocalTool {
    pub definition: ToolDefinition,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for LocalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTool")
            .field("name", &self.definition.name)
            .finish()
    }
}

/// A named group of local tools (an auxiliary tool-service handle).
#[derive(Debug, Clone)]
pub struct ToolServer {
    pub name: String,
    pub tools: Vec<LocalTool>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: LocalTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Fully qualified name as backends that namespace server tools see it.
    pub fn qualified_name(&self, tool: &str) -> String {
        format!("mcp__{}__{}", self.name, tool)
    }
}

// ── Agent configuration ───────────────────────────────────────────

/// Configuration for one agent session.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub working_directory: PathBuf,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub tool_servers: HashMap<String, ToolServer>,
    pub permission_mode: PermissionMode,
    pub sandbox: Option<SandboxProfile>,
    /// Destroy an idle backend session after this long. Applied at start only.
    pub inactivity_timeout: Option<Duration>,
}

impl AgentConfig {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_server(mut self, server: ToolServer) -> Self {
        self.tool_servers.insert(server.name.clone(), server);
        self
    }

    /// Find a local tool by bare or `mcp__server__tool` name.
    pub fn find_tool(&self, name: &str) -> Option<&LocalTool> {
        if let Some(rest) = name.strip_prefix("mcp__") {
            if let Some((server, tool)) = rest.split_once("__") {
                return self
                    .tool_servers
                    .get(server)
                    .and_then(|s| s.tools.iter().find(|t| t.definition.name == tool));
            }
        }
        self.tool_servers
            .values()
            .flat_map(|s| s.tools.iter())
            .find(|t| t.definition.name == name)
    }

    /// Local tools the session may use after allow/deny filtering.
    pub fn local_tools(&self) -> Vec<&LocalTool> {
        let mut servers: Vec<_> = self.tool_servers.values().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
            .into_iter()
            .flat_map(|server| {
                server
                    .tools
                    .iter()
                    .filter(move |t| self.tool_permitted(server, &t.definition.name))
            })
            .collect()
    }

    /// A local tool the session may call, by bare or qualified name.
    pub fn resolve_tool(&self, name: &str) -> Option<LocalTool> {
        let tool = self.find_tool(name)?;
        let server = self
            .tool_servers
            .values()
            .find(|s| s.tools.iter().any(|t| std::ptr::eq(t, tool)))?;
        self.tool_permitted(server, &tool.definition.name)
            .then(|| tool.clone())
    }

    fn tool_permitted(&self, server: &ToolServer, tool: &str) -> bool {
        let qualified = server.qualified_name(tool);
        // The allow list scopes backend built-ins; local tools are only removed by the deny list.
        !self
            .disallowed_tools
            .iter()
            .any(|entry| entry == tool || *entry == qualified)
    }

    /// Whether a backend built-in passes the allow and deny lists.
    /// An empty allow list permits every built-in.
    pub fn builtin_permitted(&self, name: &str) -> bool {
        let allowed = self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == name);
        allowed && !self.disallowed_tools.iter().any(|t| t == name)
    }

    pub fn sandbox_enabled(&self) -> bool {
        self.sandbox.as_ref().map(|s| s.enabled).unwrap_or(false)
    }

    pub fn apply(&mut self, update: AgentConfigUpdate) {
        if let Some(model) = update.model {
            self.model = Some(model);
        }
        if let Some(prompt) = update.system_prompt {
            self.system_prompt = Some(prompt);
        }
        if let Some(turns) = update.max_turns {
            self.max_turns = Some(turns);
        }
        if let Some(budget) = update.max_budget_usd {
            self.max_budget_usd = Some(budget);
        }
        if let Some(allowed) = update.allowed_tools {
            self.allowed_tools = allowed;
        }
        if let Some(disallowed) = update.disallowed_tools {
            self.disallowed_tools = disallowed;
        }
        if let Some(mode) = update.permission_mode {
            self.permission_mode = mode;
        }
    }
}

/// Partial update applied with [`HarnessSession::update_config`].
#[derive(Debug, Clone, Default)]
pub struct AgentConfigUpdate {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub permission_mode: Option<PermissionMode>,
}

// ── Session contract ──────────────────────────────────────────────

#[async_trait]
pub trait Harness: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    /// Create a session for `prompt`. Performs no backend I/O.
    fn run(&self, config: AgentConfig, prompt: &str) -> Box<dyn HarnessSession>;

    /// Release adapter-wide resources such as a shared server process.
    async fn shutdown(&self) {}
}

#[async_trait]
pub trait HarnessSession: Send {
    /// Next event. A turn ends with its `Result`; queued prompts then start
    /// the next turn. `None` once nothing is running or queued. Backend
    /// failures surface as `Err`.
    async fn next_event(&mut self) -> Option<Result<AgentEvent, Error>>;

    /// Queue a follow-up prompt; its events follow on `next_event`.
    fn send(&mut self, prompt: &str);

    fn update_config(&mut self, update: AgentConfigUpdate);

    /// Release every owned resource. Safe to call repeatedly.
    async fn close(&mut self);
}

/// Adapt a session into a `Stream` of the events of every queued turn,
/// closing it at the end.
pub fn into_stream(
    mut session: Box<dyn HarnessSession>,
) -> impl Stream<Item = Result<AgentEvent, Error>> + Send {
    async_stream::stream! {
        while let Some(event) = session.next_event().await {
            yield event;
        }
        session.close().await;
    }
}

/// What a consumed turn produced.
#[derive(Debug, Clone, Default)]
pub struct TurnSummary {
    pub text: Vec<String>,
    pub errors: Vec<String>,
    pub success: bool,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub session_id: Option<String>,
}

impl TurnSummary {
    pub fn record(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Text { body } => self.text.push(body.clone()),
            AgentEvent::Error { message, .. } => self.errors.push(message.clone()),
            AgentEvent::Result {
                success,
                text,
                usage,
                cost_usd,
                session_id,
                ..
            } => {
                self.success = *success;
                self.usage = *usage;
                self.cost_usd = *cost_usd;
                self.session_id = session_id.clone();
                if !success {
                    if let Some(text) = text.as_ref().filter(|t| !t.is_empty()) {
                        if !self.errors.contains(text) {
                            self.errors.push(text.clone());
                        }
                    }
                }
            }
            AgentEvent::ToolUse { .. } | AgentEvent::ToolResult { .. } => {}
        }
    }

    pub fn joined_text(&self) -> String {
        self.text.join("\n")
    }

    /// Best description of why the turn failed.
    pub fn failure_message(&self) -> String {
        self.errors
            .last()
            .cloned()
            .unwrap_or_else(|| "session ended without success".to_string())
    }
}

/// Consume events up to and including the current turn's `Result`, passing
/// each to `on_event`.
pub async fn collect_turn<F>(
    session: &mut dyn HarnessSession,
    mut on_event: F,
) -> Result<TurnSummary, Error>
where
    F: FnMut(&AgentEvent) + Send,
{
    let mut summary = TurnSummary::default();
    while let Some(event) = session.next_event().await {
        let event = event?;
        on_event(&event);
        summary.record(&event);
        if event.is_result() {
            break;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, input: Value) -> ToolOutput {
            ToolOutput::success(input.to_string())
        }
    }

    fn echo_tool(name: &str) -> LocalTool {
        LocalTool {
            definition: ToolDefinition {
                name: name.to_string(),
                description: "echo".to_string(),
                input_schema: json!({"type": "object"}),
            },
            handler: Arc::new(Echo),
        }
    }

    #[test]
    fn find_tool_accepts_bare_and_qualified_names() {
        let config = AgentConfig::new("/tmp")
            .with_tool_server(ToolServer::new("memento").with_tool(echo_tool("submit")));
        assert!(config.find_tool("submit").is_some());
        assert!(config.find_tool("mcp__memento__submit").is_some());
        assert!(config.find_tool("mcp__other__submit").is_none());
        assert!(config.find_tool("Bash").is_none());
    }

    #[test]
    fn builtin_filter_applies_allow_then_deny() {
        let mut config = AgentConfig::new("/tmp");
        assert!(config.builtin_permitted("Write"));
        config.allowed_tools = vec!["Read".to_string(), "mcp__memento__submit".to_string()];
        assert!(config.builtin_permitted("Read"));
        assert!(!config.builtin_permitted("Write"));
        config.allowed_tools.clear();
        config.disallowed_tools = vec!["Bash".to_string()];
        assert!(!config.builtin_permitted("Bash"));
        assert!(config.builtin_permitted("Edit"));
    }

    #[test]
    fn resolve_tool_honours_deny_list() {
        let mut config = AgentConfig::new("/tmp")
            .with_tool_server(ToolServer::new("memento").with_tool(echo_tool("submit")));
        assert!(config.resolve_tool("mcp__memento__submit").is_some());
        config.disallowed_tools = vec!["submit".to_string()];
        assert!(config.resolve_tool("mcp__memento__submit").is_none());
        assert!(config.resolve_tool("submit").is_none());
    }

    #[test]
    fn disallowed_tools_are_filtered_from_local_tools() {
        let mut config = AgentConfig::new("/tmp").with_tool_server(
            ToolServer::new("s")
                .with_tool(echo_tool("a"))
                .with_tool(echo_tool("b")),
        );
        config.disallowed_tools = vec!["mcp__s__b".to_string()];
        let names: Vec<_> = config
            .local_tools()
            .iter()
            .map(|t| t.definition.name.clone())
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn apply_update_only_touches_given_fields() {
        let mut config = AgentConfig::new("/tmp");
        config.model = Some("m1".to_string());
        config.max_turns = Some(5);
        config.apply(AgentConfigUpdate {
            model: Some("m2".to_string()),
            permission_mode: Some(PermissionMode::Plan),
            ..Default::default()
        });
        assert_eq!(config.model.as_deref(), Some("m2"));
        assert_eq!(config.max_turns, Some(5));
        assert_eq!(config.permission_mode, PermissionMode::Plan);
    }

    #[test]
    fn turn_summary_tracks_failure_text() {
        let mut summary = TurnSummary::default();
        summary.record(&AgentEvent::text("hello"));
        summary.record(&AgentEvent::Result {
            success: false,
            text: Some("usage limit reached".to_string()),
            usage: None,
            cost_usd: None,
            duration_ms: None,
            session_id: None,
        });
        assert!(!summary.success);
        assert_eq!(summary.joined_text(), "hello");
        assert_eq!(summary.failure_message(), "usage limit reached");
    }

    /// Replays two turns (the second one queued with `send`) and records closes.
    struct TwoTurnSession {
        turns: VecDeque<Vec<AgentEvent>>,
        current: VecDeque<AgentEvent>,
        queued: usize,
        closes: Arc<AtomicUsize>,
    }

    fn done(success: bool) -> AgentEvent {
        AgentEvent::Result {
            success,
            text: None,
            usage: None,
            cost_usd: None,
            duration_ms: None,
            session_id: Some("s1".to_string()),
        }
    }

    #[async_trait]
    impl HarnessSession for TwoTurnSession {
        async fn next_event(&mut self) -> Option<Result<AgentEvent, Error>> {
            if self.current.is_empty() {
                if self.queued == 0 {
                    return None;
                }
                self.queued -= 1;
                self.current = self.turns.pop_front()?.into();
            }
            self.current.pop_front().map(Ok)
        }

        fn send(&mut self, _prompt: &str) {
            self.queued += 1;
        }

        fn update_config(&mut self, _update: AgentConfigUpdate) {}

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn session_stream_yields_every_queued_turn_then_closes() {
        use futures::StreamExt;

        let closes = Arc::new(AtomicUsize::new(0));
        let mut session = TwoTurnSession {
            turns: vec![
                vec![AgentEvent::text("first"), done(true)],
                vec![AgentEvent::text("second"), done(false)],
            ]
            .into(),
            current: Default::default(),
            queued: 1,
            closes: Arc::clone(&closes),
        };
        session.send("follow up");

        let events: Vec<AgentEvent> = into_stream(Box::new(session))
            .map(|event| event.unwrap())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                AgentEvent::text("first"),
                done(true),
                AgentEvent::text("second"),
                done(false),
            ]
        );
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collect_turn_stops_at_the_first_result() {
        let mut session = TwoTurnSession {
            turns: vec![
                vec![AgentEvent::text("a"), done(true)],
                vec![AgentEvent::text("b"), done(true)],
            ]
            .into(),
            current: Default::default(),
            queued: 2,
            closes: Default::default(),
        };
        let mut seen = 0;
        let summary = collect_turn(&mut session, |_| seen += 1).await.unwrap();
        assert_eq!(seen, 2);
        assert_eq!(summary.joined_text(), "a");
        assert!(summary.success);
        let summary = collect_turn(&mut session, |_| {}).await.unwrap();
        assert_eq!(summary.joined_text(), "b");
    }
}
