//! Cross-agent queries: `ask_<peer>` tools that put a question to another
//! navigator in a short sub-session.
//!
//! Depth is threaded explicitly. Tools built at depth `d` run their
//! sub-session with ask tools at `d + 1`, and a handler at
//! [`MAX_QUERY_DEPTH`] refuses without touching a backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::harness::{
    collect_turn, json_schema_for, AgentConfig, Harness, LocalTool, ToolDefinition, ToolHandler,
    ToolOutput, ToolServer,
};

pub const MAX_QUERY_DEPTH: u32 = 3;
/// Turn cap for a peer sub-session.
pub const ASK_MAX_TURNS: u32 = 10;
pub const ASK_SERVER_NAME: &str = "autonav-ask";
pub const ASK_MODEL: &str = "claude-haiku-4-5";
/// Instructions file a navigator keeps in its root.
pub const INSTRUCTIONS_FILE: &str = "CLAUDE.md";

const ENV_PREFIX: &str = "AUTONAV_NAVIGATOR_";

/// Resolves a peer navigator name to its directory.
pub trait NavigatorLookup: Send + Sync {
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

/// `AUTONAV_NAVIGATOR_<NAME>` first, then an explicit registry.
#[derive(Debug, Clone, Default)]
pub struct EnvThenRegistryLookup {
    registry: HashMap<String, PathBuf>,
}

impl EnvThenRegistryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_navigator(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.registry.insert(name.into(), path.into());
        self
    }

    /// `platform-docs` -> `AUTONAV_NAVIGATOR_PLATFORM_DOCS`
    pub fn env_var_name(name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", ENV_PREFIX, suffix)
    }
}

impl NavigatorLookup for EnvThenRegistryLookup {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let from_env = std::env::var(Self::env_var_name(name))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let path = from_env.or_else(|| self.registry.get(name).cloned())?;
        if path.is_dir() {
            Some(path)
        } else {
            debug!("Navigator {} resolved to missing directory {}", name, path.display());
            None
        }
    }
}

/// Everything an ask handler needs, including the depth it runs at.
#[derive(Clone)]
pub struct AskContext {
    pub harness: Arc<dyn Harness>,
    pub lookup: Arc<dyn NavigatorLookup>,
    pub depth: u32,
    pub model: Option<String>,
}

impl AskContext {
    pub fn new(harness: Arc<dyn Harness>, lookup: Arc<dyn NavigatorLookup>) -> Self {
        Self {
            harness,
            lookup,
            depth: 0,
            model: Some(ASK_MODEL.to_string()),
        }
    }

    pub fn with_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AskInput {
    /// The question for the other navigator. Include any context it needs.
    question: String,
}

pub fn ask_tool_name(peer: &str) -> String {
    let suffix: String = peer
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("ask_{}", suffix)
}

/// One `ask_<peer>` tool per peer, all bound to `ctx.depth`.
pub fn ask_tools(peers: &[String], ctx: &AskContext) -> ToolServer {
    let peers = Arc::new(peers.to_vec());
    let mut server = ToolServer::new(ASK_SERVER_NAME);
    for peer in peers.iter() {
        server = server.with_tool(LocalTool {
            definition: ToolDefinition {
                name: ask_tool_name(peer),
                description: format!(
                    "Ask the {} navigator a question and return its answer.",
                    peer
                ),
                input_schema: json_schema_for::<AskInput>(),
            },
            handler: Arc::new(AskPeer {
                peer: peer.clone(),
                peers: Arc::clone(&peers),
                ctx: ctx.clone(),
            }),
        });
    }
    server
}

struct AskPeer {
    peer: String,
    peers: Arc<Vec<String>>,
    ctx: AskContext,
}

impl AskPeer {
    async fn sub_session_config(&self, dir: PathBuf) -> AgentConfig {
        let instructions = tokio::fs::read_to_string(dir.join(INSTRUCTIONS_FILE))
            .await
            .ok();
        let mut config = AgentConfig::new(dir);
        config.model = self.ctx.model.clone();
        config.max_turns = Some(ASK_MAX_TURNS);
        config.system_prompt = instructions;

        let others: Vec<String> = self
            .peers
            .iter()
            .filter(|p| **p != self.peer)
            .cloned()
            .collect();
        if !others.is_empty() {
            let nested = self.ctx.with_depth(self.ctx.depth + 1);
            config = config.with_tool_server(ask_tools(&others, &nested));
        }
        config
    }
}

#[async_trait]
impl ToolHandler for AskPeer {
    async fn call(&self, input: Value) -> ToolOutput {
        let input: AskInput = match serde_json::from_value(input) {
            Ok(input) => input,
            Err(e) => return ToolOutput::error(format!("Invalid arguments: {}", e)),
        };
        if self.ctx.depth >= MAX_QUERY_DEPTH {
            warn!(
                "Refusing to ask {} at depth {} (limit {})",
                self.peer, self.ctx.depth, MAX_QUERY_DEPTH
            );
            return ToolOutput::error(format!(
                "Query depth limit of {} reached. Answer with what you already know.",
                MAX_QUERY_DEPTH
            ));
        }
        let Some(dir) = self.ctx.lookup.resolve(&self.peer) else {
            return ToolOutput::error(format!(
                "Navigator '{}' not found. Set {} or register it.",
                self.peer,
                EnvThenRegistryLookup::env_var_name(&self.peer)
            ));
        };

        info!("Asking {} (depth {})", self.peer, self.ctx.depth);
        let config = self.sub_session_config(dir).await;
        let mut session = self.ctx.harness.run(config, &input.question);
        let outcome = collect_turn(session.as_mut(), |_| {}).await;
        session.close().await;

        match outcome {
            Ok(summary) if summary.success => {
                let answer = summary.joined_text();
                if answer.trim().is_empty() {
                    ToolOutput::success(format!("{} returned no answer.", self.peer))
                } else {
                    ToolOutput::success(answer)
                }
            }
            Ok(summary) => ToolOutput::error(format!(
                "{} could not answer: {}",
                self.peer,
                summary.failure_message()
            )),
            Err(e) => ToolOutput::error(format!("Failed to reach {}: {:#}", self.peer, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::events::AgentEvent;
    use crate::harness::{AgentConfigUpdate, HarnessSession};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct AnsweringHarness {
        configs: Mutex<Vec<AgentConfig>>,
        questions: Mutex<Vec<String>>,
    }

    impl AnsweringHarness {
        fn runs(&self) -> usize {
            self.configs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Harness for AnsweringHarness {
        fn id(&self) -> &str {
            "answering"
        }

        fn name(&self) -> &str {
            "Answering"
        }

        fn run(&self, config: AgentConfig, prompt: &str) -> Box<dyn HarnessSession> {
            self.configs.lock().unwrap().push(config);
            self.questions.lock().unwrap().push(prompt.to_string());
            Box::new(Scripted(
                vec![
                    AgentEvent::text("The deploy target is eu-west-1."),
                    AgentEvent::synthesized_result(true, None),
                ]
                .into(),
            ))
        }
    }

    struct Scripted(VecDeque<AgentEvent>);

    #[async_trait]
    impl HarnessSession for Scripted {
        async fn next_event(&mut self) -> Option<anyhow::Result<AgentEvent>> {
            self.0.pop_front().map(Ok)
        }

        fn send(&mut self, _prompt: &str) {}

        fn update_config(&mut self, _update: AgentConfigUpdate) {}

        async fn close(&mut self) {}
    }

    fn setup() -> (tempfile::TempDir, Arc<AnsweringHarness>, AskContext) {
        let root = tempfile::tempdir().unwrap();
        let infra = root.path().join("infra");
        let docs = root.path().join("docs");
        std::fs::create_dir(&infra).unwrap();
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(infra.join(INSTRUCTIONS_FILE), "You know the infrastructure.").unwrap();

        let lookup = EnvThenRegistryLookup::new()
            .with_navigator("infra", &infra)
            .with_navigator("docs", &docs);
        let harness = Arc::new(AnsweringHarness::default());
        let ctx = AskContext::new(harness.clone(), Arc::new(lookup));
        (root, harness, ctx)
    }

    fn peers() -> Vec<String> {
        vec!["infra".to_string(), "docs".to_string()]
    }

    fn tool<'a>(server: &'a ToolServer, name: &str) -> &'a LocalTool {
        server
            .tools
            .iter()
            .find(|t| t.definition.name == name)
            .unwrap()
    }

    #[tokio::test]
    async fn ask_runs_a_bounded_sub_session_in_the_peer_directory() {
        let (root, harness, ctx) = setup();
        let server = ask_tools(&peers(), &ctx);
        assert_eq!(server.tools.len(), 2);

        let output = tool(&server, "ask_infra")
            .handler
            .call(json!({"question": "Where do we deploy?"}))
            .await;
        assert!(!output.is_error);
        assert_eq!(output.content, "The deploy target is eu-west-1.");

        let configs = harness.configs.lock().unwrap();
        let config = &configs[0];
        assert_eq!(config.working_directory, root.path().join("infra"));
        assert_eq!(config.max_turns, Some(ASK_MAX_TURNS));
        assert_eq!(config.model.as_deref(), Some(ASK_MODEL));
        assert_eq!(
            config.system_prompt.as_deref(),
            Some("You know the infrastructure.")
        );
        let nested = &config.tool_servers[ASK_SERVER_NAME];
        let names: Vec<_> = nested.tools.iter().map(|t| t.definition.name.as_str()).collect();
        assert_eq!(names, vec!["ask_docs"]);
        assert_eq!(harness.questions.lock().unwrap()[0], "Where do we deploy?");
    }

    #[tokio::test]
    async fn depth_limit_rejects_without_running_a_backend() {
        let (_root, harness, ctx) = setup();
        let server = ask_tools(&peers(), &ctx.with_depth(MAX_QUERY_DEPTH));
        let output = tool(&server, "ask_infra")
            .handler
            .call(json!({"question": "anything"}))
            .await;
        assert!(output.is_error);
        assert!(output.content.contains("depth limit"));
        assert_eq!(harness.runs(), 0);
    }

    #[tokio::test]
    async fn nested_tools_carry_the_next_depth() {
        let (_root, harness, ctx) = setup();
        let server = ask_tools(&peers(), &ctx.with_depth(MAX_QUERY_DEPTH - 1));
        let output = tool(&server, "ask_infra")
            .handler
            .call(json!({"question": "first hop"}))
            .await;
        assert!(!output.is_error);
        assert_eq!(harness.runs(), 1);

        let nested = harness.configs.lock().unwrap()[0].tool_servers[ASK_SERVER_NAME].clone();
        let output = tool(&nested, "ask_docs")
            .handler
            .call(json!({"question": "second hop"}))
            .await;
        assert!(output.is_error);
        assert_eq!(harness.runs(), 1);
    }

    #[tokio::test]
    async fn unknown_peers_and_bad_input_are_tool_errors() {
        let (_root, harness, ctx) = setup();
        let server = ask_tools(&["ghost".to_string()], &ctx);
        let output = tool(&server, "ask_ghost")
            .handler
            .call(json!({"question": "hello?"}))
            .await;
        assert!(output.is_error);
        assert!(output.content.contains("AUTONAV_NAVIGATOR_GHOST"));

        let output = tool(&server, "ask_ghost").handler.call(json!({})).await;
        assert!(output.is_error);
        assert_eq!(harness.runs(), 0);
    }

    #[test]
    fn environment_overrides_the_registry() {
        let override_dir = tempfile::tempdir().unwrap();
        let registered = tempfile::tempdir().unwrap();
        let name = "env-override-peer";
        let lookup = EnvThenRegistryLookup::new().with_navigator(name, registered.path());
        assert_eq!(lookup.resolve(name), Some(registered.path().to_path_buf()));

        let var = EnvThenRegistryLookup::env_var_name(name);
        assert_eq!(var, "AUTONAV_NAVIGATOR_ENV_OVERRIDE_PEER");
        std::env::set_var(&var, override_dir.path());
        assert_eq!(lookup.resolve(name), Some(override_dir.path().to_path_buf()));
        std::env::remove_var(&var);

        assert_eq!(lookup.resolve("missing"), None);
    }

    #[test]
    fn tool_names_are_sanitized() {
        assert_eq!(ask_tool_name("platform-docs"), "ask_platform_docs");
    }
}
