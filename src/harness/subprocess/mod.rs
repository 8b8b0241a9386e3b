//! Subprocess harness: one CLI child per turn, JSONL over stdio.
//!
//! Continuity across turns comes from a per-session id passed with
//! `--session-id` and a per-session temp directory holding the local tool
//! definitions. Local tool calls seen on stdout are answered on stdin before
//! the corresponding event reaches the caller.

pub mod protocol;

use std::collections::{HashSet, VecDeque};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::AgentEvent;
use super::shared::{drain_lines, truncate, ProcessHandle};
use super::{AgentConfig, AgentConfigUpdate, CommandWrapper, Harness, HarnessSession};
use protocol::{parse_line, StdinCommand};

/// Configuration for the subprocess harness.
#[derive(Clone)]
pub struct CliHarnessConfig {
    pub program: String,
    /// Arguments placed before the generated ones.
    pub base_args: Vec<String>,
    /// Sandbox rewriter applied when a session enables its sandbox profile.
    pub wrapper: Option<Arc<dyn CommandWrapper>>,
}

impl Default for CliHarnessConfig {
    fn default() -> Self {
        Self {
            program: std::env::var("AUTONAV_CLI_PATH")
                .unwrap_or_else(|_| "autonav-agent".to_string()),
            base_args: Vec::new(),
            wrapper: None,
        }
    }
}

impl std::fmt::Debug for CliHarnessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliHarnessConfig")
            .field("program", &self.program)
            .field("base_args", &self.base_args)
            .field("wrapper", &self.wrapper.is_some())
            .finish()
    }
}

pub struct CliHarness {
    config: Arc<CliHarnessConfig>,
}

impl CliHarness {
    pub fn new() -> Self {
        Self::with_config(CliHarnessConfig::default())
    }

    pub fn with_config(config: CliHarnessConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn start_session(&self, config: AgentConfig, prompt: &str) -> CliSession {
        CliSession::new(Arc::clone(&self.config), config, prompt)
    }
}

impl Default for CliHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Harness for CliHarness {
    fn id(&self) -> &str {
        "cli"
    }

    fn name(&self) -> &str {
        "Subprocess CLI"
    }

    fn run(&self, config: AgentConfig, prompt: &str) -> Box<dyn HarnessSession> {
        Box::new(self.start_session(config, prompt))
    }
}

/// One running child process and the state of its turn.
struct Turn {
    process: ProcessHandle,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<AgentEvent>,
    /// Local tool calls already answered; the CLI's echo of them is dropped.
    answered: HashSet<String>,
    session_id: Option<String>,
}

impl Turn {
    async fn write(&mut self, command: StdinCommand<'_>) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("CLI stdin already closed"))?;
        stdin
            .write_all(command.to_line().as_bytes())
            .await
            .context("Failed to write to CLI stdin")?;
        stdin.flush().await.context("Failed to flush CLI stdin")?;
        Ok(())
    }
}

pub struct CliSession {
    harness: Arc<CliHarnessConfig>,
    config: AgentConfig,
    session_id: String,
    queued: VecDeque<String>,
    turn: Option<Turn>,
    tool_dir: Option<TempDir>,
    spawned: bool,
    system_prompt_sent: bool,
    closed: bool,
}

impl CliSession {
    fn new(harness: Arc<CliHarnessConfig>, config: AgentConfig, prompt: &str) -> Self {
        Self {
            harness,
            config,
            session_id: Uuid::new_v4().to_string(),
            queued: VecDeque::from([prompt.to_string()]),
            turn: None,
            tool_dir: None,
            spawned: false,
            system_prompt_sent: false,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write local tool definitions into the session temp dir.
    fn write_tool_file(&mut self) -> Result<Option<std::path::PathBuf>> {
        let tools: Vec<_> = self
            .config
            .local_tools()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.definition.name,
                    "description": tool.definition.description,
                    "input_schema": tool.definition.input_schema,
                })
            })
            .collect();
        if tools.is_empty() {
            return Ok(None);
        }

        if self.tool_dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("autonav-session-")
                .tempdir()
                .context("Failed to create session temp dir")?;
            self.tool_dir = Some(dir);
        }
        let Some(dir) = self.tool_dir.as_ref() else {
            return Ok(None);
        };
        let path = dir.path().join("tools.json");
        let body = serde_json::to_vec_pretty(&tools)?;
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Some(path))
    }

    fn build_args(&mut self) -> Result<Vec<String>> {
        let mut args = self.harness.base_args.clone();
        args.push("--session-id".to_string());
        args.push(self.session_id.clone());
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(turns) = self.config.max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        args.push("--permission-mode".to_string());
        args.push(self.config.permission_mode.as_str().to_string());
        if !self.config.allowed_tools.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(self.config.allowed_tools.join(","));
        }
        if !self.config.disallowed_tools.is_empty() {
            args.push("--disallowed-tools".to_string());
            args.push(self.config.disallowed_tools.join(","));
        }
        if let Some(path) = self.write_tool_file()? {
            args.push("--tools".to_string());
            args.push(path.display().to_string());
        }
        if !self.spawned {
            if let Some(timeout) = self.config.inactivity_timeout {
                args.push("--destroy-after".to_string());
                args.push(timeout.as_secs().to_string());
            }
        }
        Ok(args)
    }

    async fn start_turn(&mut self, prompt: &str) -> Result<Turn> {
        let args = self.build_args()?;
        let (program, args) = match (&self.harness.wrapper, self.config.sandbox.as_ref()) {
            (Some(wrapper), Some(profile)) if profile.enabled => {
                wrapper.wrap(&self.harness.program, &args, profile)
            }
            _ => (self.harness.program.clone(), args),
        };

        debug!("Spawning CLI: {} {:?}", program, args);
        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(&self.config.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn CLI '{}'", program))?;
        self.spawned = true;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture CLI stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            drain_lines(stderr, format!("CLI[{}]", &self.session_id[..8]));
        }
        info!(
            "CLI turn started (session {}, pid {:?})",
            self.session_id,
            child.id()
        );

        let mut turn = Turn {
            process: ProcessHandle::new(child, "CLI process"),
            stdin,
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            answered: HashSet::new(),
            session_id: None,
        };

        if !self.system_prompt_sent {
            if let Some(system_prompt) = self.config.system_prompt.clone() {
                turn.write(StdinCommand::SetSystemPrompt {
                    content: &system_prompt,
                })
                .await?;
            }
            self.system_prompt_sent = true;
        }
        turn.write(StdinCommand::SendPrompt { content: prompt }).await?;
        Ok(turn)
    }

    /// Read stdout until at least one event is pending or the child is gone.
    async fn pump(&mut self) -> Result<()> {
        let Some(turn) = self.turn.as_mut() else {
            return Ok(());
        };
        let line = turn
            .lines
            .next_line()
            .await
            .context("Failed to read CLI stdout")?;

        let Some(line) = line else {
            let success = turn.process.wait().await.unwrap_or(false);
            debug!("CLI stdout closed without a result (success={})", success);
            let session_id = turn.session_id.clone().or_else(|| Some(self.session_id.clone()));
            turn.pending
                .push_back(AgentEvent::synthesized_result(success, session_id));
            return Ok(());
        };

        for event in parse_line(&line) {
            match event {
                AgentEvent::ToolUse { name, id, input } => {
                    if let Some(tool) = self.config.resolve_tool(&name) {
                        debug!("Dispatching local tool {} ({})", name, id);
                        let output = tool.handler.call(input.clone()).await;
                        turn.write(StdinCommand::ToolResult {
                            tool_call_id: &id,
                            content: &output.content,
                            is_error: output.is_error,
                        })
                        .await?;
                        turn.answered.insert(id.clone());
                        turn.pending.push_back(AgentEvent::ToolUse {
                            name,
                            id: id.clone(),
                            input,
                        });
                        turn.pending.push_back(AgentEvent::ToolResult {
                            tool_use_id: id,
                            content: output.content,
                            is_error: output.is_error,
                        });
                    } else {
                        turn.pending.push_back(AgentEvent::ToolUse { name, id, input });
                    }
                }
                AgentEvent::ToolResult { ref tool_use_id, .. }
                    if turn.answered.contains(tool_use_id) =>
                {
                    debug!("Dropping echoed result for {}", truncate(tool_use_id, 40));
                }
                AgentEvent::Result {
                    success,
                    text,
                    usage,
                    cost_usd,
                    duration_ms,
                    session_id,
                } => {
                    let session_id = session_id.or_else(|| Some(self.session_id.clone()));
                    turn.session_id = session_id.clone();
                    turn.pending.push_back(AgentEvent::Result {
                        success,
                        text,
                        usage,
                        cost_usd,
                        duration_ms,
                        session_id,
                    });
                }
                other => turn.pending.push_back(other),
            }
        }
        Ok(())
    }

    async fn end_turn(&mut self) {
        if let Some(mut turn) = self.turn.take() {
            // EOF on stdin tells the CLI the turn is over.
            drop(turn.stdin.take());
            turn.process.terminate().await;
        }
    }
}

#[async_trait]
impl HarnessSession for CliSession {
    async fn next_event(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            if self.closed {
                return None;
            }

            if self.turn.is_none() {
                let prompt = self.queued.pop_front()?;
                match self.start_turn(&prompt).await {
                    Ok(turn) => self.turn = Some(turn),
                    Err(e) => return Some(Err(e)),
                }
            }

            if let Some(event) = self.turn.as_mut().and_then(|t| t.pending.pop_front()) {
                if event.is_result() {
                    self.end_turn().await;
                }
                return Some(Ok(event));
            }

            if let Err(e) = self.pump().await {
                warn!("CLI turn failed: {:#}", e);
                self.end_turn().await;
                return Some(Err(e));
            }
        }
    }

    fn send(&mut self, prompt: &str) {
        self.queued.push_back(prompt.to_string());
    }

    fn update_config(&mut self, update: AgentConfigUpdate) {
        if update.system_prompt.is_some() {
            self.system_prompt_sent = false;
        }
        self.config.apply(update);
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.queued.clear();
        self.end_turn().await;
        if let Some(dir) = self.tool_dir.take() {
            if let Err(e) = dir.close() {
                debug!("Failed to remove session temp dir: {}", e);
            }
        }
        debug!("CLI session {} closed", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{LocalTool, ToolDefinition, ToolHandler, ToolOutput, ToolServer};
    use serde_json::Value;
    use std::path::Path;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, input: Value) -> ToolOutput {
            ToolOutput::success(input.to_string())
        }
    }

    fn echo_server() -> ToolServer {
        ToolServer::new("memento").with_tool(LocalTool {
            definition: ToolDefinition {
                name: "echo".to_string(),
                description: "Echo the input".to_string(),
                input_schema: json!({"type": "object"}),
            },
            handler: Arc::new(Echo),
        })
    }

    /// A harness whose "CLI" is `sh <script> <log dir>`.
    fn fake_cli(dir: &Path, script: &str) -> CliHarness {
        let path = dir.join("fake-cli.sh");
        std::fs::write(&path, script).unwrap();
        CliHarness::with_config(CliHarnessConfig {
            program: "sh".to_string(),
            base_args: vec![path.display().to_string(), dir.display().to_string()],
            wrapper: None,
        })
    }

    async fn drain(session: &mut dyn HarnessSession) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = session.next_event().await {
            let event = event.unwrap();
            let done = event.is_result();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    const TOOL_SCRIPT: &str = r#"
log="$1"; shift
echo "$@" >> "$log/args.log"
read -r prompt
printf '%s\n' "$prompt" >> "$log/stdin.log"
echo 'warming up'
echo '{"entry_type":"tool_call","tool_name":"mcp__memento__echo","id":"call_1","input":{"x":1}}'
read -r reply
printf '%s\n' "$reply" >> "$log/stdin.log"
echo '{"entry_type":"tool_result","tool_call_id":"call_1","content":"echoed"}'
echo '{"entry_type":"message","content":"done"}'
echo '{"type":"result","success":true,"usage":{"input_tokens":3,"output_tokens":4}}'
"#;

    #[tokio::test]
    async fn local_tool_calls_are_answered_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let harness = fake_cli(dir.path(), TOOL_SCRIPT);
        let config = AgentConfig::new(dir.path()).with_tool_server(echo_server());
        let mut session = harness.run(config, "do it");

        let events = drain(session.as_mut()).await;
        session.close().await;

        assert_eq!(events.len(), 4, "{:?}", events);
        assert!(matches!(&events[0], AgentEvent::ToolUse { id, .. } if id == "call_1"));
        assert_eq!(
            events[1],
            AgentEvent::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: r#"{"x":1}"#.to_string(),
                is_error: false,
            }
        );
        assert_eq!(events[2], AgentEvent::text("done"));
        match &events[3] {
            AgentEvent::Result { success, usage, .. } => {
                assert!(success);
                assert_eq!(usage.unwrap().input_tokens, 3);
            }
            other => panic!("Expected Result, got {:?}", other),
        }

        let stdin_log = std::fs::read_to_string(dir.path().join("stdin.log")).unwrap();
        let lines: Vec<Value> = stdin_log
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["type"], "send_prompt");
        assert_eq!(lines[0]["content"], "do it");
        assert_eq!(lines[1]["type"], "tool_result");
        assert_eq!(lines[1]["tool_call_id"], "call_1");

        let args = std::fs::read_to_string(dir.path().join("args.log")).unwrap();
        assert!(args.contains("--tools"));
    }

    #[tokio::test]
    async fn follow_up_turns_reuse_session_id_and_skip_destroy_after() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
log="$1"; shift
echo "$@" >> "$log/args.log"
while read -r line; do
  printf '%s\n' "$line" >> "$log/stdin.log"
  case "$line" in
    *send_prompt*) echo '{"type":"result","success":true}'; exit 0 ;;
  esac
done
"#;
        let harness = fake_cli(dir.path(), script);
        let mut config = AgentConfig::new(dir.path());
        config.system_prompt = Some("be brief".to_string());
        config.inactivity_timeout = Some(Duration::from_secs(600));
        let mut session = harness.start_session(config, "first");
        let session_id = session.session_id().to_string();

        assert_eq!(drain(&mut session).await.len(), 1);
        session.send("second");
        assert_eq!(drain(&mut session).await.len(), 1);
        assert!(session.next_event().await.is_none());
        session.close().await;

        let args: Vec<String> = std::fs::read_to_string(dir.path().join("args.log"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(args.len(), 2);
        assert!(args[0].contains("--destroy-after 600"));
        assert!(!args[1].contains("--destroy-after"));
        assert!(args.iter().all(|a| a.contains(&session_id)));

        let stdin_log = std::fs::read_to_string(dir.path().join("stdin.log")).unwrap();
        assert_eq!(stdin_log.matches("set_system_prompt").count(), 1);
        assert_eq!(stdin_log.matches("send_prompt").count(), 2);
    }

    #[tokio::test]
    async fn missing_result_is_synthesized_from_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
read -r prompt
echo 'not json at all'
echo '{"entry_type":"message","content":"partial"}'
exit 2
"#;
        let harness = fake_cli(dir.path(), script);
        let mut session = harness.run(AgentConfig::new(dir.path()), "go");
        let events = drain(session.as_mut()).await;
        session.close().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], AgentEvent::text("partial"));
        match &events[1] {
            AgentEvent::Result { success, .. } => assert!(!success),
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn run_performs_no_io_until_iterated() {
        let harness = CliHarness::with_config(CliHarnessConfig {
            program: "/nonexistent/autonav-agent".to_string(),
            base_args: Vec::new(),
            wrapper: None,
        });
        let mut session = harness.run(AgentConfig::new("/tmp"), "hello");
        let first = session.next_event().await;
        assert!(matches!(first, Some(Err(_))));
        session.close().await;
    }

    #[tokio::test]
    async fn child_is_spawned_on_first_event_not_on_run() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
log="$1"; shift
echo "$@" >> "$log/args.log"
read -r prompt
echo '{"type":"result","success":true}'
"#;
        let harness = fake_cli(dir.path(), script);
        let config = AgentConfig::new(dir.path()).with_tool_server(echo_server());
        let mut session = harness.run(config, "hello");
        session.send("queued before start");
        session.update_config(AgentConfigUpdate {
            model: Some("m".to_string()),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.path().join("args.log").exists());

        assert!(session.next_event().await.unwrap().unwrap().is_result());
        let args = std::fs::read_to_string(dir.path().join("args.log")).unwrap();
        assert_eq!(args.lines().count(), 1);
        assert!(args.contains("--model m"));
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
read -r prompt
echo '{"entry_type":"message","content":"working"}'
sleep 30
"#;
        let harness = fake_cli(dir.path(), script);
        let config = AgentConfig::new(dir.path()).with_tool_server(echo_server());
        let mut session = harness.start_session(config, "go");
        let first = session.next_event().await.unwrap().unwrap();
        assert_eq!(first, AgentEvent::text("working"));
        let tool_dir = session.tool_dir.as_ref().map(|d| d.path().to_path_buf()).unwrap();
        assert!(tool_dir.exists());

        session.close().await;
        session.close().await;
        assert!(!tool_dir.exists());
        assert!(session.next_event().await.is_none());
    }

    struct Prefix;

    impl CommandWrapper for Prefix {
        fn wrap(
            &self,
            program: &str,
            args: &[String],
            _profile: &crate::harness::SandboxProfile,
        ) -> (String, Vec<String>) {
            let mut wrapped = vec![program.to_string()];
            wrapped.extend(args.iter().cloned());
            ("env".to_string(), wrapped)
        }
    }

    #[tokio::test]
    async fn sandboxed_sessions_go_through_the_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
log="$1"; shift
echo "$@" >> "$log/args.log"
read -r prompt
echo '{"type":"result","success":true}'
"#;
        let path = dir.path().join("fake-cli.sh");
        std::fs::write(&path, script).unwrap();
        let harness = CliHarness::with_config(CliHarnessConfig {
            program: "sh".to_string(),
            base_args: vec![path.display().to_string(), dir.path().display().to_string()],
            wrapper: Some(Arc::new(Prefix)),
        });
        let mut config = AgentConfig::new(dir.path());
        config.sandbox = Some(crate::harness::SandboxProfile {
            enabled: true,
            ..Default::default()
        });
        let mut session = harness.run(config, "go");
        let events = drain(session.as_mut()).await;
        session.close().await;
        assert!(matches!(events.as_slice(), [AgentEvent::Result { success: true, .. }]));
        assert!(dir.path().join("args.log").exists());
    }
}
