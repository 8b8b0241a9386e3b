//! Server harness: a shared agent server over HTTP, events over SSE.
//!
//! The server process is started lazily on the first session and shared by
//! every session of the harness. Each session owns one remote session, one
//! SSE subscription and, when local tools are configured, a [`ToolBridge`].

pub mod bridge;
pub mod client;
pub mod sse;

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::events::AgentEvent;
use super::shared::{allocate_port, drain_lines, ProcessHandle};
use super::{AgentConfig, AgentConfigUpdate, Harness, HarnessSession};
use bridge::ToolBridge;
use client::{PromptRequest, ServerClient};
use sse::SseTranslator;

/// How long a freshly spawned server gets to start answering.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the SSE subscription to open.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerHarnessConfig {
    /// Executable started with `serve --hostname 127.0.0.1 --port N`.
    pub cli_path: String,
    /// Use an already running server instead of spawning one.
    pub base_url: Option<String>,
    pub startup_timeout: Duration,
}

impl Default for ServerHarnessConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("AUTONAV_SERVER_CLI").unwrap_or_else(|_| "opencode".to_string()),
            base_url: std::env::var("AUTONAV_SERVER_URL").ok(),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }
}

struct RunningServer {
    client: ServerClient,
    process: Option<ProcessHandle>,
}

struct Shared {
    config: ServerHarnessConfig,
    server: Mutex<Option<RunningServer>>,
}

impl Shared {
    /// Client for the running server, starting it first if needed.
    async fn ensure_server(&self) -> Result<ServerClient> {
        let mut guard = self.server.lock().await;
        if let Some(server) = guard.as_ref() {
            return Ok(server.client.clone());
        }

        let server = match &self.config.base_url {
            Some(url) => {
                info!("Using external agent server at {}", url);
                RunningServer {
                    client: ServerClient::new(url.clone()),
                    process: None,
                }
            }
            None => self.spawn_server().await?,
        };
        let client = server.client.clone();
        *guard = Some(server);
        Ok(client)
    }

    async fn spawn_server(&self) -> Result<RunningServer> {
        let port = allocate_port().ok_or_else(|| anyhow!("No free port for agent server"))?;
        let mut child = Command::new(&self.config.cli_path)
            .arg("serve")
            .arg("--hostname")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start '{}' serve", self.config.cli_path))?;
        if let Some(stdout) = child.stdout.take() {
            drain_lines(stdout, "agent server stdout".to_string());
        }
        if let Some(stderr) = child.stderr.take() {
            drain_lines(stderr, "agent server".to_string());
        }

        let mut process = ProcessHandle::new(child, "agent server");
        let client = ServerClient::new(format!("http://127.0.0.1:{}", port));
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            if client.ping().await {
                break;
            }
            let exited = process
                .child_mut()
                .map(|c| matches!(c.try_wait(), Ok(Some(_))))
                .unwrap_or(true);
            if exited {
                anyhow::bail!("Agent server exited during startup");
            }
            if tokio::time::Instant::now() >= deadline {
                process.terminate().await;
                anyhow::bail!(
                    "Agent server did not become ready within {:?}",
                    self.config.startup_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        info!("Agent server listening on {}", client.base_url());
        Ok(RunningServer {
            client,
            process: Some(process),
        })
    }
}

pub struct ServerHarness {
    shared: Arc<Shared>,
}

impl ServerHarness {
    pub fn new() -> Self {
        Self::with_config(ServerHarnessConfig::default())
    }

    pub fn with_config(config: ServerHarnessConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                server: Mutex::new(None),
            }),
        }
    }
}

impl Default for ServerHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Harness for ServerHarness {
    fn id(&self) -> &str {
        "server"
    }

    fn name(&self) -> &str {
        "HTTP/SSE server"
    }

    fn run(&self, config: AgentConfig, prompt: &str) -> Box<dyn HarnessSession> {
        Box::new(ServerSession {
            shared: Arc::clone(&self.shared),
            config,
            queued: VecDeque::from([prompt.to_string()]),
            pending: VecDeque::new(),
            remote: None,
            in_turn: false,
            closed: false,
        })
    }

    async fn shutdown(&self) {
        if let Some(mut server) = self.shared.server.lock().await.take() {
            if let Some(process) = server.process.as_mut() {
                process.terminate().await;
                info!("Agent server stopped");
            }
        }
    }
}

/// Everything a session holds on the server side.
struct Remote {
    client: ServerClient,
    session_id: String,
    directory: String,
    events: Option<EventSource>,
    translator: SseTranslator,
    bridge: Option<ToolBridge>,
}

pub struct ServerSession {
    shared: Arc<Shared>,
    config: AgentConfig,
    queued: VecDeque<String>,
    pending: VecDeque<AgentEvent>,
    remote: Option<Remote>,
    in_turn: bool,
    closed: bool,
}

impl ServerSession {
    async fn connect(&mut self) -> Result<Remote> {
        let client = self.shared.ensure_server().await?;
        let directory = self.config.working_directory.display().to_string();

        let tools: Vec<_> = self.config.local_tools().into_iter().cloned().collect();
        let bridge = if tools.is_empty() {
            None
        } else {
            Some(ToolBridge::start(tools, &self.config.working_directory).await?)
        };

        let session = client.create_session(&directory, Some("autonav")).await?;
        debug!("Created remote session {}", session.id);

        let mut events = EventSource::new(client.events_request(&directory))
            .map_err(|e| anyhow!("Failed to open event stream: {}", e))?;
        events.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        // The prompt must not be sent before the subscription is live.
        let opened = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            loop {
                match events.next().await {
                    Some(Ok(Event::Open)) => return Ok(()),
                    Some(Ok(Event::Message(_))) => continue,
                    Some(Err(e)) => return Err(anyhow!("Event stream failed: {}", e)),
                    None => return Err(anyhow!("Event stream closed before opening")),
                }
            }
        })
        .await;
        match opened {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                events.close();
                let _ = client.delete_session(&session.id, &directory).await;
                return Err(e);
            }
            Err(_) => {
                events.close();
                let _ = client.delete_session(&session.id, &directory).await;
                anyhow::bail!("Timed out opening event stream");
            }
        }

        Ok(Remote {
            client,
            translator: SseTranslator::new(session.id.clone()),
            session_id: session.id,
            directory,
            events: Some(events),
            bridge,
        })
    }

    async fn start_turn(&mut self, prompt: &str) -> Result<()> {
        if self.remote.is_none() {
            let remote = self.connect().await?;
            self.remote = Some(remote);
        }
        let Some(remote) = self.remote.as_mut() else {
            return Err(anyhow!("Remote session unavailable"));
        };
        remote.translator.start_turn();
        remote
            .client
            .prompt_async(
                &remote.session_id,
                &remote.directory,
                PromptRequest {
                    text: prompt,
                    model: self.config.model.as_deref(),
                    system: self.config.system_prompt.as_deref(),
                    disabled_tools: &self.config.disallowed_tools,
                },
            )
            .await
    }

    /// Read one SSE message and queue whatever it produced.
    async fn pump(&mut self) {
        let Some(remote) = self.remote.as_mut() else {
            self.pending
                .push_back(AgentEvent::synthesized_result(false, None));
            return;
        };
        let next = match remote.events.as_mut() {
            Some(events) => events.next().await,
            None => None,
        };

        match next {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(message))) => {
                let name = (!message.event.is_empty()).then_some(message.event.as_str());
                let translation = remote.translator.translate(name, &message.data);
                if let Some(permission) = translation.permission {
                    if let Err(e) = remote
                        .client
                        .approve_permission(&remote.session_id, &permission, &remote.directory)
                        .await
                    {
                        warn!("Failed to approve permission {}: {}", permission, e);
                    }
                }
                self.pending.extend(translation.events);
                if translation.idle {
                    self.pending.push_back(remote.translator.finish(true));
                }
            }
            Some(Err(e)) => {
                warn!("Event stream error: {}", e);
                if let Some(mut events) = remote.events.take() {
                    events.close();
                }
                self.pending.push_back(AgentEvent::error(e.to_string()));
                self.pending.push_back(remote.translator.finish(false));
            }
            None => {
                debug!("Event stream closed mid-turn");
                remote.events = None;
                self.pending.push_back(remote.translator.finish(false));
            }
        }
    }
}

#[async_trait]
impl HarnessSession for ServerSession {
    async fn next_event(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                if event.is_result() {
                    self.in_turn = false;
                }
                return Some(Ok(event));
            }
            if !self.in_turn {
                let prompt = self.queued.pop_front()?;
                if let Err(e) = self.start_turn(&prompt).await {
                    return Some(Err(e));
                }
                self.in_turn = true;
            }
            self.pump().await;
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
        if let Some(mut remote) = self.remote.take() {
            if let Err(e) = remote
                .client
                .delete_session(&remote.session_id, &remote.directory)
                .await
            {
                debug!("Failed to delete remote session {}: {}", remote.session_id, e);
            }
            if let Some(mut events) = remote.events.take() {
                events.close();
            }
            if let Some(mut bridge) = remote.bridge.take() {
                bridge.shutdown();
            }
        }
    }
}
