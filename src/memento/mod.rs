//! Memento loop: plan, implement, commit, repeat.
//!
//! Each iteration runs a planner session that must submit a plan through the
//! plan-capture tool, then an implementer session that carries it out, then a
//! commit. Nothing is carried between iterations except what git records: the
//! next planner only sees the recent `git log`.
//!
//! Rate limits and transient connection failures are retried per phase with
//! the delays from [`crate::retry`]. Everything else ends the loop.

mod error;
pub mod prompts;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ask::{ask_tools, AskContext, EnvThenRegistryLookup, NavigatorLookup};
use crate::git::{CommitInfo, DiffStats, GitRepository};
use crate::harness::events::AgentEvent;
use crate::harness::{
    collect_turn, AgentConfig, Harness, PermissionMode, ToolServer, TurnSummary,
};
use crate::plan::{plan_tool_server, ImplementationPlan, PlanCapture, PLAN_TOOL_NAME};
use crate::retry::{
    connection_backoff_delay, format_duration, retry_delay, wait_with_countdown, RateLimitInfo,
    RetryDecision, RetryKind,
};

pub use error::{MementoError, Phase};
use prompts::{
    commit_message, implementer_prompt, planner_prompt, PlannerContext, IMPLEMENTER_SYSTEM_PROMPT,
    PLANNER_SYSTEM_PROMPT,
};

/// Read-only built-ins the planner may use besides the plan tool.
const PLANNER_ALLOWED_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS"];
const PLANNER_DISALLOWED_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

#[derive(Debug, Clone)]
pub struct MementoOptions {
    pub task: String,
    pub code_dir: PathBuf,
    /// Branch to check out (created if missing) before the first iteration.
    pub branch: Option<String>,
    /// 0 means unlimited.
    pub max_iterations: u32,
    /// Retries per phase per iteration.
    pub max_retries: u32,
    /// How many `git log` lines the planner sees.
    pub log_lines: usize,
    pub push: bool,
    pub phase_timeout: Option<Duration>,
    pub planner_model: Option<String>,
    pub implementer_model: Option<String>,
    pub planner_max_turns: Option<u32>,
    pub implementer_max_turns: Option<u32>,
    /// Navigators both phases can query with `ask_<peer>` tools.
    pub peers: Vec<String>,
}

impl MementoOptions {
    pub fn new(task: impl Into<String>, code_dir: impl Into<PathBuf>) -> Self {
        Self {
            task: task.into(),
            code_dir: code_dir.into(),
            branch: None,
            max_iterations: 0,
            max_retries: 5,
            log_lines: 20,
            push: false,
            phase_timeout: None,
            planner_model: None,
            implementer_model: None,
            planner_max_turns: None,
            implementer_max_turns: None,
            peers: Vec::new(),
        }
    }
}

/// Outcome of a loop run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MementoResult {
    pub iterations: u32,
    pub success: bool,
    pub stats: DiffStats,
    pub commits: Vec<CommitInfo>,
    pub completion_message: Option<String>,
}

/// Progress callbacks. Every method defaults to doing nothing.
pub trait MementoObserver: Send + Sync {
    fn on_iteration_start(&self, _iteration: u32, _max_iterations: u32) {}
    fn on_phase_start(&self, _iteration: u32, _phase: Phase) {}
    fn on_event(&self, _iteration: u32, _phase: Phase, _event: &AgentEvent) {}
    fn on_plan(&self, _iteration: u32, _plan: &ImplementationPlan) {}
    fn on_retry(&self, _phase: Phase, _attempt: u32, _decision: &RetryDecision) {}
    fn on_wait_tick(&self, _phase: Phase, _remaining: Duration) {}
    fn on_commit(&self, _iteration: u32, _commit: &CommitInfo) {}
}

pub struct NoopObserver;

impl MementoObserver for NoopObserver {}

/// Reports progress through `tracing`.
pub struct LoggingObserver;

impl MementoObserver for LoggingObserver {
    fn on_iteration_start(&self, iteration: u32, max_iterations: u32) {
        if max_iterations == 0 {
            info!("Iteration {}", iteration);
        } else {
            info!("Iteration {}/{}", iteration, max_iterations);
        }
    }

    fn on_event(&self, _iteration: u32, phase: Phase, event: &AgentEvent) {
        match event {
            AgentEvent::Text { body } => debug!("[{}] {}", phase, body),
            AgentEvent::ToolUse { name, .. } => debug!("[{}] tool {}", phase, name),
            AgentEvent::Error { message, .. } => warn!("[{}] error: {}", phase, message),
            _ => {}
        }
    }

    fn on_plan(&self, iteration: u32, plan: &ImplementationPlan) {
        info!(
            iteration,
            steps = plan.steps.len(),
            complete = plan.is_complete,
            "Plan: {}",
            plan.summary
        );
    }

    fn on_retry(&self, phase: Phase, attempt: u32, decision: &RetryDecision) {
        warn!(
            "{} hit a {:?} error, retry {} in {}",
            phase,
            decision.kind,
            attempt + 1,
            format_duration(decision.delay)
        );
    }

    fn on_wait_tick(&self, phase: Phase, remaining: Duration) {
        let secs = remaining.as_secs();
        if secs % 60 == 0 || secs <= 5 {
            info!("{} resumes in {}", phase, format_duration(remaining));
        }
    }

    fn on_commit(&self, _iteration: u32, commit: &CommitInfo) {
        info!(
            "Committed {} ({} files, +{} -{})",
            commit.hash.chars().take(8).collect::<String>(),
            commit.stats.files_changed,
            commit.stats.insertions,
            commit.stats.deletions
        );
    }
}

enum Attempt {
    Finished(TurnSummary),
    Failed {
        errors: Vec<String>,
        message: String,
        retryable: bool,
    },
}

pub struct MementoLoop {
    harness: Arc<dyn Harness>,
    git: Arc<dyn GitRepository>,
    options: MementoOptions,
    observer: Arc<dyn MementoObserver>,
    lookup: Arc<dyn NavigatorLookup>,
}

impl MementoLoop {
    pub fn new(harness: Arc<dyn Harness>, git: Arc<dyn GitRepository>, options: MementoOptions) -> Self {
        Self {
            harness,
            git,
            options,
            observer: Arc::new(NoopObserver),
            lookup: Arc::new(EnvThenRegistryLookup::new()),
        }
    }

    /// Replace how peer names resolve to navigator directories.
    pub fn with_lookup(mut self, lookup: Arc<dyn NavigatorLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    fn peer_tools(&self) -> Option<ToolServer> {
        if self.options.peers.is_empty() {
            return None;
        }
        let ctx = AskContext::new(Arc::clone(&self.harness), Arc::clone(&self.lookup));
        Some(ask_tools(&self.options.peers, &ctx))
    }

    pub fn with_observer(mut self, observer: Arc<dyn MementoObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn run(&self) -> Result<MementoResult, MementoError> {
        if let Some(branch) = &self.options.branch {
            self.git.ensure_branch(branch).await?;
        }
        let branch = self.git.current_branch().await?;
        info!(
            "Starting memento loop on {} in {} with {}",
            branch,
            self.options.code_dir.display(),
            self.harness.name()
        );

        let max = self.options.max_iterations;
        let mut result = MementoResult::default();
        loop {
            if max > 0 && result.iterations >= max {
                info!("Reached the iteration cap of {}", max);
                result.success = false;
                break;
            }
            result.iterations += 1;
            let iteration = result.iterations;
            self.observer.on_iteration_start(iteration, max);

            let git_log = self.git.recent_log(self.options.log_lines).await?;
            let plan = self.plan(iteration, &branch, &git_log).await?;
            self.observer.on_plan(iteration, &plan);

            if plan.is_complete {
                info!("Task complete after {} iterations", iteration);
                result.success = true;
                result.completion_message = plan.completion_message.clone();
                break;
            }

            self.implement(iteration, &plan).await?;

            let message = commit_message(iteration, &plan.summary);
            match self.git.commit_all(&message).await? {
                Some(commit) => {
                    result.stats.add(commit.stats);
                    self.observer.on_commit(iteration, &commit);
                    if self.options.push {
                        self.git.push(&branch).await?;
                    }
                    result.commits.push(commit);
                }
                None => info!("Iteration {} left no changes to commit", iteration),
            }
        }
        Ok(result)
    }

    /// Planner session config: read-only built-ins plus the plan tool bound to `capture`.
    pub fn planner_config(&self, capture: &PlanCapture) -> AgentConfig {
        let server = plan_tool_server(capture.clone());
        let mut config = AgentConfig::new(&self.options.code_dir);
        config.allowed_tools = PLANNER_ALLOWED_TOOLS
            .iter()
            .map(|t| t.to_string())
            .chain(std::iter::once(server.qualified_name(PLAN_TOOL_NAME)))
            .collect();
        config = config.with_tool_server(server);
        if let Some(peers) = self.peer_tools() {
            config.allowed_tools.extend(
                peers
                    .tools
                    .iter()
                    .map(|t| peers.qualified_name(&t.definition.name)),
            );
            config = config.with_tool_server(peers);
        }
        config.model = self.options.planner_model.clone();
        config.system_prompt = Some(PLANNER_SYSTEM_PROMPT.to_string());
        config.max_turns = self.options.planner_max_turns;
        config.disallowed_tools = PLANNER_DISALLOWED_TOOLS
            .iter()
            .map(|t| t.to_string())
            .collect();
        config
    }

    pub fn implementer_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(&self.options.code_dir);
        config.model = self.options.implementer_model.clone();
        config.system_prompt = Some(IMPLEMENTER_SYSTEM_PROMPT.to_string());
        config.max_turns = self.options.implementer_max_turns;
        config.permission_mode = PermissionMode::BypassPermissions;
        if let Some(peers) = self.peer_tools() {
            config = config.with_tool_server(peers);
        }
        config
    }

    async fn plan(
        &self,
        iteration: u32,
        branch: &str,
        git_log: &[String],
    ) -> Result<ImplementationPlan, MementoError> {
        let capture = PlanCapture::new();
        let config = self.planner_config(&capture);

        let prompt = planner_prompt(&PlannerContext {
            task: &self.options.task,
            iteration,
            max_iterations: self.options.max_iterations,
            code_dir: &self.options.code_dir,
            branch,
            git_log,
        });

        let outcome = self
            .run_phase(iteration, Phase::Plan, &config, &prompt, Some(&capture))
            .await;
        if let Some(plan) = capture.take() {
            return Ok(plan);
        }

        let validation = capture.last_error().map(|e| e.to_string());
        let reason = match outcome {
            Ok(_) => validation
                .unwrap_or_else(|| format!("planner finished without calling {}", PLAN_TOOL_NAME)),
            Err(MementoError::PhaseFailed { message, .. }) => validation.unwrap_or(message),
            Err(e) => return Err(e),
        };
        Err(MementoError::NoPlan { iteration, reason })
    }

    async fn implement(&self, iteration: u32, plan: &ImplementationPlan) -> Result<(), MementoError> {
        let config = self.implementer_config();
        let prompt = implementer_prompt(plan, &self.options.code_dir);
        let summary = self
            .run_phase(iteration, Phase::Implement, &config, &prompt, None)
            .await?;
        debug!(
            "Implementer finished iteration {} (cost {:?})",
            iteration, summary.cost_usd
        );
        Ok(())
    }

    /// Run one phase, retrying rate limits and transient failures.
    async fn run_phase(
        &self,
        iteration: u32,
        phase: Phase,
        config: &AgentConfig,
        prompt: &str,
        capture: Option<&PlanCapture>,
    ) -> Result<TurnSummary, MementoError> {
        let mut attempt = 0;
        loop {
            self.observer.on_phase_start(iteration, phase);
            let (errors, message, retryable) =
                match self.attempt(iteration, phase, config.clone(), prompt).await? {
                    Attempt::Finished(summary) => return Ok(summary),
                    Attempt::Failed {
                        errors,
                        message,
                        retryable,
                    } => (errors, message, retryable),
                };

            if capture.is_some_and(|c| c.is_captured()) {
                debug!("{} failed after the plan was captured: {}", phase, message);
                return Ok(TurnSummary::default());
            }

            let Some(decision) = classify_failure(&errors, &message, retryable, attempt) else {
                return Err(MementoError::PhaseFailed {
                    iteration,
                    phase,
                    message,
                });
            };
            if attempt >= self.options.max_retries {
                return Err(MementoError::RetriesExhausted {
                    iteration,
                    phase,
                    attempts: attempt,
                    message,
                });
            }

            self.observer.on_retry(phase, attempt, &decision);
            let observer = Arc::clone(&self.observer);
            wait_with_countdown(decision.delay, |remaining| {
                observer.on_wait_tick(phase, remaining)
            })
            .await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        iteration: u32,
        phase: Phase,
        config: AgentConfig,
        prompt: &str,
    ) -> Result<Attempt, MementoError> {
        let mut session = self.harness.run(config, prompt);
        let observer = Arc::clone(&self.observer);
        let mut saw_retryable = false;

        let consume = collect_turn(session.as_mut(), |event| {
            if let AgentEvent::Error {
                retryable: true, ..
            } = event
            {
                saw_retryable = true;
            }
            observer.on_event(iteration, phase, event);
        });
        let consumed = match self.options.phase_timeout {
            Some(limit) => tokio::time::timeout(limit, consume).await.ok(),
            None => Some(consume.await),
        };
        session.close().await;

        let outcome = consumed.ok_or(MementoError::Timeout {
            iteration,
            phase,
            after: self.options.phase_timeout.unwrap_or_default(),
        })?;
        let summary = outcome.map_err(|e| MementoError::Harness {
            iteration,
            phase,
            message: format!("{:#}", e),
        })?;

        if summary.success {
            Ok(Attempt::Finished(summary))
        } else {
            Ok(Attempt::Failed {
                message: summary.failure_message(),
                errors: summary.errors,
                retryable: saw_retryable,
            })
        }
    }
}

/// Pick a retry delay from the most recent classifiable error. A backend
/// that flagged its error retryable without recognisable text gets the
/// connection table.
fn classify_failure(
    errors: &[String],
    message: &str,
    retryable: bool,
    attempt: u32,
) -> Option<RetryDecision> {
    errors
        .iter()
        .rev()
        .map(String::as_str)
        .chain(std::iter::once(message))
        .find_map(|m| retry_delay(m, attempt))
        .or_else(|| {
            retryable.then(|| RetryDecision {
                kind: RetryKind::Connection,
                delay: connection_backoff_delay(attempt),
                rate_limit: RateLimitInfo::default(),
            })
        })
}
