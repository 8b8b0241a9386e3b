//! Configuration for the `autonav` binary.
//!
//! Configuration is read from environment variables:
//! - `AUTONAV_TASK` - Required. What the memento loop should build.
//! - `AUTONAV_CODE_DIR` - Optional. Repository to work in. Defaults to the current directory.
//! - `AUTONAV_HARNESS` - Optional. `sdk`, `cli` or `server`. Defaults to `sdk`.
//! - `AUTONAV_MAX_ITERATIONS` - Optional. Iteration cap, 0 for unlimited. Defaults to `0`.
//! - `AUTONAV_BRANCH` - Optional. Branch to create or check out before starting.
//! - `AUTONAV_PLANNER_MODEL` - Optional. Model for the planner role.
//! - `AUTONAV_IMPLEMENTER_MODEL` - Optional. Model for the implementer role.
//! - `AUTONAV_MAX_RETRIES` - Optional. Retries per phase for rate limits and network errors. Defaults to `5`.
//! - `AUTONAV_PUSH` - Optional. Push after every commit. Defaults to `false`.
//! - `AUTONAV_LOG_LINES` - Optional. Git log lines shown to the planner. Defaults to `20`.
//! - `AUTONAV_PHASE_TIMEOUT_SECS` - Optional. Abandon a phase after this many seconds.
//! - `AUTONAV_PEERS` - Optional. Comma-separated navigator names both phases may ask.
//!
//! Each harness reads its own connection settings (`ANTHROPIC_API_KEY`,
//! `AUTONAV_CLI_PATH`, `AUTONAV_SERVER_URL`, ...).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::memento::MementoOptions;
use crate::util::{env_var_bool, env_var_opt};

pub const HARNESS_IDS: &[&str] = &["sdk", "cli", "server"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub task: String,

    /// Repository the loop works in
    pub code_dir: PathBuf,

    /// Harness id, one of [`HARNESS_IDS`]
    pub harness: String,

    pub max_iterations: u32,
    pub branch: Option<String>,
    pub planner_model: Option<String>,
    pub implementer_model: Option<String>,
    pub max_retries: u32,
    pub push: bool,
    pub log_lines: usize,
    pub phase_timeout: Option<Duration>,

    /// Navigators reachable through the ask tools
    pub peers: Vec<String>,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var_opt(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn parse_list(raw: Option<String>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `AUTONAV_TASK` is not set and
    /// `ConfigError::InvalidValue` for unparseable numbers or an unknown harness.
    pub fn from_env() -> Result<Self, ConfigError> {
        let task = env_var_opt("AUTONAV_TASK")
            .ok_or_else(|| ConfigError::MissingEnvVar("AUTONAV_TASK".to_string()))?;

        let code_dir = env_var_opt("AUTONAV_CODE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let harness = env_var_opt("AUTONAV_HARNESS")
            .map(|h| h.to_lowercase())
            .unwrap_or_else(|| "sdk".to_string());
        if !HARNESS_IDS.contains(&harness.as_str()) {
            return Err(ConfigError::InvalidValue(
                "AUTONAV_HARNESS".to_string(),
                format!("{} (expected one of {})", harness, HARNESS_IDS.join(", ")),
            ));
        }

        let phase_timeout = Some(parse_var("AUTONAV_PHASE_TIMEOUT_SECS", 0u64)?)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            task,
            code_dir,
            harness,
            max_iterations: parse_var("AUTONAV_MAX_ITERATIONS", 0)?,
            branch: env_var_opt("AUTONAV_BRANCH"),
            planner_model: env_var_opt("AUTONAV_PLANNER_MODEL"),
            implementer_model: env_var_opt("AUTONAV_IMPLEMENTER_MODEL"),
            max_retries: parse_var("AUTONAV_MAX_RETRIES", 5)?,
            push: env_var_bool("AUTONAV_PUSH", false),
            log_lines: parse_var("AUTONAV_LOG_LINES", 20)?,
            phase_timeout,
            peers: parse_list(env_var_opt("AUTONAV_PEERS")),
        })
    }

    pub fn memento_options(&self) -> MementoOptions {
        let mut options = MementoOptions::new(&self.task, &self.code_dir);
        options.branch = self.branch.clone();
        options.max_iterations = self.max_iterations;
        options.max_retries = self.max_retries;
        options.log_lines = self.log_lines;
        options.push = self.push;
        options.phase_timeout = self.phase_timeout;
        options.planner_model = self.planner_model.clone();
        options.implementer_model = self.implementer_model.clone();
        options.peers = self.peers.clone();
        options
    }
}
