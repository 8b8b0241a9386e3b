//! Built-in file and shell tools for the in-process harness.
//!
//! Paths are resolved against the session's working directory and must stay
//! inside it. Tools are offered under the names the CLI runtimes use
//! (`Read`, `Write`, `Edit`, `Bash`, `Glob`, `Grep`, `LS`) so allow and deny
//! lists mean the same thing on every harness.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use regex::RegexBuilder;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::client::ToolSpec;
use crate::harness::shared::truncate;
use crate::harness::{json_schema_for, AgentConfig, PermissionMode, ToolOutput};

const MAX_OUTPUT_CHARS: usize = 30_000;
const MAX_MATCHES: usize = 200;
const DEFAULT_BASH_TIMEOUT_SECS: u64 = 120;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;

    /// Read-only tools stay available in plan mode.
    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String>;
}

fn all_tools() -> Vec<Box<dyn BuiltinTool>> {
    vec![
        Box::new(ReadTool),
        Box::new(WriteTool),
        Box::new(EditTool),
        Box::new(BashTool),
        Box::new(GlobTool),
        Box::new(GrepTool),
        Box::new(LsTool),
    ]
}

/// The built-ins one session may use, bound to its working directory.
pub struct BuiltinTools {
    root: PathBuf,
    tools: Vec<Box<dyn BuiltinTool>>,
}

impl BuiltinTools {
    pub fn for_config(config: &AgentConfig) -> Self {
        let plan_mode = config.permission_mode == PermissionMode::Plan;
        let tools = all_tools()
            .into_iter()
            .filter(|tool| config.builtin_permitted(tool.name()))
            .filter(|tool| !plan_mode || tool.read_only())
            .collect();
        Self {
            root: workspace_root(&config.working_directory),
            tools,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// Run the named built-in, `None` if this session does not offer it.
    pub async fn call(&self, name: &str, input: Value) -> Option<ToolOutput> {
        let tool = self.tools.iter().find(|t| t.name() == name)?;
        debug!("Running built-in {} in {}", name, self.root.display());
        let output = match tool.execute(input, &self.root).await {
            Ok(content) => ToolOutput::success(clip(content)),
            Err(e) => {
                debug!("Built-in {} failed: {:#}", name, e);
                ToolOutput::error(format!("{:#}", e))
            }
        };
        Some(output)
    }
}

fn parse_args<T: DeserializeOwned>(input: Value, tool: &str) -> Result<T> {
    serde_json::from_value(input).with_context(|| format!("Invalid arguments for {}", tool))
}

fn clip(content: String) -> String {
    if content.chars().count() <= MAX_OUTPUT_CHARS {
        return content;
    }
    format!("{}\n[output truncated]", truncate(&content, MAX_OUTPUT_CHARS))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn workspace_root(dir: &Path) -> PathBuf {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(dir))
            .unwrap_or_else(|_| dir.to_path_buf())
    };
    normalize(&absolute)
}

/// Resolve `path` inside `root`, rejecting anything that escapes it.
pub fn resolve_in(root: &Path, path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = normalize(&joined);
    if !resolved.starts_with(root) {
        bail!("Path is outside the working directory: {}", path);
    }
    Ok(resolved)
}

fn relative_display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn walk(base: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
}

// ── Read ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct ReadArgs {
    /// File to read, relative to the working directory.
    file_path: String,
    /// 1-based line to start from.
    offset: Option<usize>,
    /// Maximum number of lines to return.
    limit: Option<usize>,
}

struct ReadTool;

#[async_trait]
impl BuiltinTool for ReadTool {
    fn name(&self) -> &'static str {
        "Read"
    }

    fn description(&self) -> &'static str {
        "Read a file with line numbers. Use offset and limit for large files."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<ReadArgs>()
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: ReadArgs = parse_args(input, self.name())?;
        let path = resolve_in(root, &args.file_path)?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Cannot read {}", args.file_path))?;
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                return Ok(format!(
                    "Binary file: {} ({} bytes)",
                    args.file_path,
                    e.as_bytes().len()
                ))
            }
        };
        if content.is_empty() {
            return Ok("File is empty".to_string());
        }

        let start = args.offset.unwrap_or(1).max(1) - 1;
        let numbered: Vec<String> = content
            .lines()
            .enumerate()
            .skip(start)
            .take(args.limit.unwrap_or(usize::MAX))
            .map(|(i, line)| format!("{:6}\t{}", i + 1, line))
            .collect();
        if numbered.is_empty() {
            return Ok(format!(
                "File has {} lines, offset {} is past the end",
                content.lines().count(),
                start + 1
            ));
        }
        Ok(numbered.join("\n"))
    }
}

// ── Write ─────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct WriteArgs {
    /// File to create or overwrite, relative to the working directory.
    file_path: String,
    content: String,
}

struct WriteTool;

#[async_trait]
impl BuiltinTool for WriteTool {
    fn name(&self) -> &'static str {
        "Write"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a file. Parent directories are created as needed."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<WriteArgs>()
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: WriteArgs = parse_args(input, self.name())?;
        let path = resolve_in(root, &args.file_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &args.content)
            .await
            .with_context(|| format!("Cannot write {}", args.file_path))?;
        Ok(format!(
            "Wrote {} bytes to {}",
            args.content.len(),
            args.file_path
        ))
    }
}

// ── Edit ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct EditArgs {
    /// File to edit, relative to the working directory.
    file_path: String,
    /// Exact text to replace. Must be unique unless `replace_all` is set.
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

struct EditTool;

#[async_trait]
impl BuiltinTool for EditTool {
    fn name(&self) -> &'static str {
        "Edit"
    }

    fn description(&self) -> &'static str {
        "Replace an exact string in a file."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<EditArgs>()
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: EditArgs = parse_args(input, self.name())?;
        if args.old_string.is_empty() {
            bail!("old_string must not be empty");
        }
        let path = resolve_in(root, &args.file_path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Cannot read {}", args.file_path))?;

        let count = content.matches(&args.old_string).count();
        if count == 0 {
            bail!("old_string not found in {}", args.file_path);
        }
        if count > 1 && !args.replace_all {
            bail!(
                "old_string occurs {} times in {}; add context or set replace_all",
                count,
                args.file_path
            );
        }

        let (updated, replaced) = if args.replace_all {
            (content.replace(&args.old_string, &args.new_string), count)
        } else {
            (content.replacen(&args.old_string, &args.new_string, 1), 1)
        };
        tokio::fs::write(&path, updated)
            .await
            .with_context(|| format!("Cannot write {}", args.file_path))?;
        Ok(format!(
            "Replaced {} occurrence(s) in {}",
            replaced, args.file_path
        ))
    }
}

// ── Bash ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct BashArgs {
    /// Shell command, run with `/bin/sh -c` in the working directory.
    command: String,
    /// Defaults to 120 seconds.
    timeout_secs: Option<u64>,
}

struct BashTool;

#[async_trait]
impl BuiltinTool for BashTool {
    fn name(&self) -> &'static str {
        "Bash"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the working directory. Use for builds, tests and git."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<BashArgs>()
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: BashArgs = parse_args(input, self.name())?;
        let timeout_secs = args.timeout_secs.unwrap_or(DEFAULT_BASH_TIMEOUT_SECS);
        info!("Executing command in {}: {}", root.display(), args.command);

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&args.command)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output =
            match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
                Ok(output) => output.context("Failed to execute command")?,
                Err(_) => {
                    warn!("Command timed out after {} seconds", timeout_secs);
                    bail!("Command timed out after {} seconds", timeout_secs);
                }
            };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut result = format!("Exit code: {}\n", output.status.code().unwrap_or(-1));
        if !stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&stderr);
        }
        Ok(result)
    }
}

// ── Glob ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct GlobArgs {
    /// Glob such as `**/*.rs` or `src/*.toml`.
    pattern: String,
    /// Directory to search from. Defaults to the working directory.
    path: Option<String>,
}

struct GlobTool;

#[async_trait]
impl BuiltinTool for GlobTool {
    fn name(&self) -> &'static str {
        "Glob"
    }

    fn description(&self) -> &'static str {
        "Find files by glob pattern. Paths are returned relative to the working directory."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<GlobArgs>()
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: GlobArgs = parse_args(input, self.name())?;
        let base = resolve_in(root, args.path.as_deref().unwrap_or("."))?;
        let pattern = Pattern::new(&args.pattern)
            .with_context(|| format!("Invalid glob pattern: {}", args.pattern))?;

        let mut matches = Vec::new();
        for entry in walk(&base) {
            let relative = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            if pattern.matches_path_with(relative, GLOB_OPTIONS) {
                matches.push(relative_display(entry.path(), root));
                if matches.len() >= MAX_MATCHES {
                    matches.push(format!("... (showing first {} files)", MAX_MATCHES));
                    break;
                }
            }
        }

        if matches.is_empty() {
            Ok(format!("No files matching '{}'", args.pattern))
        } else {
            Ok(matches.join("\n"))
        }
    }
}

// ── Grep ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct GrepArgs {
    /// Regular expression to search for.
    pattern: String,
    /// File or directory to search. Defaults to the working directory.
    path: Option<String>,
    /// Only search files whose name matches this glob, e.g. `*.rs`.
    glob: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
}

struct GrepTool;

#[async_trait]
impl BuiltinTool for GrepTool {
    fn name(&self) -> &'static str {
        "Grep"
    }

    fn description(&self) -> &'static str {
        "Search file contents with a regular expression. Returns path:line:text matches."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<GrepArgs>()
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: GrepArgs = parse_args(input, self.name())?;
        let base = resolve_in(root, args.path.as_deref().unwrap_or("."))?;
        let regex = RegexBuilder::new(&args.pattern)
            .case_insensitive(args.case_insensitive)
            .build()
            .with_context(|| format!("Invalid pattern: {}", args.pattern))?;
        let file_filter = args
            .glob
            .as_deref()
            .map(Pattern::new)
            .transpose()
            .context("Invalid glob filter")?;

        let mut matches = Vec::new();
        'files: for entry in walk(&base) {
            let name = entry.file_name().to_string_lossy();
            if let Some(filter) = &file_filter {
                if !filter.matches_with(&name, GLOB_OPTIONS) {
                    continue;
                }
            }
            // Unreadable and non-UTF-8 files are skipped.
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let display = relative_display(entry.path(), root);
            for (number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}:{}", display, number + 1, truncate(line, 500)));
                    if matches.len() >= MAX_MATCHES {
                        matches.push(format!("... (showing first {} matches)", MAX_MATCHES));
                        break 'files;
                    }
                }
            }
        }

        if matches.is_empty() {
            Ok(format!("No matches found for pattern: {}", args.pattern))
        } else {
            Ok(matches.join("\n"))
        }
    }
}

// ── LS ────────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct LsArgs {
    /// Directory to list. Defaults to the working directory.
    path: Option<String>,
}

struct LsTool;

#[async_trait]
impl BuiltinTool for LsTool {
    fn name(&self) -> &'static str {
        "LS"
    }

    fn description(&self) -> &'static str {
        "List a directory. Subdirectories end with '/'."
    }

    fn input_schema(&self) -> Value {
        json_schema_for::<LsArgs>()
    }

    async fn execute(&self, input: Value, root: &Path) -> Result<String> {
        let args: LsArgs = parse_args(input, self.name())?;
        let requested = args.path.as_deref().unwrap_or(".");
        let dir = resolve_in(root, requested)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Cannot list {}", requested))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        if entries.is_empty() {
            Ok("Directory is empty".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}
