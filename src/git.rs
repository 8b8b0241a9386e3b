//! Git collaborator for the memento loop.
//!
//! Version-control history is the loop's only persistent memory, so every
//! operation here shells out to `git` in the code directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Hash of git's empty tree, the diff base for a root commit.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

static FILES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) files? changed").expect("valid files regex"));
static INSERTIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) insertions?\(\+\)").expect("valid insertions regex"));
static DELETIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) deletions?\(-\)").expect("valid deletions regex"));

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Line counts from `git diff --shortstat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u64,
    pub insertions: u64,
    pub deletions: u64,
}

impl DiffStats {
    /// Parse a shortstat line. Missing counters are zero.
    pub fn parse(shortstat: &str) -> Self {
        let count = |re: &Regex| {
            re.captures(shortstat)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0)
        };
        Self {
            files_changed: count(&FILES_RE),
            insertions: count(&INSERTIONS_RE),
            deletions: count(&DELETIONS_RE),
        }
    }

    pub fn add(&mut self, other: DiffStats) {
        self.files_changed += other.files_changed;
        self.insertions += other.insertions;
        self.deletions += other.deletions;
    }

    pub fn is_empty(&self) -> bool {
        self.files_changed == 0 && self.insertions == 0 && self.deletions == 0
    }
}

/// A commit made by the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub subject: String,
    pub stats: DiffStats,
}

/// The git operations the memento loop depends on.
#[async_trait]
pub trait GitRepository: Send + Sync {
    async fn current_branch(&self) -> Result<String, GitError>;

    /// Check out `branch`, creating it from HEAD when it does not exist.
    async fn ensure_branch(&self, branch: &str) -> Result<(), GitError>;

    /// The last `n` commits as `git log --oneline` lines.
    async fn recent_log(&self, n: usize) -> Result<Vec<String>, GitError>;

    /// Stage everything and commit. `None` when the tree was clean.
    async fn commit_all(&self, message: &str) -> Result<Option<CommitInfo>, GitError>;

    async fn push(&self, branch: &str) -> Result<(), GitError>;
}

/// `git` CLI bound to one working tree.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        debug!("git {} (in {})", args.join(" "), self.dir.display());
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn succeeds(&self, args: &[&str]) -> bool {
        self.run(args).await.is_ok()
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        self.succeeds(&["show-ref", "--verify", "--quiet", &reference])
            .await
    }

    pub async fn create_branch(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["checkout", "-b", branch]).await.map(|_| ())
    }

    pub async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["checkout", branch]).await.map(|_| ())
    }

    /// Porcelain status lines; empty when the tree is clean.
    pub async fn status(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["status", "--porcelain"]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn has_changes(&self) -> Result<bool, GitError> {
        Ok(!self.status().await?.is_empty())
    }

    pub async fn diff(&self, staged: bool) -> Result<String, GitError> {
        if staged {
            self.run(&["diff", "--cached"]).await
        } else {
            self.run(&["diff"]).await
        }
    }

    /// Stats of unstaged changes against the index.
    pub async fn working_stats(&self) -> Result<DiffStats, GitError> {
        let out = self.run(&["diff", "--shortstat"]).await?;
        Ok(DiffStats::parse(&out))
    }

    /// Stats of the most recent commit.
    pub async fn last_commit_stats(&self) -> Result<DiffStats, GitError> {
        let out = if self.succeeds(&["rev-parse", "--verify", "--quiet", "HEAD~1"]).await {
            self.run(&["diff", "--shortstat", "HEAD~1", "HEAD"]).await?
        } else {
            self.run(&["diff", "--shortstat", EMPTY_TREE, "HEAD"]).await?
        };
        Ok(DiffStats::parse(&out))
    }

    pub async fn stage_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"]).await.map(|_| ())
    }

    pub async fn head(&self) -> Result<String, GitError> {
        Ok(self.run(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        if self.branch_exists(branch).await {
            self.run(&["worktree", "add", &path, branch]).await?;
        } else {
            self.run(&["worktree", "add", "-b", branch, &path]).await?;
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        self.run(&["worktree", "remove", "--force", &path])
            .await
            .map(|_| ())
    }

    pub async fn remote_url(&self, remote: &str) -> Result<String, GitError> {
        Ok(self
            .run(&["remote", "get-url", remote])
            .await?
            .trim()
            .to_string())
    }

    /// Default branch of `origin`, falling back to `main`.
    pub async fn default_branch(&self) -> String {
        match self
            .run(&["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            Ok(out) => {
                let name = out.trim();
                name.strip_prefix("origin/").unwrap_or(name).to_string()
            }
            Err(_) => "main".to_string(),
        }
    }
}

#[async_trait]
impl GitRepository for Git {
    async fn current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .run(&["branch", "--show-current"])
            .await?
            .trim()
            .to_string())
    }

    async fn ensure_branch(&self, branch: &str) -> Result<(), GitError> {
        if self.current_branch().await? == branch {
            return Ok(());
        }
        if self.branch_exists(branch).await {
            self.checkout(branch).await
        } else {
            self.create_branch(branch).await
        }
    }

    async fn recent_log(&self, n: usize) -> Result<Vec<String>, GitError> {
        let count = n.to_string();
        match self
            .run(&["log", "--oneline", "--no-decorate", "-n", &count])
            .await
        {
            Ok(out) => Ok(out.lines().map(str::to_string).collect()),
            // No commits yet.
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("does not have any commits") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn commit_all(&self, message: &str) -> Result<Option<CommitInfo>, GitError> {
        if !self.has_changes().await? {
            debug!("Working tree clean, nothing to commit");
            return Ok(None);
        }
        self.stage_all().await?;
        self.run(&["commit", "-m", message]).await?;

        let hash = self.head().await?;
        let stats = self.last_commit_stats().await?;
        let subject = message.lines().next().unwrap_or_default().to_string();
        Ok(Some(CommitInfo {
            hash,
            subject,
            stats,
        }))
    }

    async fn push(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["push", "-u", "origin", branch]).await.map(|_| ())
    }
}
