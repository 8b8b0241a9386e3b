//! Plumbing shared by the process-backed harnesses.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// How long a child gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Owned child process with graceful, idempotent teardown.
#[derive(Debug, Default)]
pub struct ProcessHandle {
    child: Option<Child>,
    label: String,
}

impl ProcessHandle {
    pub fn new(child: Child, label: impl Into<String>) -> Self {
        Self {
            child: Some(child),
            label: label.into(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Wait for the child to exit on its own. Returns whether it succeeded.
    pub async fn wait(&mut self) -> Option<bool> {
        let mut child = self.child.take()?;
        match child.wait().await {
            Ok(status) => {
                debug!("{} exited with {}", self.label, status);
                Some(status.success())
            }
            Err(e) => {
                warn!("Failed to wait for {}: {}", self.label, e);
                Some(false)
            }
        }
    }

    /// SIGTERM, wait up to [`TERMINATE_GRACE`], then kill.
    pub async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        terminate_child(&mut child, &self.label).await;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill {} on drop: {}", self.label, e);
            }
        }
    }
}

pub async fn terminate_child(child: &mut Child, label: &str) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("{} already exited with {}", label, status);
        return;
    }

    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we own and have not reaped.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("{} terminated with {}", label, status),
        Ok(Err(e)) => warn!("Failed to wait for {}: {}", label, e),
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", label, e);
            } else {
                info!("{} killed after ignoring SIGTERM", label);
            }
        }
    }
}

/// Forward a child pipe to the debug log line by line so it never fills up.
pub fn drain_lines<R>(reader: R, label: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                debug!("{}: {}", label, line);
            }
        }
    });
}

/// Pick a free localhost port.
pub fn allocate_port() -> Option<u16> {
    std::net::TcpListener::bind("127.0.0.1:0")
        .ok()
        .and_then(|listener| listener.local_addr().ok().map(|addr| addr.port()))
}

/// Shorten `s` to at most `max` characters for log output.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

/// First string value found under any of `keys`.
pub fn str_field<'a>(value: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.get(*key).and_then(|v| v.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let mut handle = ProcessHandle::new(child, "sleep");
        assert!(handle.is_running());
        handle.terminate().await;
        assert!(!handle.is_running());
        handle.terminate().await;
    }

    #[tokio::test]
    async fn wait_reports_exit_status() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let mut handle = ProcessHandle::new(child, "sh");
        assert_eq!(handle.wait().await, Some(false));
        assert_eq!(handle.wait().await, None);
    }

    #[test]
    fn allocates_a_port() {
        assert!(allocate_port().is_some());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn str_field_takes_first_present_key() {
        let value = json!({"sessionID": "s1", "id": "x"});
        assert_eq!(str_field(&value, &["session_id", "sessionID"]), Some("s1"));
        assert_eq!(str_field(&value, &["missing"]), None);
    }
}
