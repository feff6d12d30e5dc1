//! Tmux-backed persistent processes
//!
//! The tmux server keeps sessions alive across relay restarts; the relay only
//! ever holds an `attach-session` client running inside a PTY.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AttachedProcess, BackendError, BackendResult, ProcessBackend};
use crate::config::BackendSettings;
use crate::pty::{PtyProcess, TerminalSize};

/// Upper bound for any single tmux CLI invocation
pub const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Tmux-based process backend
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    tmux_bin: String,
    session_prefix: String,
}

impl TmuxBackend {
    pub fn new(tmux_bin: impl Into<String>, session_prefix: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            session_prefix: session_prefix.into(),
        }
    }

    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self::new(&settings.tmux_bin, &settings.session_prefix)
    }

    /// Name of the tmux session hosting relay session `id`
    pub fn session_name(&self, id: &str) -> String {
        format!("{}{}", self.session_prefix, id)
    }

    async fn run(&self, args: &[String], description: &str) -> BackendResult<Output> {
        let mut cmd = Command::new(&self.tmux_bin);
        cmd.args(args);
        run_with_timeout(cmd, TMUX_TIMEOUT, description)
            .await
            .map_err(BackendError::Unavailable)
    }
}

#[async_trait]
impl ProcessBackend for TmuxBackend {
    async fn session_exists(&self, id: &str) -> bool {
        let args = vec![
            "has-session".to_string(),
            "-t".to_string(),
            self.session_name(id),
        ];
        match self.run(&args, "tmux has-session").await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("tmux has-session for {} failed: {}", id, e);
                false
            }
        }
    }

    async fn create_detached(
        &self,
        id: &str,
        cwd: &Path,
        size: TerminalSize,
        program: &[String],
    ) -> BackendResult<()> {
        if !cwd.is_dir() {
            return Err(BackendError::Unavailable(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }

        let mut args = vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            self.session_name(id),
            "-c".to_string(),
            cwd.display().to_string(),
            "-x".to_string(),
            size.cols.to_string(),
            "-y".to_string(),
            size.rows.to_string(),
        ];
        if !program.is_empty() {
            args.push("--".to_string());
            args.extend(program.iter().cloned());
        }

        let output = self.run(&args, "tmux new-session").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Unavailable(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn attach(
        &self,
        id: &str,
        cwd: &Path,
        size: TerminalSize,
    ) -> BackendResult<AttachedProcess> {
        let args = vec![
            "attach-session".to_string(),
            "-t".to_string(),
            self.session_name(id),
        ];
        let (process, events) =
            PtyProcess::spawn(&self.tmux_bin, &args, cwd, Some(&attach_env()), size)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(AttachedProcess {
            io: Arc::new(process),
            events,
        })
    }

    async fn resize_window(&self, id: &str, size: TerminalSize) -> BackendResult<()> {
        let args = vec![
            "resize-window".to_string(),
            "-t".to_string(),
            self.session_name(id),
            "-x".to_string(),
            size.cols.to_string(),
            "-y".to_string(),
            size.rows.to_string(),
        ];
        let output = self.run(&args, "tmux resize-window").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::CommandFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> BackendResult<()> {
        // The session may already be gone, which is fine
        let args = vec![
            "kill-session".to_string(),
            "-t".to_string(),
            self.session_name(id),
        ];
        if let Err(e) = self.run(&args, "tmux kill-session").await {
            warn!("tmux kill for {} failed: {}", id, e);
        }
        Ok(())
    }
}

/// Environment for the attach client
///
/// An empty `TMUX` lets the relay attach even when it was itself started
/// inside a tmux session; tmux treats an empty value as not nested.
fn attach_env() -> HashMap<String, String> {
    HashMap::from([
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("TMUX".to_string(), String::new()),
    ])
}

/// Run a subprocess command with a timeout.
///
/// The child is killed on timeout via tokio's `Child` drop.
async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<Output, String> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(io_err)) => Err(format!("{} failed: {}", description, io_err)),
        Err(_elapsed) => Err(format!(
            "{} timed out after {}s",
            description,
            timeout.as_secs()
        )),
    }
}
