//! Persistent process backends
//!
//! The relay only needs a narrow surface from whatever actually runs the
//! supervised program: existence check, detached create, attach, window resize, kill.
//! `TmuxBackend` is the production implementation.

mod tmux;

pub use tmux::TmuxBackend;

#[cfg(test)]
mod fake;
#[cfg(test)]
pub use fake::{BackendCall, FakeBackend, FakeProcess};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::pty::{PtyEvent, PtyProcess, PtyResult, TerminalSize};

/// Errors from backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend command failed: {0}")]
    CommandFailed(String),

    #[error("PTY error: {0}")]
    Pty(#[from] crate::pty::PtyError),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Readable/writable binding to a running process
#[async_trait]
pub trait ProcessIo: Send + Sync {
    /// Forward raw input bytes
    async fn write(&self, data: &[u8]) -> PtyResult<()>;

    /// Resize the pty-level handle
    async fn resize(&self, size: TerminalSize) -> PtyResult<()>;

    /// Drop the I/O binding; the backend session itself is untouched
    async fn kill(&self);
}

#[async_trait]
impl ProcessIo for PtyProcess {
    async fn write(&self, data: &[u8]) -> PtyResult<()> {
        PtyProcess::write(self, data).await
    }

    async fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        PtyProcess::resize(self, size).await
    }

    async fn kill(&self) {
        PtyProcess::kill(self).await
    }
}

/// An attached process: its control handle plus its ordered event stream
pub struct AttachedProcess {
    pub io: Arc<dyn ProcessIo>,
    pub events: mpsc::Receiver<PtyEvent>,
}

/// Facility that hosts persistent processes (a multiplexer, a container runtime, ...)
#[async_trait]
pub trait ProcessBackend: Send + Sync + 'static {
    /// Whether a backend-level session already exists for `id`
    async fn session_exists(&self, id: &str) -> bool;

    /// Start the program detached; the session may not be attachable yet
    async fn create_detached(
        &self,
        id: &str,
        cwd: &Path,
        size: TerminalSize,
        program: &[String],
    ) -> BackendResult<()>;

    /// Attach an I/O handle to an existing backend session
    async fn attach(&self, id: &str, cwd: &Path, size: TerminalSize)
        -> BackendResult<AttachedProcess>;

    /// Resize the backend-level window
    async fn resize_window(&self, id: &str, size: TerminalSize) -> BackendResult<()>;

    /// Destroy the backend session
    async fn kill(&self, id: &str) -> BackendResult<()>;
}
