//! Fake process backend for testing

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{AttachedProcess, BackendError, BackendResult, ProcessBackend, ProcessIo};
use crate::pty::{ExitReason, ProcessExit, PtyError, PtyEvent, PtyResult, TerminalSize};

/// Recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Exists { id: String },
    CreateDetached { id: String, cwd: PathBuf, program: Vec<String> },
    Attach { id: String },
    ResizeWindow { id: String, size: TerminalSize },
    Kill { id: String },
}

#[derive(Default)]
struct FakeState {
    calls: Vec<BackendCall>,
    existing: HashSet<String>,
    fail_create: bool,
    fail_attach: bool,
    fail_resize_window: bool,
    processes: HashMap<String, Vec<FakeProcess>>,
}

/// Test-side controller for one attached fake process
#[derive(Clone)]
pub struct FakeProcess {
    events: mpsc::Sender<PtyEvent>,
    written: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    killed: Arc<AtomicBool>,
}

impl FakeProcess {
    /// Emit an output chunk as if the process had printed it
    pub async fn emit(&self, data: &[u8]) {
        let _ = self.events.send(PtyEvent::Output(data.to_vec())).await;
    }

    /// Emit the exit event
    pub async fn exit(&self, code: i32) {
        let _ = self
            .events
            .send(PtyEvent::Exit(ProcessExit {
                exit_code: Some(code),
                reason: ExitReason::Normal,
            }))
            .await;
    }

    /// Everything written to the process so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Pty-level resizes received so far
    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeIo {
    written: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<TerminalSize>>>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessIo for FakeIo {
    async fn write(&self, data: &[u8]) -> PtyResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(PtyError::ProcessExited);
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        self.resizes.lock().unwrap().push(size);
        Ok(())
    }

    async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

/// Fake backend recording every call and handing out channel-driven processes
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Pretend a backend session already exists (e.g. survived a relay restart)
    pub fn set_exists(&self, id: &str) {
        self.inner.lock().unwrap().existing.insert(id.to_string());
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner.lock().unwrap().existing.contains(id)
    }

    /// Make `create_detached` fail
    pub fn fail_create(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    /// Make `attach` fail
    pub fn fail_attach(&self, fail: bool) {
        self.inner.lock().unwrap().fail_attach = fail;
    }

    /// Make `resize_window` fail
    pub fn fail_resize_window(&self, fail: bool) {
        self.inner.lock().unwrap().fail_resize_window = fail;
    }

    /// Most recently attached process for `id`
    pub fn process(&self, id: &str) -> Option<FakeProcess> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .get(id)
            .and_then(|p| p.last().cloned())
    }

    /// Number of successful attaches for `id`
    pub fn attach_count(&self, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .processes
            .get(id)
            .map_or(0, Vec::len)
    }

    /// Number of detached creates for `id`
    pub fn create_count(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::CreateDetached { id: cid, .. } if cid == id))
            .count()
    }
}

#[async_trait]
impl ProcessBackend for FakeBackend {
    async fn session_exists(&self, id: &str) -> bool {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BackendCall::Exists { id: id.to_string() });
        state.existing.contains(id)
    }

    async fn create_detached(
        &self,
        id: &str,
        cwd: &Path,
        _size: TerminalSize,
        program: &[String],
    ) -> BackendResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BackendCall::CreateDetached {
            id: id.to_string(),
            cwd: cwd.to_path_buf(),
            program: program.to_vec(),
        });
        if state.fail_create {
            return Err(BackendError::Unavailable("fake create failure".to_string()));
        }
        state.existing.insert(id.to_string());
        Ok(())
    }

    async fn attach(
        &self,
        id: &str,
        _cwd: &Path,
        _size: TerminalSize,
    ) -> BackendResult<AttachedProcess> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BackendCall::Attach { id: id.to_string() });
        if state.fail_attach || !state.existing.contains(id) {
            return Err(BackendError::Unavailable(format!("no session {}", id)));
        }

        let (events_tx, events_rx) = mpsc::channel(1024);
        let process = FakeProcess {
            events: events_tx,
            written: Arc::new(Mutex::new(Vec::new())),
            resizes: Arc::new(Mutex::new(Vec::new())),
            killed: Arc::new(AtomicBool::new(false)),
        };
        let io = FakeIo {
            written: Arc::clone(&process.written),
            resizes: Arc::clone(&process.resizes),
            killed: Arc::clone(&process.killed),
        };
        state
            .processes
            .entry(id.to_string())
            .or_default()
            .push(process);

        Ok(AttachedProcess {
            io: Arc::new(io),
            events: events_rx,
        })
    }

    async fn resize_window(&self, id: &str, size: TerminalSize) -> BackendResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BackendCall::ResizeWindow {
            id: id.to_string(),
            size,
        });
        if state.fail_resize_window {
            return Err(BackendError::CommandFailed("fake resize failure".to_string()));
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> BackendResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(BackendCall::Kill { id: id.to_string() });
        state.existing.remove(id);
        Ok(())
    }
}
