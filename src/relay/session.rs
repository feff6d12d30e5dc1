//! Per-session state
//!
//! Everything mutable about one session sits behind a single lock:
//! status, activity, preview, scrollback, observer membership and the
//! process slot. Output ingestion appends to scrollback and fans out to
//! observers inside one critical section, so no observer can see a byte
//! that is not already in the replay window.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::record::{PreviewTracker, SessionRecord};
use super::scrollback::ScrollbackBuffer;
use super::status::{SessionStatus, StatusTracker};
use super::now_millis;
use crate::backend::ProcessIo;
use crate::catalog::CatalogEntry;
use crate::pty::TerminalSize;

/// Identifies one observer within a session
pub type ObserverId = u64;

/// Externally visible phase of the process slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPhase {
    Detached,
    Creating,
    Attaching,
    Live,
}

/// Live binding to the session's process
pub(crate) struct ProcessHandle {
    pub generation: u64,
    pub io: Arc<dyn ProcessIo>,
    pub forwarder: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Stop reading and release the I/O binding
    pub async fn release(mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.io.kill().await;
    }
}

pub(crate) enum ProcessSlot {
    Detached,
    Creating { generation: u64 },
    Attaching { generation: u64 },
    Live(ProcessHandle),
}

impl ProcessSlot {
    pub fn generation(&self) -> Option<u64> {
        match self {
            ProcessSlot::Detached => None,
            ProcessSlot::Creating { generation } | ProcessSlot::Attaching { generation } => {
                Some(*generation)
            }
            ProcessSlot::Live(handle) => Some(handle.generation),
        }
    }

    pub fn phase(&self) -> SpawnPhase {
        match self {
            ProcessSlot::Detached => SpawnPhase::Detached,
            ProcessSlot::Creating { .. } => SpawnPhase::Creating,
            ProcessSlot::Attaching { .. } => SpawnPhase::Attaching,
            ProcessSlot::Live(_) => SpawnPhase::Live,
        }
    }
}

/// Connected observers and their bounded queues
#[derive(Default)]
pub(crate) struct ObserverSet {
    next_id: ObserverId,
    members: HashMap<ObserverId, mpsc::Sender<Vec<u8>>>,
}

impl ObserverSet {
    pub fn insert(&mut self, tx: mpsc::Sender<Vec<u8>>) -> ObserverId {
        self.next_id += 1;
        self.members.insert(self.next_id, tx);
        self.next_id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Non-blocking delivery; observers that cannot keep up are dropped
    pub fn fan_out(&mut self, session_id: &str, data: &[u8]) {
        self.members.retain(|observer, tx| match tx.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Observer {} of session {} fell behind; detaching",
                    observer, session_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Observer {} of session {} is gone", observer, session_id);
                false
            }
        });
    }

    /// Drop every queue, which closes the observers' channels
    pub fn close_all(&mut self) -> usize {
        let count = self.members.len();
        self.members.clear();
        count
    }
}

pub(crate) struct SessionState {
    pub meta: CatalogEntry,
    pub last_activity: u64,
    /// Activity timestamp last written to the catalog
    pub persisted_activity: u64,
    /// Instrumentation only
    pub last_input_at: Option<u64>,
    pub preview: String,
    preview_tracker: PreviewTracker,
    pub status: StatusTracker,
    pub scrollback: ScrollbackBuffer,
    pub observers: ObserverSet,
    pub slot: ProcessSlot,
    /// Geometry for the next spawn or attach
    pub size: TerminalSize,
    pub deleted: bool,
    next_generation: u64,
}

impl SessionState {
    /// Leave `Detached` for a new generation; `None` if someone else holds the slot
    pub fn claim(&mut self, phase: SpawnPhase) -> Option<u64> {
        if self.deleted || !matches!(self.slot, ProcessSlot::Detached) {
            return None;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slot = match phase {
            SpawnPhase::Creating => ProcessSlot::Creating { generation },
            _ => ProcessSlot::Attaching { generation },
        };
        Some(generation)
    }

    pub fn record(&self, id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            name: self.meta.display_name().to_string(),
            group: self.meta.group.clone(),
            working_dir: self.meta.working_dir.clone(),
            created_at: self.meta.created_at,
            last_activity: self.last_activity,
            status: self.status.status(),
            preview: self.preview.clone(),
            pinned: self.meta.pinned,
            archived: self.meta.archived,
            message_count: self.meta.message_count,
            live: matches!(self.slot, ProcessSlot::Live(_)),
            observers: self.observers.len(),
        }
    }

    fn append_and_publish(&mut self, id: &str, data: &[u8]) {
        self.scrollback.append(data);
        self.observers.fan_out(id, data);
    }
}

/// One registered session
pub struct SessionEntry {
    id: String,
    pub(crate) state: Mutex<SessionState>,
}

impl SessionEntry {
    pub(crate) fn new(
        meta: CatalogEntry,
        status: StatusTracker,
        scrollback_bytes: usize,
        preview_max_chars: usize,
        size: TerminalSize,
    ) -> Self {
        let last_activity = meta.modified_at;
        Self {
            id: meta.id.clone(),
            state: Mutex::new(SessionState {
                meta,
                last_activity,
                persisted_activity: last_activity,
                last_input_at: None,
                preview: String::new(),
                preview_tracker: PreviewTracker::new(preview_max_chars),
                status,
                scrollback: ScrollbackBuffer::new(scrollback_bytes),
                observers: ObserverSet::default(),
                slot: ProcessSlot::Detached,
                size,
                deleted: false,
                next_generation: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn record(&self) -> SessionRecord {
        self.state.lock().await.record(&self.id)
    }

    pub async fn phase(&self) -> SpawnPhase {
        self.state.lock().await.slot.phase()
    }

    pub async fn status(&self) -> Option<SessionStatus> {
        self.state.lock().await.status.status()
    }

    /// Current scrollback window
    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.lock().await.scrollback.snapshot()
    }

    pub async fn observer_count(&self) -> usize {
        self.state.lock().await.observers.len()
    }

    /// Output from the process of `generation`
    pub(crate) async fn ingest_output(&self, generation: u64, data: &[u8]) {
        let mut state = self.state.lock().await;
        if state.deleted || state.slot.generation() != Some(generation) {
            debug!(
                "Dropping {} bytes from stale generation {} of session {}",
                data.len(),
                generation,
                self.id
            );
            return;
        }

        state.status.record_output(generation, Instant::now());
        state.last_activity = now_millis();
        if let Some(preview) = state.preview_tracker.feed(data) {
            state.preview = preview;
        }
        state.append_and_publish(&self.id, data);
    }

    /// Bytes that bypass the process (notices) but still belong in history
    pub(crate) async fn publish(&self, data: &[u8]) {
        let mut state = self.state.lock().await;
        if !state.deleted {
            state.append_and_publish(&self.id, data);
        }
    }

    /// Process of `generation` exited: settle status, release the slot and
    /// append the exit notice. Returns the released handle, if it was current.
    pub(crate) async fn finish_generation(
        &self,
        generation: u64,
        exit_code: Option<i32>,
    ) -> Option<ProcessHandle> {
        let mut state = self.state.lock().await;
        let handle = match std::mem::replace(&mut state.slot, ProcessSlot::Detached) {
            ProcessSlot::Live(handle) if handle.generation == generation => handle,
            other => {
                state.slot = other;
                return None;
            }
        };

        let status = state.status.record_exit(generation, exit_code);
        state.last_activity = now_millis();
        state.append_and_publish(&self.id, exit_notice(exit_code).as_bytes());
        info!(
            "Process for session {} exited (code {:?}, status {:?})",
            self.id, exit_code, status
        );
        Some(handle)
    }

    pub(crate) async fn add_observer(&self, tx: mpsc::Sender<Vec<u8>>) -> Option<ObserverId> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return None;
        }
        // Replay goes into the fresh queue before the observer can see live output
        let snapshot = state.scrollback.snapshot();
        if !snapshot.is_empty() && tx.try_send(snapshot).is_err() {
            warn!("Observer queue for session {} rejected the replay", self.id);
            return None;
        }
        Some(state.observers.insert(tx))
    }

    pub(crate) async fn remove_observer(&self, observer: ObserverId) -> bool {
        self.state.lock().await.observers.remove(observer)
    }

    /// Mark deleted, close observers, drop history and hand back the process
    pub(crate) async fn shut_down(&self) -> Option<ProcessHandle> {
        let mut state = self.state.lock().await;
        state.deleted = true;
        let closed = state.observers.close_all();
        state.scrollback.clear();
        debug!("Closed {} observers of session {}", closed, self.id);
        match std::mem::replace(&mut state.slot, ProcessSlot::Detached) {
            ProcessSlot::Live(handle) => Some(handle),
            _ => None,
        }
    }
}

fn exit_notice(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("\r\n[process exited with code {}]\r\n", code),
        None => "\r\n[process exited]\r\n".to_string(),
    }
}
