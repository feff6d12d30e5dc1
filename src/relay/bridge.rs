//! Process bridge
//!
//! Translates relay-level operations into backend calls for one session:
//! spawn (detached create, settle, attach), reattach, write, resize and exit
//! handling. The session's process slot is claimed under the per-session
//! lock before any backend call, so concurrent first observers cannot end
//! up with two handles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::session::{ProcessHandle, ProcessSlot, SessionEntry, SpawnPhase};
use super::{now_millis, RelayError, RelayResult};
use crate::backend::{AttachedProcess, ProcessBackend};
use crate::config::{BackendSettings, RelayConfig};
use crate::pty::{PtyEvent, TerminalSize};

/// Timing and program settings for the bridge
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Delay between detached create and attach
    pub spawn_settle: Duration,
    /// Delay before a queued initial input is written
    pub initial_input_delay: Duration,
    pub backend: BackendSettings,
}

impl BridgeSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            spawn_settle: config.spawn_settle(),
            initial_input_delay: config.initial_input_delay(),
            backend: config.backend.clone(),
        }
    }
}

pub struct ProcessBridge {
    backend: Arc<dyn ProcessBackend>,
    settings: BridgeSettings,
}

impl ProcessBridge {
    pub fn new(backend: Arc<dyn ProcessBackend>, settings: BridgeSettings) -> Self {
        Self { backend, settings }
    }

    /// Start a fresh backend session and attach to it.
    ///
    /// Returns `Ok` without doing anything when another spawn or attach
    /// already holds the slot.
    pub async fn spawn_new(&self, entry: &Arc<SessionEntry>, resume: bool) -> RelayResult<()> {
        let id = entry.id().to_string();
        let (generation, cwd, size) = {
            let mut state = entry.state.lock().await;
            if state.deleted {
                return Err(RelayError::NotFound(id));
            }
            let Some(generation) = state.claim(SpawnPhase::Creating) else {
                debug!("Session {} already has a process in flight", id);
                return Ok(());
            };
            (generation, state.meta.working_dir.clone(), state.size)
        };

        let program = self.settings.backend.program_command(resume);
        info!(
            "Creating backend session for {} (generation {}): {}",
            id,
            generation,
            program.join(" ")
        );
        if let Err(e) = self
            .backend
            .create_detached(&id, &cwd, size, &program)
            .await
        {
            warn!("Failed to create backend session for {}: {}", id, e);
            self.abandon(entry, generation).await;
            return Err(RelayError::BackendUnavailable(e.to_string()));
        }

        {
            let mut state = entry.state.lock().await;
            let current = !state.deleted
                && matches!(
                    state.slot,
                    ProcessSlot::Creating { generation: g } if g == generation
                );
            if !current {
                drop(state);
                debug!("Spawn of {} superseded before attach", id);
                self.abandon(entry, generation).await;
                return Ok(());
            }
            state.slot = ProcessSlot::Attaching { generation };
        }

        // The backend may not be attachable right after a detached create
        tokio::time::sleep(self.settings.spawn_settle).await;
        self.attach_generation(entry, generation, cwd, size).await
    }

    /// Attach to an existing backend session.
    ///
    /// `Ok(false)` when the backend has no session for this id.
    pub async fn reattach(&self, entry: &Arc<SessionEntry>) -> RelayResult<bool> {
        let id = entry.id().to_string();
        if !self.backend.session_exists(&id).await {
            debug!("No backend session to reattach for {}", id);
            return Ok(false);
        }

        let (generation, cwd, size) = {
            let mut state = entry.state.lock().await;
            if state.deleted {
                return Err(RelayError::NotFound(id));
            }
            let Some(generation) = state.claim(SpawnPhase::Attaching) else {
                return Ok(true);
            };
            (generation, state.meta.working_dir.clone(), state.size)
        };

        info!("Reattaching session {} (generation {})", id, generation);
        self.attach_generation(entry, generation, cwd, size)
            .await
            .map(|()| true)
    }

    /// Make sure the session has a process: reattach, else spawn with resume
    pub async fn ensure_live(&self, entry: &Arc<SessionEntry>) -> RelayResult<()> {
        {
            let state = entry.state.lock().await;
            if state.deleted {
                return Err(RelayError::NotFound(entry.id().to_string()));
            }
            if !matches!(state.slot, ProcessSlot::Detached) {
                return Ok(());
            }
        }

        if self.reattach(entry).await? {
            return Ok(());
        }
        self.spawn_new(entry, true).await
    }

    /// Forward input; dropped when no process is live
    pub async fn write(&self, entry: &SessionEntry, data: &[u8]) -> bool {
        let io = {
            let state = entry.state.lock().await;
            match &state.slot {
                ProcessSlot::Live(handle) => Arc::clone(&handle.io),
                _ => {
                    debug!(
                        "Dropping {} input bytes for session {} without a process",
                        data.len(),
                        entry.id()
                    );
                    return false;
                }
            }
        };

        match io.write(data).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write to session {}: {}", entry.id(), e);
                false
            }
        }
    }

    /// Propagate geometry to the pty handle and the backend window; each half
    /// may fail on its own.
    pub async fn resize(&self, entry: &SessionEntry, size: TerminalSize) {
        let io = {
            let mut state = entry.state.lock().await;
            state.size = size;
            match &state.slot {
                ProcessSlot::Live(handle) => Some(Arc::clone(&handle.io)),
                _ => None,
            }
        };
        let Some(io) = io else {
            debug!("Stored size {:?} for detached session {}", size, entry.id());
            return;
        };

        if let Err(e) = io.resize(size).await {
            warn!("PTY resize failed for session {}: {}", entry.id(), e);
        }
        if let Err(e) = self.backend.resize_window(entry.id(), size).await {
            warn!("Backend window resize failed for session {}: {}", entry.id(), e);
        }
    }

    /// Release a handle taken from a deleted session and destroy the backend session
    pub(crate) async fn teardown(&self, id: &str, handle: Option<ProcessHandle>) {
        if let Some(handle) = handle {
            handle.release().await;
        }
        if let Err(e) = self.backend.kill(id).await {
            warn!("Failed to kill backend session {}: {}", id, e);
        }
    }

    /// Spawn in a background task, then forward `initial_input` once live
    pub fn spawn_in_background(
        self: &Arc<Self>,
        entry: Arc<SessionEntry>,
        initial_input: Option<String>,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bridge.spawn_new(&entry, false).await {
                warn!("Spawn for session {} failed: {}", entry.id(), e);
                return;
            }
            let Some(input) = initial_input else {
                return;
            };
            tokio::time::sleep(bridge.settings.initial_input_delay).await;
            if bridge.write(&entry, input.as_bytes()).await {
                debug!("Forwarded initial input to session {}", entry.id());
            }
        })
    }

    async fn attach_generation(
        &self,
        entry: &Arc<SessionEntry>,
        generation: u64,
        cwd: PathBuf,
        size: TerminalSize,
    ) -> RelayResult<()> {
        let id = entry.id();
        let attached = match self.backend.attach(id, &cwd, size).await {
            Ok(attached) => attached,
            Err(e) => {
                warn!("Failed to attach to backend session {}: {}", id, e);
                self.abandon(entry, generation).await;
                return Err(RelayError::BackendUnavailable(e.to_string()));
            }
        };
        self.install(entry, generation, attached).await;
        Ok(())
    }

    /// Put an attached process into the slot, unless its generation lost
    async fn install(&self, entry: &Arc<SessionEntry>, generation: u64, attached: AttachedProcess) {
        let AttachedProcess { io, events } = attached;
        let mut state = entry.state.lock().await;

        let current = matches!(
            state.slot,
            ProcessSlot::Attaching { generation: g } if g == generation
        );
        if state.deleted || !current {
            let deleted = state.deleted;
            drop(state);
            debug!(
                "Discarding attach of session {} generation {}",
                entry.id(),
                generation
            );
            io.kill().await;
            if deleted {
                if let Err(e) = self.backend.kill(entry.id()).await {
                    warn!("Failed to kill backend session {}: {}", entry.id(), e);
                }
            }
            return;
        }

        let forwarder = start_forwarder(Arc::clone(entry), generation, events);
        state.slot = ProcessSlot::Live(ProcessHandle {
            generation,
            io,
            forwarder: Some(forwarder),
        });
        state.status.begin_generation(generation, Instant::now());
        state.last_activity = now_millis();
        info!("Session {} is live (generation {})", entry.id(), generation);
    }

    /// Return a failed or superseded generation's slot to `Detached`
    async fn abandon(&self, entry: &SessionEntry, generation: u64) {
        let mut state = entry.state.lock().await;
        let owned = matches!(
            state.slot,
            ProcessSlot::Creating { generation: g } | ProcessSlot::Attaching { generation: g }
                if g == generation
        );
        if owned {
            state.slot = ProcessSlot::Detached;
            state.status.clear();
        }
        let deleted = state.deleted;
        drop(state);

        if deleted {
            if let Err(e) = self.backend.kill(entry.id()).await {
                warn!("Failed to kill backend session {}: {}", entry.id(), e);
            }
        }
    }
}

/// Read task: pumps output into the session, then settles the exit
fn start_forwarder(
    entry: Arc<SessionEntry>,
    generation: u64,
    mut events: mpsc::Receiver<PtyEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut exit_code = None;
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(data) => entry.ingest_output(generation, &data).await,
                PtyEvent::Exit(exit) => {
                    exit_code = exit.exit_code;
                    break;
                }
            }
        }

        if let Some(handle) = entry.finish_generation(generation, exit_code).await {
            // This task is the forwarder; only the I/O needs releasing
            handle.io.kill().await;
        }
    })
}
