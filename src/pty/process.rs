//! PTY process management
//!
//! Spawns a child inside a pseudo-terminal and exposes it as:
//! - a writer for input bytes
//! - a resizable master handle
//! - an event channel carrying output chunks followed by exactly one exit event

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Capacity of the per-process event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Read chunk size for the reader thread
const READ_CHUNK_SIZE: usize = 4096;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("Process already exited")]
    ProcessExited,

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Reason for process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited on its own and reported a status
    Normal,
    /// Process was killed by request
    Killed,
    /// The PTY closed but no status could be collected
    Unknown,
}

/// Event emitted when a process exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code if available
    pub exit_code: Option<i32>,
    /// Exit reason
    pub reason: ExitReason,
}

/// Events produced by a running PTY process, in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output bytes
    Output(Vec<u8>),
    /// The process exited; always the last event
    Exit(ProcessExit),
}

/// Handle to a running PTY process
pub struct PtyProcess {
    /// The master PTY handle
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Writer for sending input
    writer: Mutex<Box<dyn Write + Send>>,
    /// Kills the child independently of the reader thread
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Set once the child is gone (exited or killed)
    exited: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawn a new process with PTY
    ///
    /// Returns the process handle and the receiving end of its event channel.
    /// Output is read on a dedicated thread because PTY reads are blocking.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: Option<&HashMap<String, String>>,
        size: TerminalSize,
    ) -> PtyResult<(Self, mpsc::Receiver<PtyEvent>)> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        cmd.cwd(working_dir);

        if let Some(env_vars) = env {
            for (key, value) in env_vars {
                cmd.env(key, value);
            }
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Drop the slave - we only need the master
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let killer = child.clone_killer();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let exited_clone = Arc::clone(&exited);

        std::thread::spawn(move || {
            Self::reader_loop(reader, &event_tx);

            let exit = match child.wait() {
                Ok(status) => ProcessExit {
                    exit_code: Some(status.exit_code() as i32),
                    reason: ExitReason::Normal,
                },
                Err(_) => ProcessExit {
                    exit_code: None,
                    reason: ExitReason::Unknown,
                },
            };
            let reason = if exited_clone.swap(true, Ordering::SeqCst) {
                ExitReason::Killed
            } else {
                exit.reason
            };
            let _ = event_tx.blocking_send(PtyEvent::Exit(ProcessExit { reason, ..exit }));
        });

        Ok((
            Self {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                killer: Mutex::new(killer),
                exited,
            },
            event_rx,
        ))
    }

    /// Reader loop that runs in a separate thread until EOF or error
    fn reader_loop(mut reader: Box<dyn Read + Send>, event_tx: &mpsc::Sender<PtyEvent>) {
        let mut buffer = [0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if event_tx
                        .blocking_send(PtyEvent::Output(buffer[..n].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                // EIO on Linux once the slave side is closed
                Err(_) => break,
            }
        }
    }

    /// Check if the process has exited
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Write input to the PTY (stdin)
    pub async fn write(&self, data: &[u8]) -> PtyResult<()> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Resize the terminal
    pub async fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }

        let master = self.master.lock().await;
        master
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        Ok(())
    }

    /// Kill the process
    ///
    /// Idempotent. The reader thread still reports the exit, tagged `Killed`.
    pub async fn kill(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.killer.lock().await.kill();
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            if let Ok(mut killer) = self.killer.try_lock() {
                let _ = killer.kill();
            }
        }
    }
}
