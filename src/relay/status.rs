//! Session status state machine
//!
//! Status is derived purely from process timing, never from output content.
//! `done` and `error` are terminal for one process generation; only a new
//! generation (a fresh spawn or reattach) returns the session to `running`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Catalog-only sessions younger than this look running
const HEURISTIC_RUNNING_AGE: Duration = Duration::from_secs(60);

/// Catalog-only sessions younger than this (and older than running) look done
const HEURISTIC_DONE_AGE: Duration = Duration::from_secs(300);

/// Coarse liveness status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Idle,
    Done,
    Error,
}

impl SessionStatus {
    /// Whether this status ends the current generation
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Done => "done",
            SessionStatus::Error => "error",
        }
    }
}

/// Status for a session with no process handle this relay lifetime,
/// derived from the age of its last catalog modification.
pub fn heuristic_status(age: Duration) -> SessionStatus {
    if age < HEURISTIC_RUNNING_AGE {
        SessionStatus::Running
    } else if age < HEURISTIC_DONE_AGE {
        SessionStatus::Done
    } else {
        SessionStatus::Idle
    }
}

/// Live status of one session across process generations
#[derive(Debug, Clone)]
pub struct StatusTracker {
    status: Option<SessionStatus>,
    generation: u64,
    last_output: Instant,
}

impl StatusTracker {
    /// Tracker for a freshly created session
    pub fn running(now: Instant) -> Self {
        Self {
            status: Some(SessionStatus::Running),
            generation: 0,
            last_output: now,
        }
    }

    /// Tracker for a session known only from the catalog
    pub fn unset(now: Instant) -> Self {
        Self {
            status: None,
            generation: 0,
            last_output: now,
        }
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.status
    }

    /// A new process handle went live
    pub fn begin_generation(&mut self, generation: u64, now: Instant) {
        self.generation = generation;
        self.status = Some(SessionStatus::Running);
        self.last_output = now;
    }

    /// Output from `generation`; returns whether it was accepted
    pub fn record_output(&mut self, generation: u64, now: Instant) -> bool {
        if generation != self.generation || self.is_terminal() {
            return false;
        }
        self.status = Some(SessionStatus::Running);
        self.last_output = now;
        true
    }

    /// Observer input; only lifts an idle session back to running
    pub fn record_input(&mut self) {
        if self.status == Some(SessionStatus::Idle) {
            self.status = Some(SessionStatus::Running);
        }
    }

    /// Process of `generation` exited; returns the terminal status if applied
    pub fn record_exit(&mut self, generation: u64, exit_code: Option<i32>) -> Option<SessionStatus> {
        if generation != self.generation || self.is_terminal() {
            return None;
        }
        let status = if exit_code == Some(0) {
            SessionStatus::Done
        } else {
            SessionStatus::Error
        };
        self.status = Some(status);
        Some(status)
    }

    /// Spawn failed; the session stays registered without a status
    pub fn clear(&mut self) {
        self.status = None;
    }

    /// Periodic transition check; returns the new status when it changed
    ///
    /// `live` means a process handle is installed, `spawning` means one is
    /// being created or attached right now.
    pub fn sweep(
        &mut self,
        now: Instant,
        live: bool,
        spawning: bool,
        idle_threshold: Duration,
    ) -> Option<SessionStatus> {
        let current = self.status?;
        if live {
            if current == SessionStatus::Running
                && now.saturating_duration_since(self.last_output) > idle_threshold
            {
                self.status = Some(SessionStatus::Idle);
                return self.status;
            }
            return None;
        }
        if !spawning && !current.is_terminal() {
            self.status = Some(SessionStatus::Error);
            return self.status;
        }
        None
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(SessionStatus::is_terminal)
    }
}
