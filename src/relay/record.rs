//! Session records as seen by callers

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use vte::Perform;

use super::status::SessionStatus;
use crate::catalog::CatalogEntry;

/// Snapshot of one session's metadata and live state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    /// Display name (custom name when one is set)
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub working_dir: PathBuf,
    /// Unix milliseconds
    pub created_at: u64,
    /// Unix milliseconds
    pub last_activity: u64,
    /// `None` while the session is registered but statusless
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub message_count: u64,
    /// Whether a process handle is installed right now
    #[serde(default)]
    pub live: bool,
    /// Connected observers
    #[serde(default)]
    pub observers: usize,
}

impl SessionRecord {
    /// Record for a catalog entry without any live state
    pub fn from_catalog(entry: &CatalogEntry, status: Option<SessionStatus>) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.display_name().to_string(),
            group: entry.group.clone(),
            working_dir: entry.working_dir.clone(),
            created_at: entry.created_at,
            last_activity: entry.modified_at,
            status,
            preview: String::new(),
            pinned: entry.pinned,
            archived: entry.archived,
            message_count: entry.message_count,
            live: false,
            observers: 0,
        }
    }
}

/// Tracks the most recent non-empty output line of one session
///
/// Output is fed through a VT parser, so escape sequences of every kind
/// (CSI, OSC, DCS, charset designation) are consumed even when one is split
/// across reads. Lines are truncated to `max_chars` characters.
pub struct PreviewTracker {
    parser: vte::Parser,
    lines: LineCollector,
}

impl PreviewTracker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            parser: vte::Parser::new(),
            lines: LineCollector {
                max_chars,
                current: String::new(),
                current_chars: 0,
                chunk_last: None,
            },
        }
    }

    /// Feed one output chunk; returns the new preview if the chunk produced one
    ///
    /// An unterminated trailing line (a prompt, a progress bar) wins over the
    /// last completed line.
    pub fn feed(&mut self, data: &[u8]) -> Option<String> {
        self.lines.chunk_last = None;
        self.parser.advance(&mut self.lines, data);

        let partial = self.lines.current.trim_end();
        if partial.is_empty() {
            self.lines.chunk_last.take()
        } else {
            Some(partial.to_string())
        }
    }
}

struct LineCollector {
    max_chars: usize,
    current: String,
    current_chars: usize,
    /// Last non-empty line completed during the current chunk
    chunk_last: Option<String>,
}

impl LineCollector {
    fn end_line(&mut self) {
        let line = self.current.trim_end();
        if !line.is_empty() {
            self.chunk_last = Some(line.to_string());
        }
        self.current.clear();
        self.current_chars = 0;
    }
}

impl Perform for LineCollector {
    fn print(&mut self, c: char) {
        if self.current.is_empty() && c.is_whitespace() {
            return;
        }
        if self.current_chars < self.max_chars {
            self.current.push(c);
            self.current_chars += 1;
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' | 0x0b | 0x0c => self.end_line(),
            b'\t' => self.print(' '),
            // backspace
            0x08 => {
                if self.current.pop().is_some() {
                    self.current_chars -= 1;
                }
            }
            _ => {}
        }
    }
}
