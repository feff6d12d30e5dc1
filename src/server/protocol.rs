//! Protocol message definitions
//!
//! Two channels share one listener:
//! - the control channel (`/ws`) carries JSON messages with a version envelope
//! - the streaming channel (`/sessions/<id>/stream`) carries raw terminal bytes
//!   from the relay, and input or resize frames from the observer

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::MetaPatch;
use crate::relay::{RelayError, SessionRecord, MAX_INITIAL_INPUT_BYTES, MAX_LABEL_LENGTH};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Control channel path
pub const CONTROL_PATH: &str = "/ws";

/// Binary stream frame tag: the rest of the frame is input
pub const FRAME_TAG_INPUT: u8 = 0x00;

/// Binary stream frame tag: `cols:u16be rows:u16be` follow
pub const FRAME_TAG_RESIZE: u8 = 0x01;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Protocol envelope wrapping all server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Protocol version used by the server
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ServerMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        self.message.validate()
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEnvelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server envelope from JSON (used by the control client)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from a client to the relay over the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Create a session and start its process
    CreateSession {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        /// Written to the process once it has started
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_input: Option<String>,
    },

    /// List sessions, pinned first then most recently active
    ListSessions {
        #[serde(default)]
        include_archived: bool,
    },

    GetSession {
        session_id: String,
    },

    DeleteSession {
        session_id: String,
    },

    /// Update display metadata
    PatchSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pinned: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        archived: Option<bool>,
    },
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. } | ClientMessage::ListSessions { .. } => Ok(()),

            ClientMessage::CreateSession {
                name,
                group,
                working_dir,
                initial_input,
            } => {
                if name.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "name cannot be empty".to_string(),
                    ));
                }
                if name.len() > MAX_LABEL_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "name exceeds maximum length of {} characters",
                        MAX_LABEL_LENGTH
                    )));
                }
                if let Some(g) = group {
                    if g.len() > MAX_LABEL_LENGTH {
                        return Err(ProtocolError::ValidationError(format!(
                            "group exceeds maximum length of {} characters",
                            MAX_LABEL_LENGTH
                        )));
                    }
                }
                if let Some(dir) = working_dir {
                    if dir.is_empty() {
                        return Err(ProtocolError::ValidationError(
                            "working_dir cannot be empty when specified".to_string(),
                        ));
                    }
                    if dir.len() > MAX_PATH_LENGTH {
                        return Err(ProtocolError::ValidationError(format!(
                            "working_dir exceeds maximum length of {} characters",
                            MAX_PATH_LENGTH
                        )));
                    }
                }
                if let Some(input) = initial_input {
                    if input.len() > MAX_INITIAL_INPUT_BYTES {
                        return Err(ProtocolError::ValidationError(format!(
                            "initial_input exceeds maximum length of {} bytes",
                            MAX_INITIAL_INPUT_BYTES
                        )));
                    }
                }
                Ok(())
            }

            ClientMessage::GetSession { session_id }
            | ClientMessage::DeleteSession { session_id } => validate_session_id(session_id),

            ClientMessage::PatchSession { session_id, .. } => {
                validate_session_id(session_id)?;
                if self.meta_patch().is_some_and(|p| p.is_empty()) {
                    return Err(ProtocolError::ValidationError(
                        "patch_session must set at least one field".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Metadata patch carried by a `patch_session` message
    pub fn meta_patch(&self) -> Option<MetaPatch> {
        match self {
            ClientMessage::PatchSession {
                custom_name,
                project,
                pinned,
                archived,
                ..
            } => Some(MetaPatch {
                custom_name: custom_name.clone(),
                project: project.clone(),
                pinned: *pinned,
                archived: *archived,
            }),
            _ => None,
        }
    }

    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    pub fn create_session(name: impl Into<String>) -> Self {
        ClientMessage::CreateSession {
            name: name.into(),
            group: None,
            working_dir: None,
            initial_input: None,
        }
    }

    pub fn list_sessions(include_archived: bool) -> Self {
        ClientMessage::ListSessions { include_archived }
    }

    pub fn delete_session(session_id: impl Into<String>) -> Self {
        ClientMessage::DeleteSession {
            session_id: session_id.into(),
        }
    }
}

fn validate_session_id(session_id: &str) -> ProtocolResult<()> {
    if session_id.is_empty() {
        return Err(ProtocolError::ValidationError(
            "session_id cannot be empty".to_string(),
        ));
    }
    if session_id.len() > MAX_LABEL_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "session_id exceeds maximum length of {} characters",
            MAX_LABEL_LENGTH
        )));
    }
    Ok(())
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from the relay to a client over the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Server identifier/name
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    SessionCreated {
        session: SessionRecord,
    },

    SessionList {
        sessions: Vec<SessionRecord>,
    },

    SessionInfo {
        session: SessionRecord,
    },

    SessionDeleted {
        session_id: String,
    },

    SessionPatched {
        session: SessionRecord,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Related session if applicable
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Session id unknown to the relay
    NotFound,
    /// Malformed request arguments
    InvalidArgument,
    /// Process backend could not spawn or attach
    BackendUnavailable,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: None,
        }
    }

    pub fn welcome_with_id(server_id: impl Into<String>) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: Some(server_id.into()),
        }
    }

    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: None,
        }
    }

    /// Map a relay failure for `session_id` onto an error message
    pub fn relay_error(session_id: Option<&str>, err: &RelayError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            code: Some(ErrorCode::from(err)),
            session_id: session_id.map(str::to_string),
        }
    }
}

// ============================================================================
// Stream Frames
// ============================================================================

/// A decoded observer → relay frame on the streaming channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Raw keystrokes
    Input(Vec<u8>),
    /// Terminal geometry change
    Resize { cols: u16, rows: u16 },
}

#[derive(Deserialize)]
struct ResizeControl {
    #[serde(rename = "type")]
    kind: String,
    cols: u16,
    rows: u16,
}

impl StreamFrame {
    /// Decode a text frame.
    ///
    /// Browser terminals send resize requests as JSON text and keystrokes as
    /// plain text on the same channel. Only text that starts with `{`,
    /// mentions both `"type"` and `"resize"` and parses is a resize; anything
    /// else, including JSON that fails to parse, is input.
    pub fn from_text(text: &str) -> Self {
        if text.starts_with('{') && text.contains("\"type\"") && text.contains("\"resize\"") {
            if let Ok(control) = serde_json::from_str::<ResizeControl>(text) {
                if control.kind == "resize" {
                    return StreamFrame::Resize {
                        cols: control.cols,
                        rows: control.rows,
                    };
                }
            }
        }
        StreamFrame::Input(text.as_bytes().to_vec())
    }

    /// Decode a tagged binary frame; `None` for unknown tags or short frames
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let (&tag, payload) = data.split_first()?;
        match tag {
            FRAME_TAG_INPUT => Some(StreamFrame::Input(payload.to_vec())),
            FRAME_TAG_RESIZE if payload.len() >= 4 => Some(StreamFrame::Resize {
                cols: u16::from_be_bytes([payload[0], payload[1]]),
                rows: u16::from_be_bytes([payload[2], payload[3]]),
            }),
            _ => None,
        }
    }

    /// Encode as a tagged binary frame
    pub fn to_binary(&self) -> Vec<u8> {
        match self {
            StreamFrame::Input(data) => {
                let mut frame = Vec::with_capacity(data.len() + 1);
                frame.push(FRAME_TAG_INPUT);
                frame.extend_from_slice(data);
                frame
            }
            StreamFrame::Resize { cols, rows } => {
                let mut frame = vec![FRAME_TAG_RESIZE];
                frame.extend_from_slice(&cols.to_be_bytes());
                frame.extend_from_slice(&rows.to_be_bytes());
                frame
            }
        }
    }
}

/// Whether terminal dimensions are within the accepted range
pub fn valid_dimensions(cols: u16, rows: u16) -> bool {
    (1..=MAX_TERMINAL_COLS).contains(&cols) && (1..=MAX_TERMINAL_ROWS).contains(&rows)
}

/// Streaming path for a session
pub fn stream_path(session_id: &str) -> String {
    format!("/sessions/{}/stream", session_id)
}

/// Session id from a streaming path, if the path is one
pub fn parse_stream_path(path: &str) -> Option<&str> {
    let path = path.split('?').next()?;
    let id = path.strip_prefix("/sessions/")?.strip_suffix("/stream")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&RelayError> for ErrorCode {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::NotFound(_) => ErrorCode::NotFound,
            RelayError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            RelayError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
        }
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidArgument,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================
