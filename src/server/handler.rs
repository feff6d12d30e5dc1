//! Control message handler
//!
//! Turns validated control-channel requests into registry calls.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::protocol::{ClientEnvelope, ClientMessage, ServerMessage};
use crate::relay::{CreateRequest, SessionRegistry};

/// Dispatches control messages for one server
pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
}

impl ControlHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one raw JSON request; protocol failures become error replies
    pub async fn handle_text(&self, text: &str) -> ServerMessage {
        match ClientEnvelope::from_json(text) {
            Ok(envelope) => self.handle(envelope.message).await,
            Err(e) => {
                debug!("Rejected control message: {}", e);
                e.into()
            }
        }
    }

    pub async fn handle(&self, message: ClientMessage) -> ServerMessage {
        let patch = message.meta_patch();
        match message {
            ClientMessage::Ping { seq } => {
                debug!("Received ping with seq {}", seq);
                ServerMessage::pong(seq)
            }
            ClientMessage::CreateSession {
                name,
                group,
                working_dir,
                initial_input,
            } => {
                let request = CreateRequest {
                    name,
                    group,
                    working_dir: working_dir.map(PathBuf::from),
                    initial_input,
                };
                match self.registry.create(request).await {
                    Ok(session) => ServerMessage::SessionCreated { session },
                    Err(e) => ServerMessage::relay_error(None, &e),
                }
            }
            ClientMessage::ListSessions { include_archived } => ServerMessage::SessionList {
                sessions: self.registry.list(include_archived).await,
            },
            ClientMessage::GetSession { session_id } => {
                match self.registry.get(&session_id).await {
                    Ok(session) => ServerMessage::SessionInfo { session },
                    Err(e) => ServerMessage::relay_error(Some(&session_id), &e),
                }
            }
            ClientMessage::DeleteSession { session_id } => {
                match self.registry.delete(&session_id).await {
                    Ok(()) => ServerMessage::SessionDeleted { session_id },
                    Err(e) => ServerMessage::relay_error(Some(&session_id), &e),
                }
            }
            ClientMessage::PatchSession { session_id, .. } => {
                let patch = patch.unwrap_or_default();
                match self.registry.patch_meta(&session_id, &patch).await {
                    Ok(session) => ServerMessage::SessionPatched { session },
                    Err(e) => ServerMessage::relay_error(Some(&session_id), &e),
                }
            }
        }
    }
}
