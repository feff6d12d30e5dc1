//! WebSocket server module
//!
//! Serves the JSON control channel and the per-session streaming channels,
//! routing both into the relay.

mod handler;
mod protocol;
mod websocket;

pub use handler::ControlHandler;
pub use protocol::*;
pub use websocket::{ServerConfig, WebSocketServer};
