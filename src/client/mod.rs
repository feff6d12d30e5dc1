//! Relay clients
//!
//! The observer side of the streaming channel, with its reconnect schedule,
//! and a small control-channel client for the CLI.

mod backoff;
mod control;
mod observer;

pub use control::ControlClient;
pub use observer::ObserverClient;
