//! Network module for consumer connections.
//!
//! This module provides:
//! - the relay loop bridging one WebSocket consumer to one session
//! - the WebSocket listener that routes `/ws/{session_id}` upgrades to relays

pub mod relay;
pub mod websocket;

// Re-export key types
pub use relay::{run_relay, RelayConfig, RelayError, RelayExit, DEFAULT_FLUSH_INTERVAL};
pub use websocket::{session_id_from_path, RelayEvent, RelayListener, DEFAULT_LISTEN_ADDR};
