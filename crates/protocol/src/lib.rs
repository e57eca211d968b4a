//! # ptyrelay Protocol Library
//!
//! This crate defines the wire shapes shared by the ptyrelay daemon and the
//! consumers that drive its terminal sessions.
//!
//! ## Overview
//!
//! - **Relay Frames**: resize control frames and raw keystroke data sent by a
//!   consumer, classified by [`Inbound::classify`]
//! - **Session Payloads**: create/list request and response bodies used by the
//!   local control surface
//! - **Output Framing**: UTF-8 safe conversion of shell output into outbound
//!   text messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Consumer (browser terminal, CLI)      │
//! ├─────────────────────────────────────────┤
//! │  resize frame (JSON) │ keystrokes (raw) │  consumer → daemon
//! ├─────────────────────────────────────────┤
//! │        shell output (raw text)          │  daemon → consumer
//! ├─────────────────────────────────────────┤
//! │          Transport (WebSocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ControlFrame, Inbound, TerminalSize};
//!
//! let size = TerminalSize::new(120, 40).unwrap();
//! let json = ControlFrame::resize(size).to_json().unwrap();
//!
//! assert_eq!(Inbound::classify(json.as_bytes()), Inbound::Resize(size));
//! assert_eq!(Inbound::classify(b"ls\n"), Inbound::Input(b"ls\n".to_vec()));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Relay frames and session payloads
//! - [`framing`]: Output text framing
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{OutputFramer, MAX_CARRY};
pub use messages::{
    ControlFrame, Inbound, SessionCreate, SessionCreated, SessionState, SessionSummary,
    TerminalSize, DEFAULT_COLS, DEFAULT_ROWS,
};
