//! Session management module.
//!
//! This module provides PTY spawning, the per-session I/O pumps and the
//! registry that owns every live session. Sessions can be created, written
//! to, drained, resized, inspected through their transcript, and destroyed.

pub mod manager;
pub mod pty;
pub mod pump;
pub mod shell;

pub use manager::{RegistryConfig, SessionEvent, SessionRegistry};
pub use pty::{Session, SessionError, SessionId, SpawnOptions};
pub use pump::{PumpConfig, PumpExit};
pub use shell::ShellKind;
