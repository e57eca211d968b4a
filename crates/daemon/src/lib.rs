//! # ptyrelay Daemon Library
//!
//! This crate hosts interactive shells on pseudo-terminals and relays each
//! one to a WebSocket consumer.
//!
//! ## Overview
//!
//! The daemon provides:
//!
//! - **Session Registry**: Create, write to, drain, resize, inspect and
//!   destroy PTY-backed shell sessions
//! - **I/O Pumps**: Per-session background loops moving bytes between the
//!   terminal and the session buffers
//! - **WebSocket Relay**: One consumer per session at `/ws/{session_id}`,
//!   with UTF-8 safe output framing and in-band resize frames
//! - **IPC**: A local socket the CLI uses to manage the running daemon
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Daemon Orchestrator                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────┐          ┌──────────────────────────┐  │
//! │  │  Relay Listener  │          │       IPC Server         │  │
//! │  │  (WebSocket)     │          │   (Unix socket, JSON)    │  │
//! │  └────────┬─────────┘          └────────────┬─────────────┘  │
//! │           │                                 │                │
//! │  ┌────────▼─────────────────────────────────▼─────────────┐  │
//! │  │                  Session Registry                      │  │
//! │  └────────┬───────────────────────────────────────────────┘  │
//! │           │                                                  │
//! │  ┌────────▼─────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │  Session (PTY)   │──│  Input pump  │──│ Output pump  │    │
//! │  └──────────────────┘  └──────────────┘  └──────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     orchestrator.stop_requested().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, validation and defaults
//! - [`session`]: PTY sessions, pumps and the session registry
//! - [`network`]: WebSocket listener and per-consumer relay
//! - [`ipc`]: CLI-to-daemon control socket
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use session::{
    RegistryConfig, Session, SessionError, SessionEvent, SessionId, SessionRegistry, ShellKind,
};

pub use network::{run_relay, RelayConfig, RelayError, RelayEvent, RelayExit, RelayListener};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
