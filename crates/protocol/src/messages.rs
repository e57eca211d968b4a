//! Message definitions for ptyrelay.
//!
//! Two families of messages live here:
//!
//! - **Relay frames** exchanged over a consumer's duplex channel. Inbound
//!   messages are either a resize control frame or raw keystrokes; outbound
//!   messages are raw shell output with no framing of their own.
//! - **Session management payloads** used by the local control surface to
//!   create, list and inspect sessions.

use std::fmt;
use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal dimensions. Both values are always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTerminalSize")]
pub struct TerminalSize {
    cols: u16,
    rows: u16,
}

#[derive(Deserialize)]
struct RawTerminalSize {
    cols: u16,
    rows: u16,
}

impl TryFrom<RawTerminalSize> for TerminalSize {
    type Error = ProtocolError;

    fn try_from(raw: RawTerminalSize) -> Result<Self> {
        TerminalSize::new(raw.cols, raw.rows)
    }
}

impl TerminalSize {
    /// Create a new size, rejecting zero in either dimension.
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(ProtocolError::InvalidDimensions { cols, rows });
        }
        Ok(Self { cols, rows })
    }

    /// Terminal width in columns.
    pub fn cols(&self) -> u16 {
        self.cols
    }

    /// Terminal height in rows.
    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

// ============================================================================
// Relay Frames
// ============================================================================

/// Structured control frame sent by a consumer.
///
/// On the wire this is `{"type":"resize","cols":N,"rows":M}`. The `type`
/// discriminator selects the variant; unknown fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Change the terminal window size.
    Resize {
        /// New terminal columns.
        cols: NonZeroU16,
        /// New terminal rows.
        rows: NonZeroU16,
    },
}

impl ControlFrame {
    /// Build a resize frame for the given size.
    pub fn resize(size: TerminalSize) -> Self {
        // TerminalSize guarantees both values are non-zero.
        let cols = NonZeroU16::new(size.cols).unwrap_or(NonZeroU16::MIN);
        let rows = NonZeroU16::new(size.rows).unwrap_or(NonZeroU16::MIN);
        ControlFrame::Resize { cols, rows }
    }

    /// Serialize the frame to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A classified inbound consumer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Resize the session's terminal.
    Resize(TerminalSize),
    /// Raw keystroke bytes to forward verbatim to the shell.
    Input(Vec<u8>),
}

impl Inbound {
    /// Classify a raw consumer payload.
    ///
    /// Never fails: anything that is not exactly a resize frame, including
    /// structured payloads with another discriminator, is treated as input.
    pub fn classify(payload: &[u8]) -> Self {
        let looks_structured = payload
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{');

        if looks_structured {
            if let Ok(ControlFrame::Resize { cols, rows }) =
                serde_json::from_slice::<ControlFrame>(payload)
            {
                return Inbound::Resize(TerminalSize {
                    cols: cols.get(),
                    rows: rows.get(),
                });
            }
        }

        Inbound::Input(payload.to_vec())
    }
}

// ============================================================================
// Session Management Payloads
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Terminal allocated, child being started.
    Spawning,
    /// Pumps active, session usable.
    Running,
    /// Child signalled, pumps winding down.
    Terminating,
    /// Terminal released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Spawning => "spawning",
            SessionState::Running => "running",
            SessionState::Terminating => "terminating",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Request to create a new shell session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCreate {
    /// Display name.
    pub name: String,
    /// Opaque grouping tag owned by the UI layer.
    pub workspace: String,
    /// Requested shell kind (bash, zsh, fish or sh).
    pub shell: String,
    /// Requested terminal columns.
    pub cols: u16,
    /// Requested terminal rows.
    pub rows: u16,
}

impl Default for SessionCreate {
    fn default() -> Self {
        Self {
            name: "Terminal".to_string(),
            workspace: "ws1".to_string(),
            shell: "bash".to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl SessionCreate {
    /// The requested size, validated.
    pub fn size(&self) -> Result<TerminalSize> {
        TerminalSize::new(self.cols, self.rows)
    }
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    /// Unique session identifier.
    pub session_id: String,
    /// Resolved display name.
    pub name: String,
    /// Process ID of the shell.
    pub pid: u32,
    /// The shell that was actually started.
    pub shell: String,
    /// True when the requested shell was not allowed and the default was used.
    pub shell_substituted: bool,
}

/// Summary of a registered session for listings and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique session identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Workspace tag.
    pub workspace: String,
    /// Shell program name.
    pub shell: String,
    /// Process ID of the shell.
    pub pid: u32,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Creation time (Unix epoch seconds).
    pub created_at: u64,
    /// Lifecycle state.
    pub state: SessionState,
}
