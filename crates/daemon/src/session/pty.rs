//! PTY session management.
//!
//! This module provides the core PTY spawning and buffer handling.
//! A session represents a single terminal session with a shell process,
//! the master side of its pseudo-terminal, and three buffers:
//!
//! - the pending output buffer, filled by the output pump and drained by a relay
//! - the pending input queue, filled by a relay and flushed by the input pump
//! - the transcript log, append-only and never drained

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{OutputFramer, SessionState, SessionSummary, TerminalSize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::shell::ShellKind;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The requested shell is not in the allow-list.
    #[error("shell not allowed: {0:?} (expected one of bash, zsh, fish, sh)")]
    InvalidShell(String),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to read from the PTY.
    #[error("failed to read from PTY: {0}")]
    ReadFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// Terminal dimensions were zero.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    /// The registry is full.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for spawning a session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub name: String,
    pub workspace: String,
    pub shell: ShellKind,
    pub size: TerminalSize,
    /// Value of `TERM` in the child's environment.
    pub term: String,
    pub cwd: Option<String>,
    /// Log cap in bytes; 0 keeps everything.
    pub max_log_bytes: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            name: "Terminal".to_string(),
            workspace: "ws1".to_string(),
            shell: ShellKind::default(),
            size: TerminalSize::default(),
            term: "xterm-256color".to_string(),
            cwd: None,
            max_log_bytes: 0,
        }
    }
}

/// Session transcript, decoded as text.
#[derive(Debug, Default)]
struct Transcript {
    text: String,
    decoder: OutputFramer,
    max_bytes: usize,
}

impl Transcript {
    fn append(&mut self, bytes: &[u8]) {
        if let Some(chunk) = self.decoder.push(bytes) {
            self.text.push_str(&chunk);
        }
        if self.max_bytes > 0 && self.text.len() > self.max_bytes {
            let mut cut = self.text.len() - self.max_bytes;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}

/// A PTY session with a shell process.
///
/// The session exclusively owns the PTY master and the child process. The
/// registry holds the only long-lived strong reference; pumps hold a `Weak`
/// and upgrade it one iteration at a time, so the master descriptor is closed
/// only once nothing can touch it any more.
pub struct Session {
    id: SessionId,
    name: String,
    workspace: String,
    shell: ShellKind,
    pid: u32,
    created_at: u64,

    /// The PTY master handle. Dropping it closes the master descriptor.
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Raw descriptor of `master`, valid for as long as `self` is alive.
    master_fd: RawFd,

    /// The child process.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    size: Mutex<TerminalSize>,
    state: Mutex<SessionState>,

    output: Mutex<Vec<u8>>,
    output_ready: Arc<Notify>,

    input: Mutex<Vec<u8>>,
    input_ready: Condvar,

    log: Mutex<Transcript>,

    /// Set once the output pump has seen the shell close its terminal. Every
    /// byte the shell wrote is in `output` by then.
    exited: AtomicBool,
    /// Set while a relay is attached and will do the final drain.
    consumer: AtomicBool,

    cancel: CancellationToken,
}

impl Session {
    /// Spawns a new PTY session.
    ///
    /// The child gets the PTY slave as its controlling terminal and standard
    /// streams; the parent's copy of the slave is closed before returning and
    /// the master is switched to non-blocking mode. Pumps are not started here.
    pub fn spawn(options: SpawnOptions) -> Result<Self, SessionError> {
        let id = Uuid::new_v4().to_string();
        let size = options.size;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(to_pty_size(size))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(options.shell.program());
        cmd.env("TERM", &options.term);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let master = pair.master;
        let master_fd = master.as_raw_fd();

        let session = Session {
            id,
            name: options.name,
            workspace: options.workspace,
            shell: options.shell,
            pid,
            created_at: unix_now(),
            master: Mutex::new(master),
            master_fd: master_fd.unwrap_or(-1),
            child: Mutex::new(child),
            size: Mutex::new(size),
            state: Mutex::new(SessionState::Spawning),
            output: Mutex::new(Vec::new()),
            output_ready: Arc::new(Notify::new()),
            input: Mutex::new(Vec::new()),
            input_ready: Condvar::new(),
            log: Mutex::new(Transcript {
                max_bytes: options.max_log_bytes,
                ..Transcript::default()
            }),
            exited: AtomicBool::new(false),
            consumer: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };

        // From here on an early return drops `session`, which reaps the child.
        if master_fd.is_none() {
            return Err(SessionError::SpawnFailed(
                "PTY master has no file descriptor".to_string(),
            ));
        }
        session.set_nonblocking()?;

        tracing::debug!(
            session_id = %session.id,
            pid = pid,
            shell = %session.shell,
            size = %size,
            "Spawned PTY session"
        );

        Ok(session)
    }

    fn set_nonblocking(&self) -> Result<(), SessionError> {
        let flags = fcntl(self.master_fd, FcntlArg::F_GETFL)
            .map_err(|e| SessionError::SpawnFailed(format!("F_GETFL: {e}")))?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(self.master_fd, FcntlArg::F_SETFL(flags))
            .map_err(|e| SessionError::SpawnFailed(format!("F_SETFL: {e}")))?;
        Ok(())
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the workspace tag.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Returns the shell running in this session.
    pub fn shell(&self) -> ShellKind {
        self.shell
    }

    /// Returns the process ID of the shell, or 0 if it was not reported.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Creation time in Unix epoch seconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Returns the stored terminal size.
    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    /// Returns the lifecycle state.
    ///
    /// A running session whose shell has exited reads as `Terminating` until
    /// it is removed.
    pub fn state(&self) -> SessionState {
        let state = *lock(&self.state);
        if state == SessionState::Running && self.has_exited() {
            SessionState::Terminating
        } else {
            state
        }
    }

    /// Whether the shell has closed its terminal.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Records that the shell closed its terminal and wakes any relay.
    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.output_ready.notify_one();
    }

    /// Whether a relay is attached to this session.
    pub fn has_consumer(&self) -> bool {
        self.consumer.load(Ordering::SeqCst)
    }

    pub(crate) fn set_consumer(&self, attached: bool) {
        self.consumer.store(attached, Ordering::SeqCst);
    }

    /// Returns whether the session is still running.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub(crate) fn mark_running(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Spawning {
            *state = SessionState::Running;
        }
    }

    /// Snapshot of the session for listings.
    pub fn summary(&self) -> SessionSummary {
        let size = self.size();
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            workspace: self.workspace.clone(),
            shell: self.shell.to_string(),
            pid: self.pid,
            cols: size.cols(),
            rows: size.rows(),
            created_at: self.created_at,
            state: self.state(),
        }
    }

    /// Resizes the PTY and records the new dimensions.
    ///
    /// The window-size change is applied to the terminal driver, which
    /// signals the shell's foreground process group.
    pub fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        {
            let master = lock(&self.master);
            master
                .resize(to_pty_size(size))
                .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        }
        *lock(&self.size) = size;

        tracing::debug!(
            session_id = %self.id,
            cols = size.cols(),
            rows = size.rows(),
            "Resized PTY"
        );

        Ok(())
    }

    /// Queries the window size directly from the terminal driver.
    pub fn driver_size(&self) -> Result<TerminalSize, SessionError> {
        let pty_size = lock(&self.master)
            .get_size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        TerminalSize::new(pty_size.cols, pty_size.rows).map_err(|_| {
            SessionError::InvalidDimensions {
                cols: pty_size.cols,
                rows: pty_size.rows,
            }
        })
    }

    /// Appends bytes to the pending input queue.
    pub fn enqueue_input(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        lock(&self.input).extend_from_slice(data);
        self.input_ready.notify_one();
    }

    /// Takes all pending output, leaving the buffer empty.
    pub fn drain_output(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.output))
    }

    /// Returns a copy of the full transcript so far.
    pub fn log_text(&self) -> String {
        lock(&self.log).text.clone()
    }

    /// Notifier fired whenever the output pump appends to the buffer.
    pub fn output_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.output_ready)
    }

    /// Token cancelled when the session starts terminating.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn master_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: `master_fd` belongs to `self.master`, which is only closed
        // when `self` is dropped, so it outlives the returned borrow.
        unsafe { BorrowedFd::borrow_raw(self.master_fd) }
    }

    pub(crate) fn append_output(&self, data: &[u8]) {
        lock(&self.output).extend_from_slice(data);
        lock(&self.log).append(data);
        self.output_ready.notify_one();
    }

    /// Waits up to `timeout` for queued input and takes all of it.
    pub(crate) fn take_input(&self, timeout: Duration) -> Vec<u8> {
        let guard = lock(&self.input);
        let (mut queue, _) = self
            .input_ready
            .wait_timeout_while(guard, timeout, |queue| {
                queue.is_empty() && !self.cancel.is_cancelled()
            })
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *queue)
    }

    /// Terminates the shell.
    ///
    /// Only the first call acts; later calls return immediately. Pumps are
    /// cancelled, the child is sent SIGTERM, then hung up and killed if it
    /// is still alive, and finally reaped. The master descriptor stays open
    /// until the session itself is dropped.
    pub fn terminate(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Terminating | SessionState::Closed) {
                return;
            }
            *state = SessionState::Terminating;
        }

        self.cancel.cancel();
        self.input_ready.notify_all();
        self.output_ready.notify_waiters();

        let mut child = lock(&self.child);

        if self.pid != 0 {
            if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                tracing::debug!(session_id = %self.id, error = %e, "SIGTERM failed");
            }
        }

        let status = match child.try_wait() {
            Ok(Some(status)) => Ok(status),
            _ => {
                if let Err(e) = child.kill() {
                    tracing::debug!(session_id = %self.id, error = %e, "Kill failed");
                }
                child.wait()
            }
        };

        match status {
            Ok(status) => tracing::info!(
                session_id = %self.id,
                exit_code = status.exit_code(),
                "Session terminated"
            ),
            Err(e) => tracing::warn!(
                session_id = %self.id,
                error = %SessionError::KillFailed(e.to_string()),
                "Could not reap shell"
            ),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
        *lock(&self.state) = SessionState::Closed;
        tracing::debug!(session_id = %self.id, "PTY closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows(),
        cols: size.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_options() -> SpawnOptions {
        SpawnOptions {
            shell: ShellKind::Sh,
            ..SpawnOptions::default()
        }
    }

    #[test]
    fn test_session_spawn() {
        let result = Session::spawn(sh_options());
        assert!(result.is_ok(), "Failed to spawn session: {:?}", result.err());

        let session = result.unwrap();
        assert_eq!(session.state(), SessionState::Spawning);
        assert_eq!(session.size(), TerminalSize::default());
        assert_eq!(session.id().len(), 36);
        assert!(session.pid() > 0);

        session.terminate();
        assert_eq!(session.state(), SessionState::Terminating);
    }

    #[test]
    fn test_master_is_nonblocking() {
        let session = Session::spawn(sh_options()).unwrap();
        let flags = fcntl(session.master_fd, FcntlArg::F_GETFL).unwrap();
        assert!(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_session_resize() {
        let session = Session::spawn(sh_options()).unwrap();

        let size = TerminalSize::new(40, 10).unwrap();
        session.resize(size).unwrap();

        assert_eq!(session.size(), size);
        assert_eq!(session.driver_size().unwrap(), size);
    }

    #[test]
    fn test_initial_size_reaches_driver() {
        let session = Session::spawn(SpawnOptions {
            size: TerminalSize::new(132, 43).unwrap(),
            ..sh_options()
        })
        .unwrap();
        assert_eq!(session.driver_size().unwrap(), TerminalSize::new(132, 43).unwrap());
    }

    #[test]
    fn test_drain_output_empties_buffer() {
        let session = Session::spawn(sh_options()).unwrap();

        session.append_output(b"one ");
        session.append_output(b"two");
        assert_eq!(session.drain_output(), b"one two");
        assert!(session.drain_output().is_empty());

        // The log is not consumed by drains.
        assert_eq!(session.log_text(), "one two");
    }

    #[test]
    fn test_log_is_lossy_but_never_fails() {
        let session = Session::spawn(sh_options()).unwrap();
        session.append_output(b"ok \xFF done");
        assert_eq!(session.log_text(), "ok \u{FFFD} done");
    }

    #[test]
    fn test_log_cap_keeps_tail() {
        let session = Session::spawn(SpawnOptions {
            max_log_bytes: 8,
            ..sh_options()
        })
        .unwrap();
        session.append_output(b"0123456789abcdef");
        assert_eq!(session.log_text(), "89abcdef");
    }

    #[test]
    fn test_take_input_times_out_when_empty() {
        let session = Session::spawn(sh_options()).unwrap();
        let taken = session.take_input(Duration::from_millis(10));
        assert!(taken.is_empty());
    }

    #[test]
    fn test_input_queue_preserves_order() {
        let session = Session::spawn(sh_options()).unwrap();
        session.enqueue_input(b"first ");
        session.enqueue_input(b"");
        session.enqueue_input(b"second");
        assert_eq!(session.take_input(Duration::from_millis(10)), b"first second");
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let session = Session::spawn(sh_options()).unwrap();
        session.terminate();
        session.terminate();
        assert!(session.cancellation().is_cancelled());
        assert!(!session.is_running());
    }
}
