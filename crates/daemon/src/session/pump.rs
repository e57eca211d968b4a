//! Output and input pumps.
//!
//! Each session runs two dedicated threads:
//!
//! - the **output pump** waits for the PTY master to become readable (bounded
//!   by the poll interval), reads one chunk and appends it to the session's
//!   output buffer and transcript
//! - the **input pump** sleeps on the input queue's condition variable and
//!   writes everything queued to the PTY master, retrying partial writes
//!
//! Pumps hold only a `Weak<Session>`. Every iteration upgrades it and drops
//! the strong reference before the next wait, so once the registry forgets a
//! session the pumps notice within one interval and exit.

use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::pty::{Session, SessionError, SessionId};

/// Maximum bytes read from the PTY per iteration.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Default readiness wait for the output pump.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default wait on an empty input queue before re-checking the session.
pub const DEFAULT_INPUT_WAIT: Duration = Duration::from_millis(50);

/// Timing parameters for the pumps.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub poll_interval: Duration,
    pub input_wait: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            input_wait: DEFAULT_INPUT_WAIT,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The session was dropped from the registry.
    Detached,
    /// The session is terminating.
    Cancelled,
    /// The shell closed its side of the terminal.
    Eof,
    /// An unrecoverable I/O error.
    Failed(SessionError),
}

/// Called once by the output pump when the shell goes away on its own.
pub type ExitHook = Box<dyn FnOnce(&SessionId, &PumpExit) + Send + 'static>;

/// Handles to a session's pump threads.
pub struct PumpHandles {
    pub output: JoinHandle<PumpExit>,
    pub input: JoinHandle<PumpExit>,
}

/// Starts both pumps for `session`.
pub fn start(
    session: &Arc<Session>,
    config: PumpConfig,
    on_exit: ExitHook,
) -> Result<PumpHandles, SessionError> {
    let id = session.id().clone();
    let short = id.get(..8).unwrap_or(&id).to_string();

    let weak = Arc::downgrade(session);
    let output_id = id.clone();
    let output = std::thread::Builder::new()
        .name(format!("pty-out-{short}"))
        .spawn(move || {
            let exit = run_output(&weak, config.poll_interval);
            log_exit(&output_id, "output", &exit);
            if matches!(exit, PumpExit::Eof | PumpExit::Failed(_)) {
                on_exit(&output_id, &exit);
            }
            exit
        })?;

    let weak = Arc::downgrade(session);
    let input = std::thread::Builder::new()
        .name(format!("pty-in-{short}"))
        .spawn(move || {
            let exit = run_input(&weak, config);
            log_exit(&id, "input", &exit);
            exit
        })?;

    Ok(PumpHandles { output, input })
}

fn log_exit(id: &SessionId, pump: &str, exit: &PumpExit) {
    match exit {
        PumpExit::Failed(e) => {
            tracing::warn!(session_id = %id, pump = pump, error = %e, "Pump failed")
        }
        other => tracing::debug!(session_id = %id, pump = pump, reason = ?other, "Pump stopped"),
    }
}

fn run_output(weak: &Weak<Session>, poll_interval: Duration) -> PumpExit {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let Some(session) = weak.upgrade() else {
            return PumpExit::Detached;
        };
        if session.cancellation().is_cancelled() {
            return PumpExit::Cancelled;
        }

        match wait_ready(&session, PollFlags::POLLIN, poll_interval) {
            Ok(Readiness::Timeout) => continue,
            Ok(Readiness::Ready) => {}
            Ok(Readiness::HungUp) => return PumpExit::Eof,
            Err(Errno::EINTR) => continue,
            Err(e) => return PumpExit::Failed(SessionError::ReadFailed(e.to_string())),
        }

        match nix::unistd::read(session.master_fd().as_raw_fd(), &mut buf) {
            Ok(0) => return PumpExit::Eof,
            Ok(n) => session.append_output(&buf[..n]),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            // Linux reports EIO on the master once every slave fd is closed.
            Err(Errno::EIO) => return PumpExit::Eof,
            Err(e) => return PumpExit::Failed(SessionError::ReadFailed(e.to_string())),
        }
    }
}

fn run_input(weak: &Weak<Session>, config: PumpConfig) -> PumpExit {
    loop {
        let Some(session) = weak.upgrade() else {
            return PumpExit::Detached;
        };
        if session.cancellation().is_cancelled() {
            return PumpExit::Cancelled;
        }

        let pending = session.take_input(config.input_wait);
        if pending.is_empty() {
            continue;
        }

        if let Err(exit) = write_all(&session, &pending, config.poll_interval) {
            return exit;
        }
    }
}

/// Writes `data` to the master, retrying partial writes until all of it is
/// accepted.
fn write_all(session: &Session, mut data: &[u8], poll_interval: Duration) -> Result<(), PumpExit> {
    while !data.is_empty() {
        if session.cancellation().is_cancelled() {
            return Err(PumpExit::Cancelled);
        }

        match nix::unistd::write(session.master_fd(), data) {
            Ok(0) => {
                return Err(PumpExit::Failed(SessionError::WriteFailed(
                    "PTY accepted zero bytes".to_string(),
                )))
            }
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => match wait_ready(session, PollFlags::POLLOUT, poll_interval) {
                Ok(Readiness::HungUp) => return Err(PumpExit::Eof),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(PumpExit::Failed(SessionError::WriteFailed(e.to_string()))),
            },
            Err(Errno::EIO) => return Err(PumpExit::Eof),
            Err(e) => return Err(PumpExit::Failed(SessionError::WriteFailed(e.to_string()))),
        }
    }
    Ok(())
}

enum Readiness {
    Ready,
    Timeout,
    HungUp,
}

fn wait_ready(session: &Session, events: PollFlags, timeout: Duration) -> Result<Readiness, Errno> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(session.master_fd(), events)];

    if poll(&mut fds, PollTimeout::from(millis))? == 0 {
        return Ok(Readiness::Timeout);
    }

    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF);
    }
    if revents.intersects(events) {
        Ok(Readiness::Ready)
    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
        Ok(Readiness::HungUp)
    } else {
        Ok(Readiness::Timeout)
    }
}
