//! Session registry for managing multiple PTY sessions.
//!
//! This module provides a thread-safe registry that creates, looks up and
//! destroys PTY sessions. The registry is the sole long-lived owner of every
//! session: removing an entry is the only path that terminates the shell and,
//! once the last transient handle is gone, releases the PTY master.

use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use protocol::{SessionCreate, SessionCreated, SessionSummary, TerminalSize};
use tokio::sync::broadcast;

use super::pty::{lock, Session, SessionError, SessionId, SpawnOptions};
use super::pump::{self, PumpConfig, PumpExit};
use super::shell::ShellKind;

/// Channel capacity for registry events.
const EVENT_CAPACITY: usize = 64;

/// Settings applied to every session the registry creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Shell used when the requested one is not allowed.
    pub default_shell: ShellKind,
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Value of `TERM` for spawned shells.
    pub term: String,
    /// Working directory for spawned shells.
    pub cwd: Option<String>,
    /// Transcript cap in bytes; 0 keeps everything.
    pub max_log_bytes: usize,
    pub pumps: PumpConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_shell: ShellKind::default(),
            max_sessions: 10,
            term: "xterm-256color".to_string(),
            cwd: None,
            max_log_bytes: 0,
            pumps: PumpConfig::default(),
        }
    }
}

/// Lifecycle notifications emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was registered.
    Created { session_id: SessionId, pid: u32 },
    /// A session was removed from the registry.
    Closed { session_id: SessionId, reason: String },
}

struct RegistryInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Serializes insert/remove so limit checks and teardown never interleave.
    mutation: Mutex<()>,
    config: RegistryConfig,
    events: broadcast::Sender<SessionEvent>,
}

/// Thread-safe session registry using DashMap.
///
/// Lookups and buffer operations on different sessions never contend on the
/// same lock. Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Creates a registry with default settings.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Creates a registry with the given settings.
    pub fn with_config(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                mutation: Mutex::new(()),
                config,
                events,
            }),
        }
    }

    /// Returns the registry settings.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Creates and registers a new session.
    ///
    /// Spawning happens synchronously; the pumps start on their own threads.
    /// A shell kind outside the allow-list is replaced with the configured
    /// default and reported through `shell_substituted`.
    pub fn create(&self, request: &SessionCreate) -> Result<SessionCreated, SessionError> {
        let size = request
            .size()
            .map_err(|_| SessionError::InvalidDimensions {
                cols: request.cols,
                rows: request.rows,
            })?;

        let config = &self.inner.config;
        if self.count() >= config.max_sessions {
            return Err(SessionError::LimitReached(config.max_sessions));
        }

        let (shell, shell_substituted) = ShellKind::resolve(&request.shell, config.default_shell);

        let session = Arc::new(Session::spawn(SpawnOptions {
            name: request.name.clone(),
            workspace: request.workspace.clone(),
            shell,
            size,
            term: config.term.clone(),
            cwd: config.cwd.clone(),
            max_log_bytes: config.max_log_bytes,
        })?);

        let session_id = session.id().clone();
        let pid = session.pid();

        {
            let _guard = lock(&self.inner.mutation);
            if self.inner.sessions.len() >= config.max_sessions {
                return Err(SessionError::LimitReached(config.max_sessions));
            }
            self.inner
                .sessions
                .insert(session_id.clone(), Arc::clone(&session));
        }

        let weak_registry = Arc::downgrade(&self.inner);
        let on_exit: pump::ExitHook = Box::new(move |id: &SessionId, exit: &PumpExit| {
            let Some(inner) = Weak::upgrade(&weak_registry) else {
                return;
            };
            let registry = SessionRegistry { inner };
            let reason = match exit {
                PumpExit::Failed(e) => format!("I/O error: {e}"),
                _ => "shell exited".to_string(),
            };
            let Ok(session) = registry.get(id) else {
                return;
            };
            session.mark_exited();
            // An attached relay delivers the remaining output, then destroys.
            if session.has_consumer() {
                tracing::debug!(session_id = %id, reason = %reason, "Shell exited; awaiting final drain");
                return;
            }
            drop(session);
            registry.remove(id, &reason);
        });

        if let Err(e) = pump::start(&session, config.pumps, on_exit) {
            drop(session);
            self.destroy(&session_id);
            return Err(SessionError::SpawnFailed(format!("failed to start pumps: {e}")));
        }
        session.mark_running();

        tracing::info!(
            session_id = %session_id,
            pid = pid,
            name = %request.name,
            workspace = %request.workspace,
            shell = %shell,
            cols = size.cols(),
            rows = size.rows(),
            "Created new session"
        );
        let _ = self.inner.events.send(SessionEvent::Created {
            session_id: session_id.clone(),
            pid,
        });

        Ok(SessionCreated {
            session_id,
            name: request.name.clone(),
            pid,
            shell: shell.to_string(),
            shell_substituted,
        })
    }

    /// Looks up a session.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Marks a relay as attached to a session.
    ///
    /// While attached, a shell exit leaves the session registered so the relay
    /// can drain the last output before destroying it.
    pub fn attach_consumer(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self.get(session_id)?;
        session.set_consumer(true);
        Ok(session)
    }

    /// Appends bytes to a session's input queue.
    pub fn write(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.get(session_id)?.enqueue_input(data);
        Ok(())
    }

    /// Takes all pending output of a session.
    pub fn drain_output(&self, session_id: &str) -> Result<Vec<u8>, SessionError> {
        Ok(self.get(session_id)?.drain_output())
    }

    /// Resizes a session's terminal.
    pub fn resize(&self, session_id: &str, size: TerminalSize) -> Result<(), SessionError> {
        self.get(session_id)?.resize(size)
    }

    /// Returns a session's full transcript without consuming it.
    pub fn log(&self, session_id: &str) -> Result<String, SessionError> {
        Ok(self.get(session_id)?.log_text())
    }

    /// Destroys a session.
    ///
    /// Idempotent: returns `false` when the session was already gone. Blocks
    /// while the shell is signalled and reaped.
    pub fn destroy(&self, session_id: &str) -> bool {
        self.remove(session_id, "destroyed")
    }

    fn remove(&self, session_id: &str, reason: &str) -> bool {
        let removed = {
            let _guard = lock(&self.inner.mutation);
            self.inner.sessions.remove(session_id)
        };

        let Some((id, session)) = removed else {
            return false;
        };

        session.terminate();
        drop(session);

        tracing::info!(session_id = %id, reason = reason, "Session removed");
        let _ = self.inner.events.send(SessionEvent::Closed {
            session_id: id,
            reason: reason.to_string(),
        });
        true
    }

    /// Destroys every session.
    pub fn destroy_all(&self) -> usize {
        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.destroy(id)).count()
    }

    /// Lists all registered sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Checks if a session is registered.
    pub fn exists(&self, session_id: &str) -> bool {
        self.inner.sessions.contains_key(session_id)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
