//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry and runs the two outer surfaces: the WebSocket relay listener for
//! consumers and the IPC server for the CLI.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{
    get_pid_file_path, get_socket_path, remove_pid_file, write_pid_file, IpcConnection, IpcError,
    IpcRequest, IpcResponse, IpcServer,
};
use crate::network::{RelayEvent, RelayListener};
use crate::session::{SessionError, SessionEvent, SessionRegistry};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding sockets.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A session was created.
    SessionCreated { session_id: String, pid: u32 },
    /// A session was removed.
    SessionClosed { session_id: String, reason: String },
    /// A consumer attached to a session.
    ConsumerAttached { session_id: String, peer: SocketAddr },
    /// A consumer detached from a session.
    ConsumerDetached { session_id: String, reason: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: SessionRegistry,
    socket_path: PathBuf,
    pid_path: PathBuf,
    relay_addr: Option<SocketAddr>,
    /// Cancelled when the daemon shuts down; every task observes it.
    shutdown_token: CancellationToken,
    /// Cancelled when a CLI client asks the daemon to stop.
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator using the default socket and PID
    /// file locations.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_paths(config, get_socket_path(), get_pid_file_path()))
    }

    /// Creates an orchestrator with explicit socket and PID file paths.
    pub fn with_paths(config: Config, socket_path: PathBuf, pid_path: PathBuf) -> Self {
        let registry = SessionRegistry::with_config(config.registry_config());
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            socket_path,
            pid_path,
            relay_addr: None,
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon: writes the PID file, binds the IPC socket and the
    /// relay listener, and spawns their tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
            self.stop_requested = CancellationToken::new();
        }

        if let Err(e) = self.start_subsystems().await {
            self.shutdown_token.cancel();
            for task in self.tasks.drain(..) {
                task.abort();
            }
            let _ = std::fs::remove_file(&self.socket_path);
            remove_pid_file(&self.pid_path);
            self.relay_addr = None;
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn start_subsystems(&mut self) -> Result<()> {
        write_pid_file(&self.pid_path)
            .with_context(|| format!("Failed to write PID file: {}", self.pid_path.display()))?;

        let ipc_server = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", self.socket_path.display()))?;
        info!(path = %self.socket_path.display(), "IPC server listening");

        let listener = RelayListener::bind(
            &self.config.relay.listen_addr,
            self.registry.clone(),
            self.config.relay_config(),
        )
        .await
        .with_context(|| format!("Failed to bind relay listener: {}", self.config.relay.listen_addr))?;
        let relay_addr = listener.local_addr()?;
        self.relay_addr = Some(relay_addr);
        info!(addr = %relay_addr, "Relay listening on ws://{}/ws/{{session_id}}", relay_addr);

        self.spawn_event_forwarders(listener.subscribe());

        self.tasks
            .push(tokio::spawn(listener.run(self.shutdown_token.clone())));

        let context = Arc::new(IpcContext {
            registry: self.registry.clone(),
            started_at: Instant::now(),
            relay_addr: Some(relay_addr.to_string()),
            stop_requested: self.stop_requested.clone(),
        });
        self.tasks.push(tokio::spawn(run_ipc_server(
            ipc_server,
            context,
            self.shutdown_token.clone(),
        )));

        Ok(())
    }

    fn spawn_event_forwarders(&mut self, mut relay_events: broadcast::Receiver<RelayEvent>) {
        let mut session_events = self.registry.subscribe();
        let event_tx = self.event_tx.clone();
        let token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = session_events.recv() => match event {
                        Ok(SessionEvent::Created { session_id, pid }) => {
                            OrchestratorEvent::SessionCreated { session_id, pid }
                        }
                        Ok(SessionEvent::Closed { session_id, reason }) => {
                            OrchestratorEvent::SessionClosed { session_id, reason }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Session event stream lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = relay_events.recv() => match event {
                        Ok(RelayEvent::Attached { session_id, peer }) => {
                            OrchestratorEvent::ConsumerAttached { session_id, peer }
                        }
                        Ok(RelayEvent::Detached { session_id, reason }) => {
                            OrchestratorEvent::ConsumerDetached { session_id, reason }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Relay event stream lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let _ = event_tx.send(event);
            }
        }));
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Cancels every task, destroys all sessions and removes the socket and
    /// PID file.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Daemon task ended abnormally");
            }
        }

        let registry = self.registry.clone();
        let destroyed = tokio::task::spawn_blocking(move || registry.destroy_all())
            .await
            .context("Session teardown task failed")?;
        debug!(count = destroyed, "Destroyed remaining sessions");

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove IPC socket");
            }
        }
        remove_pid_file(&self.pid_path);
        self.relay_addr = None;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Resolves once a CLI client has requested shutdown.
    pub async fn stop_requested(&self) {
        self.stop_requested.cancelled().await
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Address of the relay listener while running.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_addr
    }

    /// Path of the IPC socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

/// State shared by IPC connection handlers.
struct IpcContext {
    registry: SessionRegistry,
    started_at: Instant,
    relay_addr: Option<String>,
    stop_requested: CancellationToken,
}

impl IpcContext {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.registry.count(),
                relay_addr: self.relay_addr.clone(),
            },
            IpcRequest::Stop => IpcResponse::Stopping,
            IpcRequest::CreateSession(create) => {
                let registry = self.registry.clone();
                match tokio::task::spawn_blocking(move || registry.create(&create)).await {
                    Ok(Ok(created)) => IpcResponse::SessionCreated(created),
                    Ok(Err(e)) => error_response(e),
                    Err(e) => IpcResponse::Error {
                        message: format!("session creation task failed: {e}"),
                    },
                }
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.registry.list(),
            },
            IpcRequest::SessionLog { session_id } => match self.registry.log(&session_id) {
                Ok(log) => IpcResponse::SessionLog { session_id, log },
                Err(e) => error_response(e),
            },
            IpcRequest::KillSession { session_id } => {
                let registry = self.registry.clone();
                let id = session_id.clone();
                match tokio::task::spawn_blocking(move || registry.destroy(&id)).await {
                    Ok(true) => IpcResponse::SessionKilled { session_id },
                    Ok(false) => error_response(SessionError::NotFound(session_id)),
                    Err(e) => IpcResponse::Error {
                        message: format!("session teardown task failed: {e}"),
                    },
                }
            }
        }
    }
}

fn error_response(error: SessionError) -> IpcResponse {
    IpcResponse::Error {
        message: error.to_string(),
    }
}

async fn run_ipc_server(server: IpcServer, context: Arc<IpcContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("IPC server shutting down");
                break;
            }
            accepted = server.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(serve_connection(conn, Arc::clone(&context), shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
            },
        }
    }
}

async fn serve_connection(
    mut conn: IpcConnection,
    context: Arc<IpcContext>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = conn.read_request() => request,
        };

        let response = match request {
            Ok(Some(request)) => {
                debug!(request = ?request, "IPC request");
                context.handle(request).await
            }
            Ok(None) => break,
            Err(IpcError::Json(e)) => IpcResponse::Error {
                message: format!("invalid request: {e}"),
            },
            Err(e) => {
                debug!(error = %e, "IPC connection failed");
                break;
            }
        };

        let stopping = response == IpcResponse::Stopping;
        if let Err(e) = conn.send_response(&response).await {
            debug!(error = %e, "Failed to send IPC response");
            break;
        }
        if stopping {
            info!("Stop requested over IPC");
            context.stop_requested.cancel();
        }
    }
}
