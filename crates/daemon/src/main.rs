//! ptyrelay daemon
//!
//! Hosts shell sessions on pseudo-terminals and relays them to WebSocket
//! consumers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{
    get_daemon_pid, get_pid_file_path, get_socket_path, is_daemon_running, IpcClient, IpcResponse,
};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::{SessionCreate, SessionSummary};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Timeout for a single IPC round trip.
const IPC_TIMEOUT: Duration = Duration::from_secs(5);

/// ptyrelay daemon - PTY sessions relayed over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "ptyrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the ptyrelay daemon in the foreground
    Start {
        /// Override the relay listen address
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage shell sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all active sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Create a new session
    Create {
        /// Display name
        #[arg(long, short)]
        name: Option<String>,

        /// Workspace tag
        #[arg(long, short)]
        workspace: Option<String>,

        /// Shell to run (bash, zsh, fish, sh)
        #[arg(long, short)]
        shell: Option<String>,

        /// Terminal columns
        #[arg(long)]
        cols: Option<u16>,

        /// Terminal rows
        #[arg(long)]
        rows: Option<u16>,
    },

    /// Print a session's output transcript
    Log {
        /// Session ID
        session_id: String,
    },

    /// Kill an active session
    Kill {
        /// Session ID to kill
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    if let Commands::Start {
        listen: Some(addr), ..
    } = &cli.command
    {
        config.relay.listen_addr = addr.clone();
    }

    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    if let Some(config_path) = &cli.config {
        tracing::debug!(path = %config_path.display(), "Using config file");
    }

    match cli.command {
        Commands::Start { .. } => {
            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  ptyrelay-daemon stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_foreground(&mut orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::debug!(force = force, "Stopping daemon");

            let result = if force {
                force_stop_daemon()
            } else {
                graceful_stop_daemon(timeout).await
            };
            match result {
                Ok(()) => {
                    println!("Daemon stopped successfully");
                    std::process::exit(0);
                }
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: ptyrelay-daemon stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match query_status().await {
            Ok(IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                relay_addr,
            }) => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "stopped" }
                );
                println!("  Uptime:   {}", format_duration(uptime_secs));
                println!("  Sessions: {}", session_count);
                if let Some(addr) = relay_addr {
                    println!("  Relay:    ws://{}/ws/<session-id>", addr);
                }
                std::process::exit(0);
            }
            Ok(other) => {
                eprintln!("Error: {}", unexpected(other));
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Daemon is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => run_sessions_command(cmd, &config).await,
    }

    Ok(())
}

/// Initialize tracing from the config, letting `RUST_LOG` win when set.
///
/// Returns the appender guard when logging to a file; it must live until exit.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match &config.daemon.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(&directory)?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

async fn run_sessions_command(cmd: SessionsCommands, config: &Config) {
    match sessions_command(cmd, config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn sessions_command(cmd: SessionsCommands, config: &Config) -> anyhow::Result<()> {
    let mut client = connect().await?;

    match cmd {
        SessionsCommands::List { json } => match client.list_sessions().await? {
            IpcResponse::Sessions { sessions } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        },
        SessionsCommands::Create {
            name,
            workspace,
            shell,
            cols,
            rows,
        } => {
            let defaults = SessionCreate::default();
            let request = SessionCreate {
                name: name.unwrap_or(defaults.name),
                workspace: workspace.unwrap_or(defaults.workspace),
                shell: shell.unwrap_or_else(|| config.session.default_shell.clone()),
                cols: cols.unwrap_or(config.session.default_cols),
                rows: rows.unwrap_or(config.session.default_rows),
            };
            match client.create_session(request).await? {
                IpcResponse::SessionCreated(created) => {
                    println!("{}", created.session_id);
                    if created.shell_substituted {
                        eprintln!("Requested shell not allowed; started {}", created.shell);
                    }
                    if let Ok(IpcResponse::Status {
                        relay_addr: Some(addr),
                        ..
                    }) = client.status().await
                    {
                        eprintln!("Attach at ws://{}/ws/{}", addr, created.session_id);
                    }
                    Ok(())
                }
                other => Err(unexpected(other)),
            }
        }
        SessionsCommands::Log { session_id } => match client.session_log(session_id).await? {
            IpcResponse::SessionLog { log, .. } => {
                print!("{}", log);
                Ok(())
            }
            other => Err(unexpected(other)),
        },
        SessionsCommands::Kill { session_id } => {
            match client.kill_session(session_id.clone()).await? {
                IpcResponse::SessionKilled { .. } => {
                    println!("Session {} killed", session_id);
                    Ok(())
                }
                other => Err(unexpected(other)),
            }
        }
    }
}

/// Connect to the running daemon.
async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), IPC_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

async fn query_status() -> anyhow::Result<IpcResponse> {
    let mut client = connect().await?;
    client
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query status: {}", e))
}

/// Turn a response that is not the one a command expects into an error.
fn unexpected(response: IpcResponse) -> anyhow::Error {
    match response {
        IpcResponse::Error { message } => anyhow::anyhow!("{}", message),
        _ => anyhow::anyhow!("Unexpected response from daemon"),
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);
    let name_width = sessions
        .iter()
        .map(|s| s.name.chars().count())
        .max()
        .unwrap_or(4)
        .clamp(4, 24);

    println!(
        "{:<id_width$}  {:<name_width$}  {:<5}  {:>7}  {:>7}  {:>10}",
        "ID",
        "NAME",
        "SHELL",
        "PID",
        "SIZE",
        "CREATED",
        id_width = id_width,
        name_width = name_width
    );
    println!("{}", "-".repeat(id_width + name_width + 40));

    for session in sessions {
        println!(
            "{:<id_width$}  {:<name_width$}  {:<5}  {:>7}  {:>7}  {:>10}",
            session.id,
            truncate_str(&session.name, name_width),
            session.shell,
            session.pid,
            format!("{}x{}", session.cols, session.rows),
            format_relative_time(session.created_at),
            id_width = id_width,
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC, then wait for it to exit.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    match client.stop().await {
        Ok(IpcResponse::Stopping) => {}
        Ok(IpcResponse::Error { message }) => anyhow::bail!("Daemon refused to stop: {}", message),
        Ok(_) => anyhow::bail!("Unexpected response from daemon"),
        Err(e) => anyhow::bail!("Failed to send stop request: {}", e),
    }
    drop(client);

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }

        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}

/// Force stop the daemon using SIGKILL.
///
/// Reads the daemon PID from the PID file and sends SIGKILL. Sessions die
/// with the daemon because each shell is a child on its own terminal.
fn force_stop_daemon() -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = get_pid_file_path();

    let pid = get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("Daemon PID file not found - is the daemon running?"))?;
    let raw = i32::try_from(pid).map_err(|_| anyhow::anyhow!("Invalid PID in file: {}", pid))?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(get_socket_path());

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon in the foreground until a signal or a stop request.
async fn run_foreground(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionCreated { session_id, pid } => {
                    tracing::info!(session_id = %session_id, pid = pid, "Session created");
                }
                OrchestratorEvent::SessionClosed { session_id, reason } => {
                    tracing::info!(session_id = %session_id, reason = %reason, "Session closed");
                }
                OrchestratorEvent::ConsumerAttached { session_id, peer } => {
                    tracing::info!(session_id = %session_id, peer = %peer, "Consumer attached");
                }
                OrchestratorEvent::ConsumerDetached { session_id, reason } => {
                    tracing::info!(session_id = %session_id, reason = %reason, "Consumer detached");
                }
            }
        }
    });

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = orchestrator.stop_requested() => {}
    }

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
