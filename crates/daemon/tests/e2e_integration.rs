//! End-to-end integration tests for ptyrelay.
//!
//! These tests verify complete flows work correctly:
//! - Session lifecycle against real shells
//! - Relaying a session over a WebSocket
//! - Daemon startup, IPC control and shutdown

use std::time::Duration;

use daemon::config::Config;
use daemon::ipc::{IpcClient, IpcResponse};
use daemon::network::{run_relay, RelayConfig, RelayExit};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
use daemon::session::{RegistryConfig, SessionError, SessionRegistry, ShellKind};
use futures_util::{SinkExt, StreamExt};
use protocol::{ControlFrame, SessionCreate, TerminalSize};
use tempfile::TempDir;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

fn sh_registry() -> SessionRegistry {
    SessionRegistry::with_config(RegistryConfig {
        default_shell: ShellKind::Sh,
        ..RegistryConfig::default()
    })
}

fn sh_request() -> SessionCreate {
    SessionCreate {
        shell: "sh".to_string(),
        ..SessionCreate::default()
    }
}

/// Drains a session until `needle` appears, returning everything drained.
fn drain_until(registry: &SessionRegistry, id: &str, needle: &str) -> String {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut collected = Vec::new();
    while std::time::Instant::now() < deadline {
        collected.extend(registry.drain_output(id).unwrap());
        if String::from_utf8_lossy(&collected).contains(needle) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    String::from_utf8_lossy(&collected).into_owned()
}

fn create_test_orchestrator(temp_dir: &TempDir) -> DaemonOrchestrator {
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.relay.listen_addr = "127.0.0.1:0".to_string();
    config.session.default_shell = "sh".to_string();
    DaemonOrchestrator::with_paths(
        config,
        temp_dir.path().join("daemon.sock"),
        temp_dir.path().join("daemon.pid"),
    )
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[test]
fn test_bash_session_echoes_input() {
    if which::which("bash").is_err() {
        eprintln!("bash not installed; skipping");
        return;
    }
    let registry = sh_registry();
    let created = registry
        .create(&SessionCreate {
            shell: "bash".to_string(),
            ..SessionCreate::default()
        })
        .unwrap();
    assert_eq!(created.shell, "bash");

    registry.write(&created.session_id, b"echo A\n").unwrap();
    let output = drain_until(&registry, &created.session_id, "A");
    assert!(output.contains('A'), "got: {output:?}");

    assert!(registry.destroy(&created.session_id));
}

#[test]
fn test_invalid_shell_falls_back_to_default() {
    let registry = sh_registry();
    let created = registry
        .create(&SessionCreate {
            shell: "totally-invalid".to_string(),
            ..SessionCreate::default()
        })
        .unwrap();
    assert!(created.shell_substituted);
    assert_eq!(created.shell, "sh");

    registry
        .write(&created.session_id, b"echo fallback_$((2+3))\n")
        .unwrap();
    let output = drain_until(&registry, &created.session_id, "fallback_5");
    assert!(output.contains("fallback_5"), "got: {output:?}");

    registry.destroy(&created.session_id);
}

#[test]
fn test_resize_is_visible_to_terminal_driver() {
    let registry = sh_registry();
    let id = registry.create(&sh_request()).unwrap().session_id;

    let size = TerminalSize::new(40, 10).unwrap();
    registry.resize(&id, size).unwrap();

    let session = registry.get(&id).unwrap();
    assert_eq!(session.size(), size);
    assert_eq!(session.driver_size().unwrap(), size);

    // The shell sees the same dimensions.
    registry.write(&id, b"stty size\n").unwrap();
    let output = drain_until(&registry, &id, "10 40");
    assert!(output.contains("10 40"), "got: {output:?}");

    drop(session);
    registry.destroy(&id);
}

#[test]
fn test_write_after_destroy_reports_not_found() {
    let registry = sh_registry();
    let id = registry.create(&sh_request()).unwrap().session_id;

    assert!(registry.destroy(&id));
    assert!(matches!(
        registry.write(&id, b"echo gone\n"),
        Err(SessionError::NotFound(ref missing)) if *missing == id
    ));
    assert!(matches!(registry.get(&id), Err(SessionError::NotFound(_))));
    assert!(!registry.destroy(&id));
}

#[test]
fn test_input_order_is_preserved() {
    let registry = sh_registry();
    let id = registry.create(&sh_request()).unwrap().session_id;

    // The terminal echoes the typed command, so only printf output matches.
    for i in 0..5 {
        registry
            .write(&id, format!("printf 'seq_%s\\n' {i}\n").as_bytes())
            .unwrap();
    }
    let output = drain_until(&registry, &id, "seq_4\r\n");

    let positions: Vec<usize> = (0..5)
        .map(|i| {
            output
                .find(&format!("seq_{i}\r\n"))
                .unwrap_or_else(|| panic!("seq_{i} missing from {output:?}"))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "got: {output:?}");

    registry.destroy(&id);
}

#[test]
fn test_log_is_concatenation_of_drains() {
    let registry = sh_registry();
    let id = registry.create(&sh_request()).unwrap().session_id;

    registry.write(&id, b"echo first_$((1))\n").unwrap();
    let mut drained = drain_until(&registry, &id, "first_1\r\n");
    registry.write(&id, b"echo second_$((2))\n").unwrap();
    drained.push_str(&drain_until(&registry, &id, "second_2\r\n"));

    std::thread::sleep(Duration::from_millis(100));
    drained.push_str(&String::from_utf8_lossy(&registry.drain_output(&id).unwrap()));

    let log = registry.log(&id).unwrap();
    assert_eq!(log, drained);

    registry.destroy(&id);
}

#[test]
fn test_term_is_exported_to_shell() {
    let registry = SessionRegistry::with_config(RegistryConfig {
        default_shell: ShellKind::Sh,
        term: "xterm-256color".to_string(),
        ..RegistryConfig::default()
    });
    let id = registry.create(&sh_request()).unwrap().session_id;

    registry.write(&id, b"echo term=$TERM\n").unwrap();
    let output = drain_until(&registry, &id, "term=xterm-256color\r\n");
    assert!(output.contains("term=xterm-256color"), "got: {output:?}");

    registry.destroy(&id);
}

#[test]
fn test_shell_exit_removes_session() {
    let registry = sh_registry();
    let id = registry.create(&sh_request()).unwrap().session_id;

    registry.write(&id, b"exit\n").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while registry.exists(&id) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!registry.exists(&id));
    assert!(matches!(
        registry.drain_output(&id),
        Err(SessionError::NotFound(_))
    ));
}

// =============================================================================
// Relay Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_relay_end_to_end_over_websocket() {
    let registry = sh_registry();
    let id = {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || registry.create(&sh_request()))
            .await
            .unwrap()
            .unwrap()
            .session_id
    };

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    let shutdown = CancellationToken::new();
    let relay = tokio::spawn(run_relay(
        server,
        registry.clone(),
        id.clone(),
        RelayConfig::default(),
        shutdown.clone(),
    ));

    let resize = ControlFrame::resize(TerminalSize::new(100, 30).unwrap())
        .to_json()
        .unwrap();
    client.send(Message::Text(resize)).await.unwrap();
    client
        .send(Message::Text("stty size; echo done_$((3*3))\n".to_string()))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut collected = String::new();
    while !collected.contains("done_9") {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => collected.push_str(&text),
            Ok(Some(Ok(_))) => {}
            _ => break,
        }
    }
    assert!(collected.contains("30 100"), "got: {collected:?}");
    assert!(collected.contains("done_9"), "got: {collected:?}");

    client.close(None).await.unwrap();
    let exit = timeout(Duration::from_secs(5), relay)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, RelayExit::ConsumerClosed);
    assert!(!registry.exists(&id));
}

// =============================================================================
// Daemon Tests
// =============================================================================

#[tokio::test]
async fn test_orchestrator_state_starts_stopped() {
    let temp_dir = TempDir::new().unwrap();
    let orchestrator = create_test_orchestrator(&temp_dir);

    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_daemon_serves_sessions_over_ipc_and_websocket() {
    let temp_dir = TempDir::new().unwrap();
    let mut orchestrator = create_test_orchestrator(&temp_dir);
    let mut events = orchestrator.subscribe();
    orchestrator.start().await.unwrap();

    let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
    let created = match client.create_session(sh_request()).await.unwrap() {
        IpcResponse::SessionCreated(created) => created,
        other => panic!("unexpected response: {other:?}"),
    };

    let addr = orchestrator.relay_addr().unwrap();
    let url = format!("ws://{}/ws/{}", addr, created.session_id);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text("echo via_ws_$((4*4))\n".to_string()))
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut collected = String::new();
    while !collected.contains("via_ws_16") {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => collected.push_str(&text),
            Ok(Some(Ok(_))) => {}
            _ => break,
        }
    }
    assert!(collected.contains("via_ws_16"), "got: {collected:?}");

    match client.session_log(created.session_id.clone()).await.unwrap() {
        IpcResponse::SessionLog { log, .. } => assert!(log.contains("via_ws_16")),
        other => panic!("unexpected response: {other:?}"),
    }

    // Disconnecting the consumer destroys the session.
    ws.close(None).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while orchestrator.registry().exists(&created.session_id) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!orchestrator.registry().exists(&created.session_id));

    orchestrator.stop().await.unwrap();

    let mut saw_created = false;
    let mut saw_attached = false;
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestratorEvent::SessionCreated { session_id, .. } => {
                saw_created |= session_id == created.session_id
            }
            OrchestratorEvent::ConsumerAttached { session_id, .. } => {
                saw_attached |= session_id == created.session_id
            }
            _ => {}
        }
    }
    assert!(saw_created);
    assert!(saw_attached);
}
