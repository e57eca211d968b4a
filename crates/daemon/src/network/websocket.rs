//! WebSocket listener that attaches consumers to sessions.
//!
//! Consumers connect to `ws://{listen_addr}/ws/{session_id}`. The session id
//! is checked during the HTTP upgrade: unknown sessions are refused with
//! `404 Not Found` and sessions that already have a consumer with
//! `409 Conflict`, so the upgrade only completes for a live, unattached
//! session.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use super::relay::{run_relay, RelayConfig};
use crate::session::{SessionId, SessionRegistry};

/// Default relay listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";

/// Path prefix for relay connections.
pub const RELAY_PATH_PREFIX: &str = "/ws/";

/// Consumer attach/detach notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Attached { session_id: SessionId, peer: SocketAddr },
    Detached { session_id: SessionId, reason: String },
}

/// Accepts WebSocket consumers and runs one relay per connection.
pub struct RelayListener {
    listener: TcpListener,
    registry: SessionRegistry,
    config: RelayConfig,
    attached: Arc<DashMap<SessionId, SocketAddr>>,
    events: broadcast::Sender<RelayEvent>,
}

impl RelayListener {
    /// Binds the listener.
    pub async fn bind(
        addr: &str,
        registry: SessionRegistry,
        config: RelayConfig,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (events, _) = broadcast::channel(64);

        tracing::info!(addr = %listener.local_addr()?, "Relay listener bound");

        Ok(Self {
            listener,
            registry,
            config,
            attached: Arc::new(DashMap::new()),
            events,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Subscribes to attach/detach events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Relay listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept relay connection");
                            continue;
                        }
                    };
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        self.registry.clone(),
                        self.config,
                        Arc::clone(&self.attached),
                        self.events.clone(),
                        shutdown.clone(),
                    ));
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: SessionRegistry,
    config: RelayConfig,
    attached: Arc<DashMap<SessionId, SocketAddr>>,
    events: broadcast::Sender<RelayEvent>,
    shutdown: CancellationToken,
) {
    let mut claimed: Option<SessionId> = None;

    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        let Some(id) = session_id_from_path(request.uri().path()) else {
            return Err(error_response(StatusCode::NOT_FOUND, "unknown path"));
        };
        if !registry.exists(id) {
            return Err(error_response(StatusCode::NOT_FOUND, "unknown session"));
        }
        match attached.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(error_response(StatusCode::CONFLICT, "session already attached"))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(peer);
                claimed = Some(id.to_string());
                Ok(response)
            }
        }
    })
    .await;

    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Relay handshake rejected");
            if let Some(id) = claimed {
                attached.remove(&id);
            }
            return;
        }
    };
    let Some(session_id) = claimed else {
        return;
    };

    tracing::info!(session_id = %session_id, peer = %peer, "Consumer attached");
    let _ = events.send(RelayEvent::Attached {
        session_id: session_id.clone(),
        peer,
    });

    let reason = match run_relay(ws, registry, session_id.clone(), config, shutdown).await {
        Ok(exit) => exit.reason().to_string(),
        Err(e) => e.to_string(),
    };

    attached.remove(&session_id);
    let _ = events.send(RelayEvent::Detached { session_id, reason });
}

/// Extracts the session id from a `/ws/{session_id}` request path.
pub fn session_id_from_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix(RELAY_PATH_PREFIX)?;
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id)
    }
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RegistryConfig, ShellKind};
    use futures_util::{SinkExt, StreamExt};
    use protocol::SessionCreate;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

    #[test]
    fn test_session_id_from_path() {
        assert_eq!(session_id_from_path("/ws/abc-123"), Some("abc-123"));
        assert_eq!(session_id_from_path("/ws/"), None);
        assert_eq!(session_id_from_path("/ws/a/b"), None);
        assert_eq!(session_id_from_path("/other/abc"), None);
        assert_eq!(session_id_from_path("/"), None);
    }

    async fn start_listener() -> (SessionRegistry, SocketAddr, broadcast::Receiver<RelayEvent>, CancellationToken) {
        let registry = SessionRegistry::with_config(RegistryConfig {
            default_shell: ShellKind::Sh,
            ..RegistryConfig::default()
        });
        let listener = RelayListener::bind("127.0.0.1:0", registry.clone(), RelayConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let events = listener.subscribe();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.run(shutdown.clone()));
        (registry, addr, events, shutdown)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_session_is_rejected() {
        let (_registry, addr, _events, shutdown) = start_listener().await;

        let err = connect_async(format!("ws://{addr}/ws/does-not-exist"))
            .await
            .unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            other => panic!("expected HTTP error, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_and_second_consumer_conflict() {
        let (registry, addr, mut events, shutdown) = start_listener().await;
        let id = registry.create(&SessionCreate::default()).unwrap().session_id;
        let url = format!("ws://{addr}/ws/{id}");

        let (mut first, _) = connect_async(&url).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, RelayEvent::Attached { session_id, .. } if session_id == id));

        let err = connect_async(&url).await.unwrap_err();
        match err {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::CONFLICT),
            other => panic!("expected HTTP error, got {other:?}"),
        }

        first
            .send(WsMessage::Text("echo listener_$((5+5))\n".to_string()))
            .await
            .unwrap();
        let mut collected = String::new();
        while !collected.contains("listener_10") {
            match timeout(Duration::from_secs(5), first.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => collected.push_str(&text),
                Ok(Some(Ok(_))) => {}
                _ => break,
            }
        }
        assert!(collected.contains("listener_10"));

        first.close(None).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            RelayEvent::Detached {
                session_id: id.clone(),
                reason: "consumer closed".to_string(),
            }
        );
        assert!(!registry.exists(&id));

        shutdown.cancel();
    }
}
