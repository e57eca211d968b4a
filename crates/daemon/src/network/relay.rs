//! Relay loop bridging one WebSocket consumer to one session.
//!
//! Inbound messages are classified as resize control frames or raw
//! keystrokes. Outbound, the session's pending output is drained whenever the
//! output pump signals new data and on a short flush interval, then sent as
//! a single text message per drain. When the shell exits, the output it wrote
//! last is sent before the close frame. The session does not outlive its
//! consumer: when the loop ends for any reason the session is destroyed.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use protocol::{Inbound, OutputFramer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionError, SessionId, SessionRegistry};

/// Default interval between output flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that end a relay abnormally.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The WebSocket transport failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

/// Why a relay ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The consumer closed the connection.
    ConsumerClosed,
    /// The session went away (shell exited or destroyed elsewhere).
    SessionEnded,
    /// The daemon is shutting down.
    Shutdown,
}

impl RelayExit {
    /// Short description used in logs and events.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayExit::ConsumerClosed => "consumer closed",
            RelayExit::SessionEnded => "session ended",
            RelayExit::Shutdown => "daemon shutdown",
        }
    }
}

/// Relay timing.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub flush_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Runs the relay until the consumer disconnects, the session ends or
/// `shutdown` fires, then destroys the session.
pub async fn run_relay<S>(
    ws: WebSocketStream<S>,
    registry: SessionRegistry,
    session_id: SessionId,
    config: RelayConfig,
    shutdown: CancellationToken,
) -> Result<RelayExit, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = relay(ws, &registry, &session_id, config, &shutdown).await;

    let destroy_registry = registry.clone();
    let destroy_id = session_id.clone();
    match tokio::task::spawn_blocking(move || destroy_registry.destroy(&destroy_id)).await {
        Ok(true) => tracing::debug!(session_id = %session_id, "Session destroyed after relay ended"),
        Ok(false) => {}
        Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Session teardown task failed"),
    }

    match &result {
        Ok(exit) => tracing::info!(session_id = %session_id, reason = exit.reason(), "Relay ended"),
        Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Relay failed"),
    }
    result
}

async fn relay<S>(
    ws: WebSocketStream<S>,
    registry: &SessionRegistry,
    session_id: &SessionId,
    config: RelayConfig,
    shutdown: &CancellationToken,
) -> Result<RelayExit, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Only the notifier is kept; the registry stays the sole owner of the session.
    let notifier = match registry.attach_consumer(session_id) {
        Ok(session) => session.output_notifier(),
        Err(_) => return Err(RelayError::SessionNotFound(session_id.clone())),
    };

    let (mut sink, mut stream) = ws.split();
    let mut framer = OutputFramer::new();
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(session_id = %session_id, "Relay attached");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(close_message(CloseCode::Away, "daemon shutting down")).await;
                return Ok(RelayExit::Shutdown);
            }
            message = stream.next() => {
                let data = match message {
                    Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                    Some(Ok(WsMessage::Binary(bytes))) => bytes,
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(RelayExit::ConsumerClosed),
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) => return Ok(RelayExit::ConsumerClosed),
                    Some(Err(e)) => return Err(e.into()),
                };
                if handle_inbound(registry, session_id, &data) {
                    continue;
                }
                // The session is gone; the drain below reports it and closes.
            }
            _ = notifier.notified() => {}
            _ = ticker.tick() => {}
        }

        let Ok(session) = registry.get(session_id) else {
            close_ended(&mut sink, &mut framer).await;
            return Ok(RelayExit::SessionEnded);
        };
        // Read before draining so the final drain holds all of the shell's output.
        let exited = session.has_exited();
        let bytes = session.drain_output();
        drop(session);

        if let Some(text) = framer.push(&bytes) {
            sink.send(WsMessage::Text(text)).await?;
        }
        if exited {
            tracing::debug!(session_id = %session_id, "Shell exited; final output sent");
            close_ended(&mut sink, &mut framer).await;
            return Ok(RelayExit::SessionEnded);
        }
    }
}

/// Flushes any buffered partial character and sends a normal close frame.
async fn close_ended<K>(sink: &mut K, framer: &mut OutputFramer)
where
    K: Sink<WsMessage> + Unpin,
{
    if let Some(text) = framer.finish() {
        let _ = sink.send(WsMessage::Text(text)).await;
    }
    let _ = sink.send(close_message(CloseCode::Normal, "session ended")).await;
}

/// Applies one inbound message. Returns `false` when the session is gone.
fn handle_inbound(registry: &SessionRegistry, session_id: &SessionId, data: &[u8]) -> bool {
    match Inbound::classify(data) {
        Inbound::Resize(size) => match registry.resize(session_id, size) {
            Ok(()) => true,
            Err(SessionError::NotFound(_)) => false,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Ignoring failed resize");
                true
            }
        },
        Inbound::Input(bytes) => registry.write(session_id, &bytes).is_ok(),
    }
}

fn close_message(code: CloseCode, reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
