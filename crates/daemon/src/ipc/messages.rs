//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types exchanged between the
//! CLI and the daemon over the Unix Domain Socket. Session payloads reuse the
//! protocol crate's types so the CLI and any other consumer agree on shape.

use protocol::{SessionCreate, SessionCreated, SessionSummary};
use serde::{Deserialize, Serialize};

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// Create a new shell session.
    CreateSession(SessionCreate),
    /// List all active sessions.
    ListSessions,
    /// Fetch the full transcript of a session without draining it.
    SessionLog {
        /// The session to read.
        session_id: String,
    },
    /// Destroy a session.
    KillSession {
        /// The unique identifier of the session to kill.
        session_id: String,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of active sessions.
        session_count: usize,
        /// Address consumers attach to, if the relay listener is up.
        relay_addr: Option<String>,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// A session was created.
    SessionCreated(SessionCreated),
    /// List of active sessions.
    Sessions {
        /// Information about each active session.
        sessions: Vec<SessionSummary>,
    },
    /// A session's transcript.
    SessionLog {
        session_id: String,
        log: String,
    },
    /// Confirmation that a session was killed.
    SessionKilled {
        /// The ID of the killed session.
        session_id: String,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::SessionState;

    #[test]
    fn test_unit_requests_are_bare_strings() {
        assert_eq!(serde_json::to_string(&IpcRequest::Ping).unwrap(), r#""Ping""#);
        assert_eq!(serde_json::to_string(&IpcRequest::Stop).unwrap(), r#""Stop""#);
        assert_eq!(
            serde_json::to_string(&IpcRequest::ListSessions).unwrap(),
            r#""ListSessions""#
        );
    }

    #[test]
    fn test_create_session_request_fills_defaults() {
        let request: IpcRequest =
            serde_json::from_str(r#"{"CreateSession":{"name":"build"}}"#).unwrap();
        match request {
            IpcRequest::CreateSession(create) => {
                assert_eq!(create.name, "build");
                assert_eq!(create.workspace, "ws1");
                assert_eq!(create.shell, "bash");
                assert_eq!((create.cols, create.rows), (80, 24));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_session_log_request_shape() {
        let json = serde_json::to_string(&IpcRequest::SessionLog {
            session_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"SessionLog":{"session_id":"abc"}}"#);
    }

    #[test]
    fn test_status_response_without_relay() {
        let response = IpcResponse::Status {
            running: true,
            uptime_secs: 3600,
            session_count: 2,
            relay_addr: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""relay_addr":null"#));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_sessions_response_carries_summaries() {
        let response = IpcResponse::Sessions {
            sessions: vec![SessionSummary {
                id: "session-1".to_string(),
                name: "Terminal".to_string(),
                workspace: "ws1".to_string(),
                shell: "bash".to_string(),
                pid: 4242,
                cols: 80,
                rows: 24,
                created_at: 1_700_000_000,
                state: SessionState::Running,
            }],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""state":"running""#));

        let deserialized: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, response);
    }

    #[test]
    fn test_error_response() {
        let response = IpcResponse::Error {
            message: "session not found: x".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"Error":{"message":"session not found: x"}}"#);
    }
}
