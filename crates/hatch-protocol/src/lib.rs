//! Wire protocol between hatch and its spawner helpers.
//!
//! Helpers are long-lived processes that produce other processes on request:
//! a framework helper starts application helpers, an application helper
//! starts workers. Messages are newline-delimited JSON, one object per line,
//! tagged by `type`. The framework helper speaks over its stdin/stdout; an
//! application helper listens on a Unix socket whose path the framework
//! helper reports back.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Environment variable carrying the socket path a worker should listen on.
pub const LISTEN_SOCKET_ENV: &str = "HATCH_LISTEN_SOCKET";

/// Environment variable carrying the deployment environment name.
pub const ENVIRONMENT_ENV: &str = "HATCH_ENV";

// ============================================================================
// Messages
// ============================================================================

/// Message sent from hatch to a helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    /// Liveness check.
    Ping,

    /// Ask a framework helper to start an application helper.
    StartAppSpawner {
        /// Application root directory.
        app_root: String,
        /// Deployment environment (e.g. "production").
        environment: String,
        /// Extra environment variables for the application helper and the
        /// workers it starts.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Command line the application helper runs for each worker.
        worker_command: Vec<String>,
        /// Unix socket the application helper must listen on.
        control_socket: String,
        /// User to run the application helper as (None = unchanged).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<u32>,
        /// Group to run the application helper as (None = unchanged).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gid: Option<u32>,
    },

    /// Ask an application helper to start one worker.
    SpawnWorker {
        /// Socket path the worker should listen on.
        listen_socket: String,
    },

    /// Ask the helper to exit.
    Shutdown,
}

/// Message sent from a helper to hatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperResponse {
    /// First line written by a helper once it accepts requests.
    Ready {
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        control_socket: Option<String>,
    },

    /// Reply to `ping`.
    Pong,

    /// An application helper is up and listening.
    AppSpawnerStarted { pid: u32, control_socket: String },

    /// A worker was started.
    WorkerSpawned {
        pid: u32,
        listen_socket: String,
        #[serde(default)]
        using_abstract_namespace: bool,
    },

    /// Reply to `shutdown`, written just before the helper exits.
    ShuttingDown,

    /// The request failed.
    Error { message: String },
}

impl HelperResponse {
    /// Build an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Errors raised while reading or writing protocol lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write one message followed by a newline and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message. Blank lines are skipped; `None` means EOF.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_request_tagging() {
        let json = serde_json::to_value(HelperRequest::SpawnWorker {
            listen_socket: "/tmp/w.sock".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "spawn_worker");
        assert_eq!(json["listen_socket"], "/tmp/w.sock");

        let json = serde_json::to_value(HelperRequest::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping"}));
    }

    #[test]
    fn test_start_app_spawner_omits_unset_identity() {
        let json = serde_json::to_value(HelperRequest::StartAppSpawner {
            app_root: "/srv/app".to_string(),
            environment: "production".to_string(),
            env: BTreeMap::new(),
            worker_command: vec!["rackup".to_string()],
            control_socket: "/tmp/a.sock".to_string(),
            uid: None,
            gid: None,
        })
        .unwrap();
        assert!(json.get("uid").is_none());
        assert!(json.get("gid").is_none());
    }

    #[test]
    fn test_worker_spawned_defaults_namespace_flag() {
        let parsed: HelperResponse = serde_json::from_str(
            r#"{"type":"worker_spawned","pid":1234,"listen_socket":"/tmp/nonexistant.socket"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            HelperResponse::WorkerSpawned {
                pid: 1234,
                listen_socket: "/tmp/nonexistant.socket".to_string(),
                using_abstract_namespace: false,
            }
        );
    }

    #[tokio::test]
    async fn test_read_message_skips_blank_lines_and_reports_eof() {
        let input = b"\n\n{\"type\":\"pong\"}\n" as &[u8];
        let mut reader = BufReader::new(input);

        let first: Option<HelperResponse> = read_message(&mut reader).await.unwrap();
        assert_eq!(first, Some(HelperResponse::Pong));

        let second: Option<HelperResponse> = read_message(&mut reader).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_write_message_is_line_delimited() {
        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, &HelperResponse::ShuttingDown)
            .await
            .unwrap();
        assert_eq!(out, b"{\"type\":\"shutting_down\"}\n");
    }

    #[tokio::test]
    async fn test_read_message_rejects_garbage() {
        let input = b"not json\n" as &[u8];
        let mut reader = BufReader::new(input);
        let result: Result<Option<HelperRequest>, _> = read_message(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }
}
