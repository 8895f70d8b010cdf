//! Newline-delimited JSON-RPC 2.0 over a child's stdin/stdout.
//!
//! One request is in flight at a time; the caller holds `&mut` for the whole
//! exchange. Responses are matched by id and anything else on stdout
//! (notifications, stray ids, non-JSON noise) is skipped.

use hookrelay_protocol::{ConnectionError, ServerName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum RpcReply {
    Result(Value),
    Error(RpcError),
}

pub struct LineTransport {
    server: ServerName,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl LineTransport {
    pub fn new(server: ServerName, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        }
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Result<RpcReply, ConnectionError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write(&RpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method,
            params: &params,
        })
        .await?;

        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(self.transport_error("tool server closed its stdout")),
                Err(error) => return Err(self.transport_error(format!("read failed: {error}"))),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let response: RpcResponse = match serde_json::from_str(line) {
                Ok(response) => response,
                Err(error) => {
                    warn!(server = %self.server, %error, "skipping non JSON-RPC line from tool server");
                    continue;
                }
            };

            if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
                debug!(server = %self.server, "skipping unrelated message from tool server");
                continue;
            }

            return Ok(match (response.error, response.result) {
                (Some(error), _) => RpcReply::Error(error),
                (None, result) => RpcReply::Result(result.unwrap_or(Value::Null)),
            });
        }
    }

    pub async fn notify(&mut self, method: &str, params: Value) -> Result<(), ConnectionError> {
        self.write(&RpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method,
            params: &params,
        })
        .await
    }

    async fn write(&mut self, request: &RpcRequest<'_>) -> Result<(), ConnectionError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|error| self.transport_error(format!("failed encoding request: {error}")))?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|error| self.transport_error(format!("write failed: {error}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|error| self.transport_error(format!("flush failed: {error}")))
    }

    fn transport_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::Transport {
            server: self.server.to_string(),
            message: message.into(),
        }
    }
}

/// Relay a tool server's stderr into our logs until it closes.
pub async fn forward_stderr(server: ServerName, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(server = %server, line = %line.trim_end(), "tool server stderr"),
            Ok(None) => break,
            Err(error) => {
                debug!(server = %server, %error, "tool server stderr closed");
                break;
            }
        }
    }
}
