use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hookrelay_protocol::{
    ConnectionError, ServerName, ToolDescriptor, ToolInvocationResult, ToolServerDescriptor,
    duration_ms,
};
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::transport::{LineTransport, RpcReply, forward_stderr};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone)]
pub struct ConnectionTimeouts {
    pub handshake: Duration,
    pub call: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            call: Duration::from_secs(30),
        }
    }
}

/// A live, handshaken tool server subprocess.
///
/// Calls are serialized through the transport lock: the protocol carries no
/// multiplexing, so only one request may be outstanding per connection.
pub struct ToolConnection {
    server: ServerName,
    pid: Option<u32>,
    server_info: Value,
    call_timeout: Duration,
    transport: Mutex<LineTransport>,
    child: Mutex<Child>,
    closed: watch::Sender<bool>,
    healthy: AtomicBool,
}

impl std::fmt::Debug for ToolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolConnection")
            .field("server", &self.server)
            .field("pid", &self.pid)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl ToolConnection {
    #[instrument(
        skip(descriptor, timeouts, client_name),
        fields(server = %descriptor.name, command = %descriptor.command, args_count = descriptor.args.len())
    )]
    pub(crate) async fn open(
        descriptor: &ToolServerDescriptor,
        timeouts: &ConnectionTimeouts,
        client_name: &str,
    ) -> Result<Self, ConnectionError> {
        let server = descriptor.name.clone();
        let spawn_error = |message: String| ConnectionError::Spawn {
            server: server.to_string(),
            message,
        };

        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|error| spawn_error(error.to_string()))?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin was not captured".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout was not captured".to_owned()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(server.clone(), stderr));
        }
        debug!(?pid, "tool server spawned");

        let mut transport = LineTransport::new(server.clone(), stdin, stdout);
        let handshake_error = |message: String| ConnectionError::Handshake {
            server: server.to_string(),
            message,
        };

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": format!("{client_name}-{server}"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let reply = timeout(timeouts.handshake, transport.request("initialize", params))
            .await
            .map_err(|_| {
                handshake_error(format!(
                    "no initialize answer within {}ms",
                    timeouts.handshake.as_millis()
                ))
            })?
            .map_err(|error| handshake_error(error.to_string()))?;

        let server_info = match reply {
            RpcReply::Result(result) => result,
            RpcReply::Error(error) => {
                return Err(handshake_error(format!(
                    "initialize rejected ({}): {}",
                    error.code, error.message
                )));
            }
        };

        transport
            .notify("notifications/initialized", json!({}))
            .await
            .map_err(|error| handshake_error(error.to_string()))?;

        let (closed, _) = watch::channel(false);
        Ok(Self {
            server,
            pid,
            server_info,
            call_timeout: timeouts.call,
            transport: Mutex::new(transport),
            child: Mutex::new(child),
            closed,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn server(&self) -> &ServerName {
        &self.server
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The server's `initialize` result (protocol version, capabilities, serverInfo).
    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    /// False once the transport broke or a call timed out; such a connection
    /// is never handed out again.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && !*self.closed.borrow()
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ConnectionError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page = match self.request("tools/list", params).await? {
                RpcReply::Result(page) => page,
                RpcReply::Error(error) => {
                    return Err(self.transport_error(format!(
                        "tools/list rejected ({}): {}",
                        error.code, error.message
                    )));
                }
            };

            let batch: Vec<ToolDescriptor> = page
                .get("tools")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|error| self.transport_error(format!("malformed tools/list answer: {error}")))?
                .unwrap_or_default();
            tools.extend(batch);

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            if cursor.is_none() {
                return Ok(tools);
            }
        }
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolInvocationResult, ConnectionError> {
        let params = json!({ "name": tool_name, "arguments": arguments });
        let result = match self.request("tools/call", params).await? {
            RpcReply::Result(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let answered = ToolInvocationResult::succeeded(result);
                if is_error {
                    let message = answered
                        .text_content()
                        .unwrap_or_else(|| format!("tool {tool_name} reported an error"));
                    ToolInvocationResult::failed(message, answered.payload)
                } else {
                    answered
                }
            }
            RpcReply::Error(error) => ToolInvocationResult::failed(
                format!("{} (code {})", error.message, error.code),
                error.data,
            ),
        };
        Ok(result)
    }

    async fn request(&self, method: &str, params: Value) -> Result<RpcReply, ConnectionError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(self.cancelled());
        }

        let mut transport = tokio::select! {
            guard = self.transport.lock() => guard,
            _ = closed.wait_for(|closed| *closed) => return Err(self.cancelled()),
        };
        if *closed.borrow() {
            return Err(self.cancelled());
        }

        let exchange = timeout(self.call_timeout, transport.request(method, params));
        tokio::select! {
            outcome = exchange => match outcome {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(error)) => {
                    self.healthy.store(false, Ordering::Release);
                    Err(error)
                }
                Err(_) => {
                    // The late answer would desynchronize the next exchange.
                    self.healthy.store(false, Ordering::Release);
                    Err(ConnectionError::Timeout {
                        server: self.server.to_string(),
                        method: method.to_owned(),
                        timeout_ms: duration_ms(self.call_timeout),
                    })
                }
            },
            _ = closed.wait_for(|closed| *closed) => Err(self.cancelled()),
        }
    }

    /// Wait up to `grace` for an outstanding call, then cancel whatever is
    /// still pending and kill the subprocess.
    #[instrument(skip(self), fields(server = %self.server, pid = ?self.pid))]
    pub(crate) async fn shutdown(&self, grace: Duration) {
        match timeout(grace, self.transport.lock()).await {
            Ok(_idle) => {
                self.closed.send_replace(true);
            }
            Err(_) => {
                warn!(
                    grace_ms = duration_ms(grace),
                    "tool call still in flight after grace period, cancelling"
                );
                self.closed.send_replace(true);
            }
        }

        let mut child = self.child.lock().await;
        if let Err(error) = child.start_kill() {
            debug!(%error, "tool server already exited");
        }
        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "tool server exited"),
            Ok(Err(error)) => warn!(%error, "failed waiting for tool server exit"),
            Err(_) => warn!("tool server did not exit after kill"),
        }
    }

    fn cancelled(&self) -> ConnectionError {
        ConnectionError::Cancelled {
            server: self.server.to_string(),
        }
    }

    fn transport_error(&self, message: String) -> ConnectionError {
        ConnectionError::Transport {
            server: self.server.to_string(),
            message,
        }
    }
}
