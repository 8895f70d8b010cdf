//! Error taxonomy for the relay.

use thiserror::Error;

/// Failures reported to the webhook caller. Sink and tool failures never
/// reach it; they are recorded in the dispatch report instead.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("malformed envelope: {0}")]
    Parse(String),
}

/// Failures talking to a tool server. Never retried by the registry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("tool server not registered: {0}")]
    UnknownServer(String),
    #[error("failed to spawn tool server {server}: {message}")]
    Spawn { server: String, message: String },
    #[error("handshake with tool server {server} failed: {message}")]
    Handshake { server: String, message: String },
    #[error("transport failure on tool server {server}: {message}")]
    Transport { server: String, message: String },
    #[error("tool server {server} did not answer {method} within {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },
    #[error("call to tool server {server} cancelled by disconnect")]
    Cancelled { server: String },
}

impl ConnectionError {
    pub fn server(&self) -> &str {
        match self {
            Self::UnknownServer(server) => server,
            Self::Spawn { server, .. }
            | Self::Handshake { server, .. }
            | Self::Transport { server, .. }
            | Self::Timeout { server, .. }
            | Self::Cancelled { server } => server,
        }
    }
}

/// A downstream sink call failed. Isolated per sink by the dispatcher.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink {sink} request failed: {message}")]
    Request { sink: String, message: String },
    #[error("sink {sink} timed out after {timeout_ms}ms")]
    Timeout { sink: String, timeout_ms: u64 },
    #[error("sink {sink} panicked: {message}")]
    Panicked { sink: String, message: String },
    #[error(transparent)]
    Tool(#[from] ConnectionError),
}

impl SinkError {
    pub fn request(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            sink: sink.into(),
            message: message.into(),
        }
    }
}
