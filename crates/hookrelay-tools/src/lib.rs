//! Registry of external tool servers reached over stdio.
//!
//! Each registered name maps to at most one live subprocess speaking
//! newline-delimited JSON-RPC (MCP stdio convention). The registry is an owned
//! service: create one, share it by cloning, and call
//! [`ToolClientRegistry::disconnect_all`] on shutdown.

mod connection;
mod registry;
mod transport;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use hookrelay_protocol::{ServerName, ToolServerDescriptor};
use serde::Deserialize;

pub use connection::{ConnectionTimeouts, PROTOCOL_VERSION, ToolConnection};
pub use registry::{RegistryConfig, ToolClientRegistry};

#[derive(Debug, Deserialize)]
struct ServerFile {
    #[serde(default)]
    servers: BTreeMap<String, ServerFileEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerFileEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    description: String,
}

/// Parse `{ "servers": { "<name>": { command, args, env, description } } }`.
pub fn parse_descriptors(raw: &str) -> Result<Vec<ToolServerDescriptor>> {
    let file: ServerFile = serde_json::from_str(raw).context("invalid tool server file")?;
    Ok(file
        .servers
        .into_iter()
        .map(|(name, entry)| ToolServerDescriptor {
            name: ServerName::from(name),
            command: entry.command,
            args: entry.args,
            env: entry.env,
            description: entry.description,
        })
        .collect())
}

pub async fn load_descriptors(path: &Path) -> Result<Vec<ToolServerDescriptor>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed reading tool server file {path:?}"))?;
    parse_descriptors(&raw).with_context(|| format!("in {path:?}"))
}
