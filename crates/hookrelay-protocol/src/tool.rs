//! Tool server types: how to launch one, what it offers, and call results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ServerName;

/// How to launch a tool server subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerDescriptor {
    pub name: ServerName,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Layered on top of the inherited process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

impl ToolServerDescriptor {
    pub fn new(name: impl Into<ServerName>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            description: String::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A tool as declared by a server in its `tools/list` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolInvocationResult {
    pub fn succeeded(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error_message: None,
        }
    }

    /// The server answered, but the tool itself reported an error.
    pub fn failed(message: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            success: false,
            payload,
            error_message: Some(message.into()),
        }
    }

    /// Concatenated `text` items of an MCP-style `content` array.
    pub fn text_content(&self) -> Option<String> {
        let items = self.payload.as_ref()?.get("content")?.as_array()?;
        let text: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }
}

/// Registry view of one tool server for the management surface.
///
/// Carries the names of the configured environment variables, never their
/// values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerStatus {
    pub name: ServerName,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_keys: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// `serverInfo` from the handshake of the live connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ToolServerStatus {
    pub fn new(descriptor: &ToolServerDescriptor, state: ConnectionState) -> Self {
        Self {
            name: descriptor.name.clone(),
            command: descriptor.command.clone(),
            args: descriptor.args.clone(),
            env_keys: descriptor.env.keys().cloned().collect(),
            description: descriptor.description.clone(),
            state,
            pid: None,
            server_info: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_defaults_optional_fields() {
        let descriptor: ToolServerDescriptor =
            serde_json::from_value(json!({ "name": "rest_api", "command": "node" })).unwrap();
        assert!(descriptor.args.is_empty());
        assert!(descriptor.env.is_empty());
        assert_eq!(descriptor.name.as_str(), "rest_api");
    }

    #[test]
    fn text_content_joins_text_items() {
        let result = ToolInvocationResult::succeeded(json!({
            "content": [
                { "type": "text", "text": "first" },
                { "type": "image", "data": "..." },
                { "type": "text", "text": "second" }
            ]
        }));
        assert_eq!(result.text_content().as_deref(), Some("first\nsecond"));
        assert_eq!(ToolInvocationResult::failed("boom", None).text_content(), None);
    }

    #[test]
    fn status_lists_env_keys_without_values() {
        let descriptor = ToolServerDescriptor::new("rest_api", "node")
            .with_env("HUBSPOT_API_KEY", "pat-na1-secret")
            .with_env("API_BASE_URL", "https://api.example.com");
        let status = ToolServerStatus::new(&descriptor, ConnectionState::Disconnected);

        assert_eq!(status.env_keys, vec!["API_BASE_URL", "HUBSPOT_API_KEY"]);
        let serialized = serde_json::to_string(&status).unwrap();
        assert!(!serialized.contains("pat-na1-secret"));
        assert!(!serialized.contains("api.example.com"));
    }
}
