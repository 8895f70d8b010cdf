//! CRM synchronisation through a registered tool server.
//!
//! The tool server is expected to expose `get_contact_by_phone`,
//! `create_contact` and `update_contact`.

use async_trait::async_trait;
use chrono::Utc;
use hookrelay_protocol::{
    MessageEvent, ServerName, Sink, SinkError, SinkOutcome, ToolInvocationResult,
};
use hookrelay_tools::ToolClientRegistry;
use serde_json::{Value, json};
use tracing::{debug, instrument};

pub struct ToolCrmSink {
    registry: ToolClientRegistry,
    server: ServerName,
}

impl ToolCrmSink {
    pub const NAME: &'static str = "crm";

    pub fn new(registry: ToolClientRegistry, server: impl Into<ServerName>) -> Self {
        Self {
            registry,
            server: server.into(),
        }
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<ToolInvocationResult, SinkError> {
        let result = self
            .registry
            .invoke(self.server.as_str(), tool, arguments)
            .await?;
        if result.success {
            Ok(result)
        } else {
            Err(SinkError::request(
                Self::NAME,
                format!(
                    "{tool} failed: {}",
                    result.error_message.as_deref().unwrap_or("no detail")
                ),
            ))
        }
    }
}

/// A lookup answered with at least one content item counts as a hit.
fn contact_found(result: &ToolInvocationResult) -> bool {
    let Some(payload) = &result.payload else {
        return false;
    };
    let has_content = payload
        .get("content")
        .and_then(Value::as_array)
        .is_some_and(|content| !content.is_empty());
    has_content || payload.get("structuredContent").is_some_and(|value| !value.is_null())
}

/// Contact id from `structuredContent.id`, or from a JSON text item.
fn contact_id(result: &ToolInvocationResult) -> Option<String> {
    let payload = result.payload.as_ref()?;
    let id_of = |value: &Value| match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    };
    if let Some(structured) = payload.get("structuredContent")
        && let Some(id) = id_of(structured)
    {
        return Some(id);
    }
    let text = result.text_content()?;
    let parsed: Value = serde_json::from_str(&text).ok()?;
    id_of(&parsed)
}

#[async_trait]
impl Sink for ToolCrmSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[instrument(skip(self, event), fields(sink = Self::NAME, server = %self.server))]
    async fn on_message(&self, event: &MessageEvent) -> Result<SinkOutcome, SinkError> {
        let last_message = event
            .provider_timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let lookup = self
            .call("get_contact_by_phone", json!({ "phone": event.from }))
            .await?;

        if contact_found(&lookup) {
            let Some(id) = contact_id(&lookup) else {
                return Ok(SinkOutcome::rejected(format!(
                    "contact for {} found without an id",
                    event.from
                )));
            };
            self.call(
                "update_contact",
                json!({
                    "id": id,
                    "data": {
                        "last_whatsapp_message": last_message,
                        "last_message_type": event.message_type,
                    },
                }),
            )
            .await?;
            debug!(contact = %id, "contact updated");
            Ok(SinkOutcome::delivered(format!("updated contact {id}")))
        } else {
            let created = self
                .call(
                    "create_contact",
                    json!({
                        "name": format!("WhatsApp User {}", event.from),
                        "phone": event.from,
                        "source": "whatsapp",
                        "last_whatsapp_message": last_message,
                    }),
                )
                .await?;
            let id = contact_id(&created).unwrap_or_else(|| "unknown".to_owned());
            debug!(contact = %id, "contact created");
            Ok(SinkOutcome::delivered(format!("created contact {id}")))
        }
    }
}
