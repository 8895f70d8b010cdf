//! Provider envelope decoding.
//!
//! Deliveries look like `{ "object": ..., "entry": [{ "changes": [{ "field": ..., "value": ... }] }] }`.
//! Only the first change of the first entry is inspected; the provider sends
//! one change per delivery for every field we route.

use hookrelay_protocol::{EventId, EventKind, MessageEvent, StatusEvent, TemplateUpdate};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

const FIELD_MESSAGES: &str = "messages";
const FIELD_TEMPLATE_STATUS: &str = "message_template_status_update";
const FIELD_TEMPLATE_QUALITY: &str = "message_template_quality_update";

/// An envelope decoded once at ingestion; dispatch matches on this.
#[derive(Debug, Clone)]
pub enum ClassifiedPayload {
    Messages {
        messages: Vec<MessageEvent>,
        /// Statuses delivered in the same change, dispatched after the messages.
        statuses: Vec<StatusEvent>,
        skipped: usize,
    },
    Statuses {
        statuses: Vec<StatusEvent>,
        skipped: usize,
    },
    TemplateStatus(TemplateUpdate),
    TemplateQuality(TemplateUpdate),
    Unclassified {
        field: Option<String>,
    },
}

impl ClassifiedPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Messages { .. } => EventKind::MessageReceived,
            Self::Statuses { .. } => EventKind::StatusUpdate,
            Self::TemplateStatus(_) => EventKind::TemplateStatusUpdate,
            Self::TemplateQuality(_) => EventKind::TemplateQualityUpdate,
            Self::Unclassified { .. } => EventKind::Unclassified,
        }
    }

    /// Entries of the batch that failed to decode.
    pub fn skipped(&self) -> usize {
        match self {
            Self::Messages { skipped, .. } | Self::Statuses { skipped, .. } => *skipped,
            _ => 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    from: String,
    #[serde(rename = "type", default = "unknown_type")]
    message_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    text: Option<WireText>,
    #[serde(default)]
    button: Option<WireButton>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireButton {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    conversation: Option<WireConversation>,
}

#[derive(Debug, Deserialize)]
struct WireConversation {
    #[serde(default)]
    id: Option<String>,
}

fn unknown_type() -> String {
    "unknown".to_owned()
}

fn first_change(payload: &Value) -> Option<&Value> {
    payload.pointer("/entry/0/changes/0")
}

fn non_empty_array<'a>(value: Option<&'a Value>, key: &str) -> Option<&'a Vec<Value>> {
    value?
        .get(key)?
        .as_array()
        .filter(|entries| !entries.is_empty())
}

/// Assign a kind by looking at the first change's `field` and `value`.
pub fn classify(payload: &Value) -> EventKind {
    let Some(change) = first_change(payload) else {
        return EventKind::Unclassified;
    };
    let value = change.get("value");
    match change.get("field").and_then(Value::as_str) {
        Some(FIELD_MESSAGES) if non_empty_array(value, "messages").is_some() => {
            EventKind::MessageReceived
        }
        Some(FIELD_MESSAGES) if non_empty_array(value, "statuses").is_some() => {
            EventKind::StatusUpdate
        }
        Some(FIELD_TEMPLATE_STATUS) => EventKind::TemplateStatusUpdate,
        Some(FIELD_TEMPLATE_QUALITY) => EventKind::TemplateQualityUpdate,
        _ => EventKind::Unclassified,
    }
}

/// Decode the envelope into typed entries tagged with `event_id`.
///
/// Entries that do not decode are logged and counted, never fatal for their
/// siblings.
pub fn decode(event_id: &EventId, payload: &Value) -> ClassifiedPayload {
    let kind = classify(payload);
    let change = first_change(payload);
    let value = change.and_then(|change| change.get("value"));

    match kind {
        EventKind::MessageReceived => {
            let mut skipped = 0;
            let messages = decode_entries(value, "messages", &mut skipped, |raw| {
                decode_message(event_id, raw)
            });
            let statuses = decode_entries(value, "statuses", &mut skipped, |raw| {
                decode_status(event_id, raw)
            });
            ClassifiedPayload::Messages {
                messages,
                statuses,
                skipped,
            }
        }
        EventKind::StatusUpdate => {
            let mut skipped = 0;
            let statuses = decode_entries(value, "statuses", &mut skipped, |raw| {
                decode_status(event_id, raw)
            });
            ClassifiedPayload::Statuses { statuses, skipped }
        }
        EventKind::TemplateStatusUpdate | EventKind::TemplateQualityUpdate => {
            let update = TemplateUpdate {
                event_id: event_id.clone(),
                kind,
                raw: value.cloned().unwrap_or(Value::Null),
            };
            if kind == EventKind::TemplateStatusUpdate {
                ClassifiedPayload::TemplateStatus(update)
            } else {
                ClassifiedPayload::TemplateQuality(update)
            }
        }
        EventKind::Unclassified => ClassifiedPayload::Unclassified {
            field: change
                .and_then(|change| change.get("field"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        },
    }
}

fn decode_entries<T>(
    value: Option<&Value>,
    key: &str,
    skipped: &mut usize,
    decode_one: impl Fn(&Value) -> Result<T, serde_json::Error>,
) -> Vec<T> {
    let Some(entries) = non_empty_array(value, key) else {
        return Vec::new();
    };
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| match decode_one(raw) {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%error, index, key, "skipping malformed batch entry");
                *skipped += 1;
                None
            }
        })
        .collect()
}

fn decode_message(event_id: &EventId, raw: &Value) -> Result<MessageEvent, serde_json::Error> {
    let wire: WireMessage = serde_json::from_value(raw.clone())?;
    Ok(MessageEvent {
        event_id: event_id.clone(),
        from: wire.from,
        message_type: wire.message_type,
        provider_message_id: wire.id,
        provider_timestamp: wire.timestamp.map(|timestamp| match timestamp {
            Value::String(timestamp) => timestamp,
            other => other.to_string(),
        }),
        text: wire.text.and_then(|text| text.body),
        button_text: wire.button.and_then(|button| button.text),
        raw: raw.clone(),
    })
}

fn decode_status(event_id: &EventId, raw: &Value) -> Result<StatusEvent, serde_json::Error> {
    let wire: WireStatus = serde_json::from_value(raw.clone())?;
    Ok(StatusEvent {
        event_id: event_id.clone(),
        message_id: wire.id,
        status: wire.status,
        recipient_id: wire.recipient_id,
        conversation_id: wire.conversation.and_then(|conversation| conversation.id),
        raw: raw.clone(),
    })
}
