//! Inbound event model: the ingested delivery, the per-message/per-status
//! views handed to sinks, and the record of one fan-out run.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EventId;
use crate::ports::SinkHandler;

/// Classification of an inbound envelope, decided once at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    StatusUpdate,
    TemplateStatusUpdate,
    TemplateQualityUpdate,
    Unclassified,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::StatusUpdate => "status_update",
            Self::TemplateStatusUpdate => "template_status_update",
            Self::TemplateQualityUpdate => "template_quality_update",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authenticated webhook delivery. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: EventId,
    pub received_at: DateTime<Utc>,
    pub raw_payload: Value,
    pub kind: EventKind,
    pub signature_valid: bool,
}

impl InboundEvent {
    pub fn new(raw_payload: Value, kind: EventKind, signature_valid: bool) -> Self {
        Self::with_id(EventId::new_uuid(), raw_payload, kind, signature_valid)
    }

    /// Use an id allocated before classification so decoded entries can refer to it.
    pub fn with_id(
        id: EventId,
        raw_payload: Value,
        kind: EventKind,
        signature_valid: bool,
    ) -> Self {
        Self {
            id,
            received_at: Utc::now(),
            raw_payload,
            kind,
            signature_valid,
        }
    }
}

/// A single inbound message out of a `messages` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub event_id: EventId,
    /// Sender phone number as sent by the provider (no leading `+`).
    pub from: String,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_timestamp: Option<String>,
    /// `text.body` for text messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `button.text` for quick-reply button messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    pub raw: Value,
}

/// Delivery status of a previously sent outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub raw: Value,
}

/// Template status or quality change; the value is passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateUpdate {
    pub event_id: EventId,
    pub kind: EventKind,
    pub raw: Value,
}

/// Outcome of one sink handler call during a fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkCallRecord {
    pub sink: String,
    pub handler: SinkHandler,
    pub success: bool,
    pub detail: String,
    pub duration_ms: u64,
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Everything that happened while fanning out one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub kind: EventKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub calls: Vec<SinkCallRecord>,
    /// Batch entries that could not be decoded and were skipped.
    #[serde(default)]
    pub skipped_entries: usize,
}

impl DispatchReport {
    pub fn failed_calls(&self) -> usize {
        self.calls.iter().filter(|call| !call.success).count()
    }
}
