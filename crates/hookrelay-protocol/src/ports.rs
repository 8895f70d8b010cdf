//! The sink port: the only call contract the fan-out core needs from a
//! downstream consumer. Each sink owns its own wire protocol and auth.
//!
//! Object-safety note: the trait uses `async-trait` so the dispatcher can hold
//! `Arc<dyn Sink>`.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::event::{MessageEvent, StatusEvent, TemplateUpdate};

/// Result of a single sink call as reported by the sink itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub success: bool,
    pub detail: String,
}

impl SinkOutcome {
    pub fn delivered(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }

    /// The sink has no interest in this kind of event.
    pub fn skipped() -> Self {
        Self::delivered("skipped")
    }
}

/// Which handler of a sink was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkHandler {
    Message,
    Status,
    TemplateStatus,
    TemplateQuality,
}

impl fmt::Display for SinkHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Message => "on_message",
            Self::Status => "on_status",
            Self::TemplateStatus => "on_template_status",
            Self::TemplateQuality => "on_template_quality",
        };
        f.write_str(name)
    }
}

/// Downstream consumer of classified events.
///
/// Implementations must tolerate duplicate deliveries: the provider retries on
/// timeouts and nothing upstream deduplicates.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn on_message(&self, event: &MessageEvent) -> Result<SinkOutcome, SinkError>;

    async fn on_status(&self, _event: &StatusEvent) -> Result<SinkOutcome, SinkError> {
        Ok(SinkOutcome::skipped())
    }

    async fn on_template_status(&self, _update: &TemplateUpdate) -> Result<SinkOutcome, SinkError> {
        Ok(SinkOutcome::skipped())
    }

    async fn on_template_quality(
        &self,
        _update: &TemplateUpdate,
    ) -> Result<SinkOutcome, SinkError> {
        Ok(SinkOutcome::skipped())
    }
}
