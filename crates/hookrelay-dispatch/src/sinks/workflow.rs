//! Automation-workflow sink: every event becomes one authenticated JSON POST.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hookrelay_protocol::{
    MessageEvent, Sink, SinkError, SinkOutcome, StatusEvent, TemplateUpdate, duration_ms,
};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct WorkflowIds {
    pub message: String,
    pub status: String,
    pub template_status: String,
    pub template_quality: String,
}

impl Default for WorkflowIds {
    fn default() -> Self {
        Self {
            message: "whatsapp-message-processor".to_owned(),
            status: "whatsapp-status-processor".to_owned(),
            template_status: "template-status-processor".to_owned(),
            template_quality: "template-quality-processor".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSinkConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
    pub workflow_ids: WorkflowIds,
    /// Value of the `source` field of every document.
    pub source: String,
}

impl WorkflowSinkConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            timeout: Duration::from_secs(10),
            workflow_ids: WorkflowIds::default(),
            source: "hookrelay".to_owned(),
        }
    }
}

pub struct WorkflowSink {
    client: reqwest::Client,
    config: WorkflowSinkConfig,
}

impl WorkflowSink {
    pub const NAME: &'static str = "workflow";

    pub fn new(config: WorkflowSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build workflow http client")?;
        Ok(Self { client, config })
    }

    fn message_document(&self, event: &MessageEvent) -> Value {
        let now = Utc::now().to_rfc3339();
        self.document(
            "whatsapp_message",
            "message",
            event.raw.clone(),
            json!({
                "phoneNumber": event.from,
                "messageType": event.message_type,
                "timestamp": now,
            }),
            &self.config.workflow_ids.message,
        )
    }

    fn status_document(&self, event: &StatusEvent) -> Value {
        self.document(
            "whatsapp_status",
            "status",
            event.raw.clone(),
            json!({
                "conversationId": event.conversation_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            &self.config.workflow_ids.status,
        )
    }

    fn template_document(&self, update: &TemplateUpdate, kind: &str, workflow_id: &str) -> Value {
        self.document(
            kind,
            "data",
            update.raw.clone(),
            json!({ "timestamp": Utc::now().to_rfc3339() }),
            workflow_id,
        )
    }

    fn document(
        &self,
        kind: &str,
        body_key: &str,
        body: Value,
        metadata: Value,
        workflow_id: &str,
    ) -> Value {
        let mut document = Map::new();
        document.insert("type".to_owned(), json!(kind));
        document.insert(body_key.to_owned(), body);
        document.insert("metadata".to_owned(), metadata);
        document.insert("timestamp".to_owned(), json!(Utc::now().to_rfc3339()));
        document.insert("source".to_owned(), json!(self.config.source));
        document.insert("workflowId".to_owned(), json!(workflow_id));
        Value::Object(document)
    }

    /// Forward an arbitrary document outside of any event. Object fields stay
    /// at the top level; any other value is nested under `data`.
    pub async fn send(
        &self,
        data: Value,
        workflow_id: Option<&str>,
    ) -> Result<SinkOutcome, SinkError> {
        let mut document = match data {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("data".to_owned(), other);
                fields
            }
        };
        document.insert("timestamp".to_owned(), json!(Utc::now().to_rfc3339()));
        document.insert("source".to_owned(), json!(self.config.source));
        document.insert("workflowId".to_owned(), json!(workflow_id));
        self.post(workflow_id.unwrap_or("unrouted"), Value::Object(document))
            .await
    }

    #[instrument(skip(self, document), fields(sink = Self::NAME))]
    async fn post(&self, workflow_id: &str, document: Value) -> Result<SinkOutcome, SinkError> {
        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.token)
            .json(&document)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    SinkError::Timeout {
                        sink: Self::NAME.to_owned(),
                        timeout_ms: duration_ms(self.config.timeout),
                    }
                } else {
                    SinkError::request(Self::NAME, error.to_string())
                }
            })?;

        let status = response.status();
        debug!(%status, "workflow webhook answered");
        if status.is_success() {
            Ok(SinkOutcome::delivered(format!("{workflow_id}: {status}")))
        } else {
            Ok(SinkOutcome::rejected(format!(
                "{workflow_id}: workflow webhook returned {status}"
            )))
        }
    }
}

#[async_trait]
impl Sink for WorkflowSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn on_message(&self, event: &MessageEvent) -> Result<SinkOutcome, SinkError> {
        let document = self.message_document(event);
        self.post(&self.config.workflow_ids.message, document).await
    }

    async fn on_status(&self, event: &StatusEvent) -> Result<SinkOutcome, SinkError> {
        let document = self.status_document(event);
        self.post(&self.config.workflow_ids.status, document).await
    }

    async fn on_template_status(&self, update: &TemplateUpdate) -> Result<SinkOutcome, SinkError> {
        let workflow_id = &self.config.workflow_ids.template_status;
        let document = self.template_document(update, "template_status", workflow_id);
        self.post(workflow_id, document).await
    }

    async fn on_template_quality(&self, update: &TemplateUpdate) -> Result<SinkOutcome, SinkError> {
        let workflow_id = &self.config.workflow_ids.template_quality;
        let document = self.template_document(update, "template_quality", workflow_id);
        self.post(workflow_id, document).await
    }
}
