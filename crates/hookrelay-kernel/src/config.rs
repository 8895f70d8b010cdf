use std::path::PathBuf;
use std::time::Duration;

use hookrelay_dispatch::DispatcherConfig;
use hookrelay_events::DEFAULT_HISTORY_CAPACITY;
use hookrelay_tools::RegistryConfig;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no app secret configured; pass one or explicitly allow unsigned deliveries")]
    MissingSecret,
    #[error("verify token must not be empty")]
    EmptyVerifyToken,
    #[error("history capacity must be at least 2, got {0}")]
    CapacityTooSmall(usize),
    #[error("workflow webhook url configured without a token")]
    WorkflowTokenMissing,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub verify_token: String,
    pub app_secret: Option<String>,
    /// Accept deliveries without checking `X-Hub-Signature-256` when no
    /// secret is configured.
    pub insecure_skip_signature: bool,
    /// Shared by the event and dispatch histories.
    pub history_capacity: usize,
    pub workflow: Option<WorkflowSettings>,
    pub tool_servers_file: Option<PathBuf>,
    pub auto_connect: Vec<String>,
    /// Tool server backing the CRM sink.
    pub crm_server: Option<String>,
    pub registry: RegistryConfig,
    pub dispatcher: DispatcherConfig,
    /// How long shutdown waits for post-ack work still in flight.
    pub drain_grace: Duration,
}

impl RelayConfig {
    pub fn new(verify_token: impl Into<String>) -> Self {
        Self {
            verify_token: verify_token.into(),
            app_secret: None,
            insecure_skip_signature: false,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            workflow: None,
            tool_servers_file: None,
            auto_connect: Vec::new(),
            crm_server: None,
            registry: RegistryConfig::default(),
            dispatcher: DispatcherConfig::default(),
            drain_grace: Duration::from_secs(5),
        }
    }

    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    pub fn insecure(mut self) -> Self {
        self.insecure_skip_signature = true;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.verify_token.trim().is_empty() {
            return Err(ConfigError::EmptyVerifyToken);
        }
        let has_secret = self
            .app_secret
            .as_deref()
            .is_some_and(|secret| !secret.is_empty());
        match (has_secret, self.insecure_skip_signature) {
            (false, false) => return Err(ConfigError::MissingSecret),
            (false, true) => warn!("signature verification disabled, accepting unsigned deliveries"),
            (true, true) => warn!("app secret configured, ignoring insecure signature bypass"),
            (true, false) => {}
        }
        if self.history_capacity < 2 {
            return Err(ConfigError::CapacityTooSmall(self.history_capacity));
        }
        if let Some(workflow) = &self.workflow
            && workflow.token.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::WorkflowTokenMissing);
        }
        Ok(())
    }

    /// The secret the verifier should use; `None` only when the bypass is allowed.
    pub fn effective_secret(&self) -> Option<&str> {
        self.app_secret.as_deref().filter(|secret| !secret.is_empty())
    }
}
