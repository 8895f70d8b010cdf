//! Wiring of the relay: configuration, signature checks, ingress, and the
//! services the ingress feeds.

pub mod config;
mod ingress;
mod pipeline;
pub mod signature;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use hookrelay_dispatch::{FanOutDispatcher, ToolCrmSink, WorkflowSink, WorkflowSinkConfig};
use hookrelay_events::{DispatchHistory, EventHistory};
use hookrelay_protocol::{Sink, ToolServerDescriptor};
use hookrelay_tools::{ToolClientRegistry, load_descriptors};
use tracing::{info, instrument, warn};

pub use config::{ConfigError, RelayConfig, WorkflowSettings};
pub use ingress::WebhookIngress;
pub use pipeline::IngestPipeline;
pub use signature::{SIGNATURE_HEADER, sign, verify};

pub struct RelayBuilder {
    config: RelayConfig,
    descriptors: Vec<ToolServerDescriptor>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            descriptors: Vec::new(),
            sinks: Vec::new(),
        }
    }

    /// Register a tool server in addition to the ones from the server file.
    pub fn tool_server(mut self, descriptor: ToolServerDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Add a sink after the configured workflow and CRM sinks.
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[instrument(skip(self))]
    pub async fn build(self) -> Result<Relay> {
        self.config.validate()?;
        let config = self.config;

        let registry = ToolClientRegistry::new(config.registry.clone());
        if let Some(path) = &config.tool_servers_file {
            for descriptor in load_descriptors(path).await? {
                registry.register_descriptor(descriptor);
            }
        }
        for descriptor in self.descriptors {
            registry.register_descriptor(descriptor);
        }

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        let workflow = match &config.workflow {
            Some(settings) => {
                let token = settings.token.clone().unwrap_or_default();
                let sink = WorkflowSink::new(WorkflowSinkConfig::new(&settings.url, token))
                    .context("failed to create workflow sink")?;
                let sink = Arc::new(sink);
                sinks.push(sink.clone());
                Some(sink)
            }
            None => None,
        };
        if let Some(server) = &config.crm_server {
            if registry.descriptor(server).is_none() {
                bail!("crm tool server {server:?} is not registered");
            }
            sinks.push(Arc::new(ToolCrmSink::new(registry.clone(), server.as_str())));
        }
        sinks.extend(self.sinks);

        let dispatcher = FanOutDispatcher::new(sinks, config.dispatcher.clone());
        let pipeline = IngestPipeline::new(
            Arc::new(EventHistory::new(config.history_capacity)),
            Arc::new(DispatchHistory::new(config.history_capacity)),
            dispatcher,
        );
        let ingress = WebhookIngress::new(
            config.verify_token.clone(),
            config.effective_secret().map(str::to_owned),
            pipeline,
        );

        let relay = Relay {
            config: Arc::new(config),
            registry,
            ingress: Arc::new(ingress),
            workflow,
        };
        relay.auto_connect().await;
        info!(
            sinks = ?relay.sink_names(),
            tool_servers = relay.registry.statuses().len(),
            "relay ready"
        );
        Ok(relay)
    }
}

/// The running relay. Cloning shares the same services.
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    registry: ToolClientRegistry,
    ingress: Arc<WebhookIngress>,
    workflow: Option<Arc<WorkflowSink>>,
}

impl Relay {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn ingress(&self) -> &WebhookIngress {
        &self.ingress
    }

    pub fn registry(&self) -> &ToolClientRegistry {
        &self.registry
    }

    /// The workflow sink, for forwarding documents outside of any event.
    pub fn workflow(&self) -> Option<&WorkflowSink> {
        self.workflow.as_deref()
    }

    pub fn events(&self) -> &EventHistory {
        self.ingress.pipeline().events()
    }

    pub fn dispatches(&self) -> &DispatchHistory {
        self.ingress.pipeline().dispatches()
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.ingress.pipeline().dispatcher().sink_names()
    }

    async fn auto_connect(&self) {
        for name in &self.config.auto_connect {
            if let Err(error) = self.registry.connect(name).await {
                warn!(server = %name, %error, "auto-connect failed");
            }
        }
    }

    /// Let post-ack work finish within the configured grace period, then stop
    /// every tool server.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let finished = self.ingress.drain(self.config.drain_grace).await;
        self.registry.disconnect_all().await;
        info!(finished, "relay stopped");
    }
}
