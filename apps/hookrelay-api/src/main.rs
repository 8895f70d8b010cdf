use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hookrelay_kernel::{RelayBuilder, RelayConfig, WorkflowSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;

#[derive(Debug, Parser)]
#[command(name = "hookrelay")]
#[command(about = "Webhook ingestion and fan-out relay")]
struct Cli {
    #[arg(long, env = "HOOKRELAY_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
    #[arg(long, env = "VERIFY_TOKEN")]
    verify_token: String,
    #[arg(long, env = "APP_SECRET", hide_env_values = true)]
    app_secret: Option<String>,
    /// Accept deliveries without a signature check when no app secret is set.
    #[arg(long)]
    insecure_skip_signature: bool,
    #[arg(long, default_value_t = 1000)]
    history_capacity: usize,
    #[arg(long, env = "N8N_WEBHOOK_URL")]
    workflow_url: Option<String>,
    #[arg(long, env = "N8N_TOKEN", hide_env_values = true)]
    workflow_token: Option<String>,
    /// JSON file with `{ "servers": { name: { command, args, env } } }`.
    #[arg(long, env = "HOOKRELAY_TOOL_SERVERS")]
    tool_servers: Option<PathBuf>,
    #[arg(long, value_delimiter = ',')]
    auto_connect: Vec<String>,
    /// Tool server used by the CRM sink.
    #[arg(long)]
    crm_server: Option<String>,
    #[arg(long, default_value_t = 10)]
    handshake_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    call_timeout_secs: u64,
    #[arg(long, default_value_t = 2000)]
    disconnect_grace_ms: u64,
    #[arg(long)]
    sink_timeout_secs: Option<u64>,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        let mut config = RelayConfig::new(self.verify_token.clone());
        config.app_secret = self.app_secret.clone();
        config.insecure_skip_signature = self.insecure_skip_signature;
        config.history_capacity = self.history_capacity;
        config.workflow = self.workflow_url.as_ref().map(|url| WorkflowSettings {
            url: url.clone(),
            token: self.workflow_token.clone(),
        });
        config.tool_servers_file = self.tool_servers.clone();
        config.auto_connect = self.auto_connect.clone();
        config.crm_server = self.crm_server.clone();
        config.registry.timeouts.handshake = Duration::from_secs(self.handshake_timeout_secs);
        config.registry.timeouts.call = Duration::from_secs(self.call_timeout_secs);
        config.registry.disconnect_grace = Duration::from_millis(self.disconnect_grace_ms);
        config.dispatcher.sink_timeout = self.sink_timeout_secs.map(Duration::from_secs);
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let relay = RelayBuilder::new(cli.relay_config())
        .build()
        .await
        .context("failed to start relay")?;

    let app = routes::router(relay.clone());
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(listen = %cli.listen, sinks = ?relay.sink_names(), "hookrelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn cli_maps_onto_relay_config() {
        let cli = Cli::try_parse_from([
            "hookrelay",
            "--verify-token",
            "verify-me",
            "--app-secret",
            "s3cret",
            "--auto-connect",
            "rest_api,filesystem",
            "--workflow-url",
            "http://localhost:5678/webhook/whatsapp",
            "--workflow-token",
            "n8n",
            "--sink-timeout-secs",
            "15",
        ])
        .unwrap();

        let config = cli.relay_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_connect, vec!["rest_api", "filesystem"]);
        assert_eq!(config.history_capacity, 1000);
        assert_eq!(config.registry.timeouts.call, Duration::from_secs(30));
        assert_eq!(config.registry.disconnect_grace, Duration::from_millis(2000));
        assert_eq!(config.dispatcher.sink_timeout, Some(Duration::from_secs(15)));
        assert_eq!(
            config.workflow.map(|workflow| workflow.url),
            Some("http://localhost:5678/webhook/whatsapp".to_owned())
        );
    }
}
