use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use hookrelay_protocol::{
    ConnectionError, ConnectionState, ServerName, ToolDescriptor, ToolInvocationResult,
    ToolServerDescriptor, ToolServerStatus,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::connection::{ConnectionTimeouts, ToolConnection};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub timeouts: ConnectionTimeouts,
    pub disconnect_grace: Duration,
    /// Prefix of the `clientInfo.name` sent during the handshake.
    pub client_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeouts: ConnectionTimeouts::default(),
            disconnect_grace: Duration::from_secs(2),
            client_name: "hookrelay".to_owned(),
        }
    }
}

struct ServerEntry {
    descriptor: ToolServerDescriptor,
    state: ConnectionState,
    live: Option<Arc<ToolConnection>>,
    last_error: Option<String>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
}

struct RegistryInner {
    config: RegistryConfig,
    servers: Mutex<IndexMap<ServerName, ServerEntry>>,
    spawned: AtomicU64,
}

/// Named tool-server connections, at most one live subprocess per name.
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct ToolClientRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ToolClientRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ToolClientRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                servers: Mutex::new(IndexMap::new()),
                spawned: AtomicU64::new(0),
            }),
        }
    }

    /// Insert or replace a descriptor. Never connects; a live connection
    /// keeps running and the new descriptor applies to the next spawn.
    pub fn register_descriptor(&self, descriptor: ToolServerDescriptor) {
        let mut servers = self.inner.servers.lock();
        match servers.get_mut(descriptor.name.as_str()) {
            Some(entry) => entry.descriptor = descriptor,
            None => {
                servers.insert(
                    descriptor.name.clone(),
                    ServerEntry {
                        descriptor,
                        state: ConnectionState::Disconnected,
                        live: None,
                        last_error: None,
                        connect_lock: Arc::new(tokio::sync::Mutex::new(())),
                    },
                );
            }
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolServerDescriptor> {
        self.inner
            .servers
            .lock()
            .get(name)
            .map(|entry| entry.descriptor.clone())
    }

    pub fn statuses(&self) -> Vec<ToolServerStatus> {
        self.inner
            .servers
            .lock()
            .values()
            .map(|entry| {
                let mut status = ToolServerStatus::new(&entry.descriptor, entry.state);
                if let Some(connection) = &entry.live {
                    status.pid = connection.pid();
                    status.server_info = connection.server_info().get("serverInfo").cloned();
                }
                status.last_error = entry.last_error.clone();
                status
            })
            .collect()
    }

    pub fn connected_servers(&self) -> Vec<ServerName> {
        self.inner
            .servers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.live.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn live_connections(&self) -> usize {
        self.inner
            .servers
            .lock()
            .values()
            .filter(|entry| entry.live.is_some())
            .count()
    }

    /// Subprocesses spawned over the registry's lifetime, successful or not.
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    /// Return the live connection for `name`, spawning and handshaking a new
    /// subprocess only if none exists. Concurrent callers for the same name
    /// share a single spawn. Failures are not cached and not retried.
    #[instrument(skip(self), fields(server = %name))]
    pub async fn connect(&self, name: &str) -> Result<Arc<ToolConnection>, ConnectionError> {
        if let Some(connection) = self.live(name)? {
            return Ok(connection);
        }

        let lock = self.connect_lock(name)?;
        let _guard = lock.lock().await;
        if let Some(connection) = self.live(name)? {
            return Ok(connection);
        }

        let descriptor = {
            let mut servers = self.inner.servers.lock();
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| ConnectionError::UnknownServer(name.to_owned()))?;
            entry.state = ConnectionState::Connecting;
            entry.descriptor.clone()
        };
        let mut pending = PendingConnect {
            registry: self,
            name,
            settled: false,
        };

        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let opened = ToolConnection::open(
            &descriptor,
            &self.inner.config.timeouts,
            &self.inner.config.client_name,
        )
        .await;

        pending.settled = true;
        let mut servers = self.inner.servers.lock();
        let entry = servers.get_mut(name);
        match opened {
            Ok(connection) => {
                let connection = Arc::new(connection);
                if let Some(entry) = entry {
                    entry.state = ConnectionState::Connected;
                    entry.live = Some(connection.clone());
                    entry.last_error = None;
                }
                info!(pid = ?connection.pid(), "connected to tool server");
                Ok(connection)
            }
            Err(error) => {
                if let Some(entry) = entry {
                    entry.state = ConnectionState::Failed;
                    entry.last_error = Some(error.to_string());
                }
                warn!(%error, "failed to connect to tool server");
                Err(error)
            }
        }
    }

    /// Declared tools of `name`, connecting first if needed.
    #[instrument(skip(self), fields(server = %name))]
    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, ConnectionError> {
        let connection = self.connect(name).await?;
        let result = connection.list_tools().await;
        if let Err(error) = &result {
            self.record_failure(name, &connection, error);
        }
        result
    }

    /// Call `tool_name` on `name` and wait for its single answer.
    ///
    /// A tool that reports an error yields `Ok` with `success == false`;
    /// `Err` is reserved for spawn, handshake, and transport failures.
    #[instrument(skip(self, arguments), fields(server = %name, tool = %tool_name))]
    pub async fn invoke(
        &self,
        name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolInvocationResult, ConnectionError> {
        let connection = self.connect(name).await?;
        let result = connection.call_tool(tool_name, arguments).await;
        match &result {
            Ok(outcome) if !outcome.success => {
                info!(error = ?outcome.error_message, "tool reported failure");
            }
            Ok(_) => {}
            Err(error) => self.record_failure(name, &connection, error),
        }
        result
    }

    /// Terminate and forget the connection for `name`. Returns false when
    /// there was nothing to disconnect.
    #[instrument(skip(self), fields(server = %name))]
    pub async fn disconnect(&self, name: &str) -> bool {
        let Ok(lock) = self.connect_lock(name) else {
            return false;
        };
        let _guard = lock.lock().await;

        let connection = {
            let mut servers = self.inner.servers.lock();
            let Some(entry) = servers.get_mut(name) else {
                return false;
            };
            let connection = entry.live.take();
            if connection.is_some() {
                entry.state = ConnectionState::Disconnected;
            }
            connection
        };

        match connection {
            Some(connection) => {
                connection.shutdown(self.inner.config.disconnect_grace).await;
                info!("disconnected from tool server");
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let names: Vec<ServerName> = self.inner.servers.lock().keys().cloned().collect();
        join_all(names.iter().map(|name| self.disconnect(name.as_str()))).await;
    }

    fn live(&self, name: &str) -> Result<Option<Arc<ToolConnection>>, ConnectionError> {
        let mut servers = self.inner.servers.lock();
        let entry = servers
            .get_mut(name)
            .ok_or_else(|| ConnectionError::UnknownServer(name.to_owned()))?;
        match &entry.live {
            Some(connection) if connection.is_healthy() => Ok(Some(connection.clone())),
            Some(_) => {
                entry.live = None;
                entry.state = ConnectionState::Failed;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn connect_lock(&self, name: &str) -> Result<Arc<tokio::sync::Mutex<()>>, ConnectionError> {
        self.inner
            .servers
            .lock()
            .get(name)
            .map(|entry| entry.connect_lock.clone())
            .ok_or_else(|| ConnectionError::UnknownServer(name.to_owned()))
    }

    fn record_failure(&self, name: &str, connection: &Arc<ToolConnection>, error: &ConnectionError) {
        warn!(%error, "tool server call failed");
        if connection.is_healthy() {
            return;
        }
        let mut servers = self.inner.servers.lock();
        if let Some(entry) = servers.get_mut(name) {
            let is_current = entry
                .live
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(live, connection));
            if is_current {
                entry.live = None;
                entry.state = ConnectionState::Failed;
                entry.last_error = Some(error.to_string());
            }
        }
    }
}

/// Marks an entry `Failed` when its connect future is dropped while the
/// handshake is still in flight. The half-started child is killed on drop.
struct PendingConnect<'a> {
    registry: &'a ToolClientRegistry,
    name: &'a str,
    settled: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut servers = self.registry.inner.servers.lock();
        if let Some(entry) = servers.get_mut(self.name)
            && entry.state == ConnectionState::Connecting
        {
            entry.state = ConnectionState::Failed;
            entry.last_error = Some("connect cancelled".to_owned());
            warn!(server = %self.name, "connect cancelled before the handshake finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_protocol::{ConnectionState, ToolServerDescriptor};

    use super::ToolClientRegistry;

    #[test]
    fn register_descriptor_is_an_upsert() {
        let registry = ToolClientRegistry::default();
        registry.register_descriptor(ToolServerDescriptor::new("crm", "node"));
        registry.register_descriptor(
            ToolServerDescriptor::new("crm", "npx").with_description("second registration"),
        );

        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].command, "npx");
        assert_eq!(statuses[0].state, ConnectionState::Disconnected);
        assert_eq!(registry.live_connections(), 0);
    }

    #[tokio::test]
    async fn unknown_server_is_a_typed_error() {
        let registry = ToolClientRegistry::default();
        let error = registry.connect("missing").await.unwrap_err();
        assert!(matches!(
            error,
            hookrelay_protocol::ConnectionError::UnknownServer(ref name) if name == "missing"
        ));
        assert!(!registry.disconnect("missing").await);
    }

    #[tokio::test]
    async fn spawn_failure_is_not_cached() {
        let registry = ToolClientRegistry::default();
        registry.register_descriptor(ToolServerDescriptor::new(
            "broken",
            "/nonexistent/hookrelay-tool-server",
        ));

        let error = registry.connect("broken").await.unwrap_err();
        assert!(matches!(
            error,
            hookrelay_protocol::ConnectionError::Spawn { .. }
        ));

        let status = &registry.statuses()[0];
        assert_eq!(status.state, ConnectionState::Failed);
        assert!(status.last_error.is_some());
        assert_eq!(registry.live_connections(), 0);

        let _ = registry.connect("broken").await.unwrap_err();
        assert_eq!(registry.spawn_count(), 2);
    }
}
