//! Command contract consumed from the cluster backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::model::{ChannelId, NamespaceScope, SessionId};
use crate::scope::NamespaceScopeTracker;

/// The (cluster, kind, namespaces) triple a resource view is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchScope {
    pub cluster: String,
    pub kind: String,
    pub namespaces: NamespaceScope,
}

impl WatchScope {
    pub fn new(cluster: impl Into<String>, kind: impl Into<String>, namespaces: NamespaceScope) -> Self {
        Self {
            cluster: cluster.into(),
            kind: kind.into(),
            namespaces,
        }
    }

    /// Prefix shared by every channel a backend opens for this cluster.
    pub fn cluster_prefix(&self) -> String {
        cluster_prefix(&self.cluster)
    }
}

/// `{cluster}/` with `%` and `/` escaped, so context names such as EKS ARNs
/// never nest inside another cluster's prefix.
pub fn cluster_prefix(cluster: &str) -> String {
    let escaped = cluster.replace('%', "%25").replace('/', "%2F");
    format!("{escaped}/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub cluster: String,
    pub namespace: String,
    pub target: String,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub tty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub cluster: String,
    pub namespace: String,
    pub target: String,
    pub container: Option<String>,
    pub tail_lines: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRequest {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// What a backend returns when it opens an interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOpened {
    pub session_id: SessionId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardInfo {
    pub session_id: SessionId,
    pub cluster: String,
    pub namespace: String,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn list(&self, scope: &WatchScope) -> anyhow::Result<Vec<Value>>;

    /// Opens a watch channel; `WatchEvent` payloads follow on the bus.
    async fn watch(&self, scope: &WatchScope) -> anyhow::Result<ChannelId>;

    /// Closes one channel by name, or every watch channel under a `/`-terminated prefix.
    /// Session channels are never reached by a prefix.
    async fn unwatch(&self, prefix_or_name: &str) -> anyhow::Result<()>;

    async fn exec_start(&self, request: &ExecRequest) -> anyhow::Result<SessionOpened>;

    async fn exec_send(
        &self,
        session: &SessionId,
        input: &str,
        append_newline: bool,
    ) -> anyhow::Result<()>;

    async fn exec_stop(&self, session: &SessionId) -> anyhow::Result<()>;

    async fn logs_watch(&self, request: &LogRequest) -> anyhow::Result<ChannelId>;

    async fn logs_get(&self, request: &LogRequest) -> anyhow::Result<String>;

    async fn port_forward_start(
        &self,
        request: &PortForwardRequest,
    ) -> anyhow::Result<SessionOpened>;

    async fn port_forward_stop(&self, session: &SessionId) -> anyhow::Result<()>;

    async fn port_forward_list(&self) -> anyhow::Result<Vec<PortForwardInfo>>;
}

/// Collaborators injected into every watch and session component.
#[derive(Clone)]
pub struct SyncContext {
    pub backend: Arc<dyn Backend>,
    pub bus: EventBus,
    pub config: Arc<SyncConfig>,
    pub scope: NamespaceScopeTracker,
}

impl SyncContext {
    pub fn new(backend: Arc<dyn Backend>, bus: EventBus, config: SyncConfig) -> Self {
        let config = Arc::new(config);
        let scope = NamespaceScopeTracker::new(Arc::clone(&backend), bus.clone(), Arc::clone(&config));
        Self {
            backend,
            bus,
            config,
            scope,
        }
    }
}
