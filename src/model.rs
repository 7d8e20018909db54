use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// Identity of a resource within one (cluster, kind) scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Opaque id of one open watch or session channel on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Whether an unwatch of `target` (exact name, or a `/`-terminated prefix) covers this channel.
    pub fn is_targeted_by(&self, target: &str) -> bool {
        self.0 == target || (target.ends_with('/') && self.has_prefix(target))
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Namespace selection of a view. An empty named set collapses to `All`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamespaceScope {
    All,
    Named(BTreeSet<String>),
}

impl NamespaceScope {
    pub fn named<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = namespaces
            .into_iter()
            .map(Into::into)
            .map(|namespace: String| namespace.trim().to_string())
            .filter(|namespace| !namespace.is_empty())
            .collect::<BTreeSet<_>>();
        if set.is_empty() {
            Self::All
        } else {
            Self::Named(set)
        }
    }

    pub fn namespaces(&self) -> Vec<&str> {
        match self {
            Self::All => Vec::new(),
            Self::Named(set) => set.iter().map(String::as_str).collect(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Named(set) => set.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

impl Display for NamespaceScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Resource kinds understood by the kube backend and the CLI.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Pods,
    Deployments,
    ReplicaSets,
    StatefulSets,
    DaemonSets,
    Jobs,
    CronJobs,
    Services,
    Ingresses,
    ConfigMaps,
    Secrets,
    PersistentVolumeClaims,
    PersistentVolumes,
    Nodes,
    Events,
    Namespaces,
}

/// Group/version/kind coordinates used to build a dynamic API handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KindCoordinates {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

impl ResourceKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "po" | "pod" | "pods" => Some(Self::Pods),
            "deploy" | "deployment" | "deployments" | "dp" => Some(Self::Deployments),
            "rs" | "replicaset" | "replicasets" | "replica-set" | "replica-sets" => {
                Some(Self::ReplicaSets)
            }
            "sts" | "statefulset" | "statefulsets" => Some(Self::StatefulSets),
            "ds" | "daemonset" | "daemonsets" | "daemon-set" | "daemon-sets" => {
                Some(Self::DaemonSets)
            }
            "job" | "jobs" => Some(Self::Jobs),
            "cj" | "cronjob" | "cronjobs" | "cron-job" | "cron-jobs" => Some(Self::CronJobs),
            "svc" | "service" | "services" => Some(Self::Services),
            "ing" | "ingress" | "ingresses" => Some(Self::Ingresses),
            "cm" | "configmap" | "configmaps" | "config-map" | "config-maps" => {
                Some(Self::ConfigMaps)
            }
            "secret" | "secrets" => Some(Self::Secrets),
            "pvc"
            | "persistentvolumeclaim"
            | "persistentvolumeclaims"
            | "persistent-volume-claim"
            | "persistent-volume-claims" => Some(Self::PersistentVolumeClaims),
            "pv" | "persistentvolume" | "persistentvolumes" | "persistent-volume"
            | "persistent-volumes" => Some(Self::PersistentVolumes),
            "node" | "nodes" | "no" => Some(Self::Nodes),
            "event" | "events" | "ev" => Some(Self::Events),
            "ns" | "namespace" | "namespaces" => Some(Self::Namespaces),
            _ => None,
        }
    }

    /// Stable token used inside channel ids.
    pub fn token(self) -> &'static str {
        self.coordinates().plural
    }

    pub fn coordinates(self) -> KindCoordinates {
        let (group, version, kind, plural, namespaced) = match self {
            Self::Pods => ("", "v1", "Pod", "pods", true),
            Self::Deployments => ("apps", "v1", "Deployment", "deployments", true),
            Self::ReplicaSets => ("apps", "v1", "ReplicaSet", "replicasets", true),
            Self::StatefulSets => ("apps", "v1", "StatefulSet", "statefulsets", true),
            Self::DaemonSets => ("apps", "v1", "DaemonSet", "daemonsets", true),
            Self::Jobs => ("batch", "v1", "Job", "jobs", true),
            Self::CronJobs => ("batch", "v1", "CronJob", "cronjobs", true),
            Self::Services => ("", "v1", "Service", "services", true),
            Self::Ingresses => ("networking.k8s.io", "v1", "Ingress", "ingresses", true),
            Self::ConfigMaps => ("", "v1", "ConfigMap", "configmaps", true),
            Self::Secrets => ("", "v1", "Secret", "secrets", true),
            Self::PersistentVolumeClaims => (
                "",
                "v1",
                "PersistentVolumeClaim",
                "persistentvolumeclaims",
                true,
            ),
            Self::PersistentVolumes => ("", "v1", "PersistentVolume", "persistentvolumes", false),
            Self::Nodes => ("", "v1", "Node", "nodes", false),
            Self::Events => ("", "v1", "Event", "events", true),
            Self::Namespaces => ("", "v1", "Namespace", "namespaces", false),
        };
        KindCoordinates {
            group,
            version,
            kind,
            plural,
            namespaced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    pub kind: WatchEventKind,
    pub object: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecEvent {
    Stdout {
        #[serde(default)]
        data: String,
    },
    Stderr {
        #[serde(default)]
        data: String,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEvent {
    LogLine {
        #[serde(default)]
        log: String,
    },
    LogError {
        #[serde(default)]
        error: Option<String>,
    },
    LogCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortForwardEvent {
    PfStdout {
        #[serde(default)]
        line: String,
    },
    PfStderr {
        #[serde(default)]
        line: String,
    },
    PfError {
        #[serde(default)]
        line: Option<String>,
    },
    PfDone,
}

/// One shell command tried during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecCandidate {
    pub command: Vec<String>,
}

impl ExecCandidate {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    pub fn label(&self) -> String {
        self.command.join(" ")
    }
}

/// Live handle of one started session, owned by the component that started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub active: bool,
}

/// A payload that carries a `ResourceKey` and can absorb partial updates.
pub trait Keyed {
    fn resource_key(&self) -> Option<ResourceKey>;

    /// Shallow merge: fields present in `patch` overwrite, omitted fields are kept.
    fn merge_from(&mut self, patch: Self);
}

impl Keyed for Value {
    fn resource_key(&self) -> Option<ResourceKey> {
        let identity = self
            .get("metadata")
            .filter(|metadata| metadata.get("name").is_some())
            .unwrap_or(self);
        let name = identity.get("name")?.as_str()?;
        let namespace = identity
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(ResourceKey::new(namespace, name))
    }

    fn merge_from(&mut self, patch: Self) {
        match (self.as_object_mut(), patch) {
            (Some(current), Value::Object(fields)) => {
                for (field, value) in fields {
                    current.insert(field, value);
                }
            }
            (_, patch) => *self = patch,
        }
    }
}
