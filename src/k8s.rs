//! `Backend` over a live cluster.
//!
//! Clusters are kubeconfig context names. Resources are listed and watched
//! through dynamic APIs; exec and port-forward run `kubectl` subprocesses
//! whose output is streamed onto the event bus. TTY execs run under a
//! pseudo-terminal so interactive shells print their prompt.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{Config as WatchConfig, Event, watcher};
use kube::{Api, Client, Config};
use portable_pty::{ChildKiller, CommandBuilder, PtySize, native_pty_system};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, ExecRequest, LogRequest, PortForwardInfo, PortForwardRequest, SessionOpened,
    WatchScope, cluster_prefix,
};
use crate::bus::EventBus;
use crate::model::{ChannelId, NamespaceScope, ResourceKind, SessionId, WatchEventKind};

/// Context name used when running inside a pod without a kubeconfig.
pub const IN_CLUSTER: &str = "in-cluster";

const WATCH_RESTART_DELAY: Duration = Duration::from_millis(900);
const EXEC_READ_CHUNK: usize = 4096;
const PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

#[derive(Clone)]
struct ClusterClient {
    client: Client,
    default_namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Watch,
    Logs,
}

struct TrackedStream {
    kind: StreamKind,
    tasks: Vec<JoinHandle<()>>,
}

impl TrackedStream {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type PtyWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

enum ExecInput {
    Pipe(Arc<tokio::sync::Mutex<Option<ChildStdin>>>),
    Pty(PtyWriter),
}

struct ExecProcess {
    input: ExecInput,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    task: JoinHandle<()>,
}

impl ExecProcess {
    fn kill(&mut self) {
        if let Some(killer) = self.killer.as_mut()
            && let Err(error) = killer.kill()
        {
            debug!("failed to kill exec process: {error}");
        }
        self.task.abort();
    }
}

struct ForwardProcess {
    info: PortForwardInfo,
    task: JoinHandle<()>,
}

pub struct KubeBackend {
    bus: EventBus,
    kubeconfig: Option<Kubeconfig>,
    kubectl: PathBuf,
    clients: tokio::sync::Mutex<HashMap<String, ClusterClient>>,
    streams: Mutex<HashMap<ChannelId, TrackedStream>>,
    execs: Mutex<HashMap<SessionId, ExecProcess>>,
    forwards: Mutex<HashMap<SessionId, ForwardProcess>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KubeBackend {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            kubeconfig: Kubeconfig::read().ok(),
            kubectl: PathBuf::from("kubectl"),
            clients: tokio::sync::Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            execs: Mutex::new(HashMap::new()),
            forwards: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Uses another `kubectl` binary for exec and port-forward.
    pub fn with_kubectl(mut self, program: impl Into<PathBuf>) -> Self {
        self.kubectl = program.into();
        self
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn current_context(&self) -> String {
        self.kubeconfig
            .as_ref()
            .and_then(|config| config.current_context.clone())
            .unwrap_or_else(|| IN_CLUSTER.to_string())
    }

    pub fn available_contexts(&self) -> Vec<String> {
        let mut contexts = self
            .kubeconfig
            .as_ref()
            .map(|config| {
                config
                    .contexts
                    .iter()
                    .map(|context| context.name.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        contexts.sort();
        contexts.dedup();
        contexts
    }

    pub async fn default_namespace(&self, cluster: &str) -> Result<String> {
        Ok(self.cluster_client(cluster).await?.default_namespace)
    }

    async fn cluster_client(&self, cluster: &str) -> Result<ClusterClient> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(cluster) {
            return Ok(existing.clone());
        }

        let config = if let Some(kubeconfig) = self.kubeconfig.clone()
            && cluster != IN_CLUSTER
        {
            let options = KubeConfigOptions {
                context: Some(cluster.to_string()),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .with_context(|| format!("failed to load kubeconfig context '{cluster}'"))?
        } else {
            if cluster != IN_CLUSTER {
                anyhow::bail!("kubeconfig not found; context '{cluster}' is unavailable");
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;
        let entry = ClusterClient {
            client,
            default_namespace,
        };
        clients.insert(cluster.to_string(), entry.clone());
        info!(context = %cluster, "connected to cluster");
        Ok(entry)
    }

    async fn dynamic_apis(&self, scope: &WatchScope) -> Result<Vec<Api<DynamicObject>>> {
        let kind = ResourceKind::from_token(&scope.kind)
            .with_context(|| format!("unsupported resource kind '{}'", scope.kind))?;
        let coordinates = kind.coordinates();
        let gvk = GroupVersionKind::gvk(coordinates.group, coordinates.version, coordinates.kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, coordinates.plural);
        let client = self.cluster_client(&scope.cluster).await?.client;

        let apis = match (&scope.namespaces, coordinates.namespaced) {
            (NamespaceScope::Named(namespaces), true) => namespaces
                .iter()
                .map(|namespace| Api::namespaced_with(client.clone(), namespace, &resource))
                .collect(),
            _ => vec![Api::all_with(client, &resource)],
        };
        Ok(apis)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track_stream(&self, channel: &ChannelId, kind: StreamKind, tasks: Vec<JoinHandle<()>>) {
        if let Some(previous) = lock(&self.streams).insert(channel.clone(), TrackedStream { kind, tasks }) {
            previous.abort();
        }
    }

    fn command(&self, cluster: &str) -> TokioCommand {
        let mut command = TokioCommand::new(&self.kubectl);
        command.args(context_args(cluster));
        command
    }

    fn spawn_piped_exec(&self, request: &ExecRequest, channel: &ChannelId) -> Result<ExecProcess> {
        let mut child = self
            .command(&request.cluster)
            .args(exec_args(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn kubectl exec for {}/{}",
                    request.namespace, request.target
                )
            })?;
        let stdout = child
            .stdout
            .take()
            .context("kubectl exec stdout is unavailable")?;
        let stderr = child
            .stderr
            .take()
            .context("kubectl exec stderr is unavailable")?;
        let stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));

        self.bus.open(channel);
        let bus = self.bus.clone();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            tokio::join!(
                pump_chunks(stdout, &bus, &task_channel, "STDOUT"),
                pump_chunks(stderr, &bus, &task_channel, "STDERR"),
            );
            let payload = match child.wait().await {
                Ok(status) if status.success() => json!({"kind": "COMPLETED"}),
                Ok(status) => json!({"kind": "ERROR", "error": format!("kubectl exec exited with {status}")}),
                Err(error) => json!({"kind": "ERROR", "error": format!("failed to wait for kubectl exec: {error}")}),
            };
            bus.emit(&task_channel, payload);
        });
        Ok(ExecProcess {
            input: ExecInput::Pipe(stdin),
            killer: None,
            task,
        })
    }

    /// Runs `kubectl exec -t` on a pseudo-terminal; stdout and stderr arrive merged as `STDOUT`.
    fn spawn_pty_exec(&self, request: &ExecRequest, channel: &ChannelId) -> Result<ExecProcess> {
        let pair = native_pty_system()
            .openpty(PTY_SIZE)
            .context("failed to open a pseudo-terminal for kubectl exec")?;
        let mut command = CommandBuilder::new(&self.kubectl);
        command.args(context_args(&request.cluster));
        command.args(exec_args(request));
        let mut child = pair.slave.spawn_command(command).with_context(|| {
            format!(
                "failed to spawn kubectl exec for {}/{}",
                request.namespace, request.target
            )
        })?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone the exec terminal reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take the exec terminal writer")?;

        self.bus.open(channel);
        let bus = self.bus.clone();
        let task_channel = channel.clone();
        let master = pair.master;
        let task = tokio::spawn(async move {
            let read_bus = bus.clone();
            let read_channel = task_channel.clone();
            if let Err(error) =
                tokio::task::spawn_blocking(move || pump_terminal(reader, &read_bus, &read_channel)).await
            {
                warn!(channel = %task_channel, "exec terminal reader failed: {error}");
            }
            let waited = tokio::task::spawn_blocking(move || {
                let status = child.wait();
                drop(master);
                status
            })
            .await;
            let payload = match waited {
                Ok(Ok(status)) if status.success() => json!({"kind": "COMPLETED"}),
                Ok(Ok(status)) => json!({
                    "kind": "ERROR",
                    "error": format!("kubectl exec exited with code {}", status.exit_code()),
                }),
                Ok(Err(error)) => json!({"kind": "ERROR", "error": format!("failed to wait for kubectl exec: {error}")}),
                Err(error) => json!({"kind": "ERROR", "error": format!("kubectl exec waiter failed: {error}")}),
            };
            bus.emit(&task_channel, payload);
        });
        Ok(ExecProcess {
            input: ExecInput::Pty(Arc::new(Mutex::new(Some(writer)))),
            killer: Some(killer),
            task,
        })
    }

    async fn pods(&self, cluster: &str, namespace: &str) -> Result<Api<Pod>> {
        let client = self.cluster_client(cluster).await?.client;
        Ok(Api::namespaced(client, namespace))
    }
}

/// A prefix unwatch reaches watch streams only; log streams close by exact name.
fn unwatch_reaches(channel: &ChannelId, stream: &TrackedStream, target: &str) -> bool {
    if target.ends_with('/') {
        stream.kind == StreamKind::Watch && channel.is_targeted_by(target)
    } else {
        channel.as_str() == target
    }
}

fn context_args(cluster: &str) -> Vec<String> {
    if cluster == IN_CLUSTER {
        Vec::new()
    } else {
        vec!["--context".to_string(), cluster.to_string()]
    }
}

fn exec_args(request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "-i".to_string()];
    if request.tty {
        args.push("-t".to_string());
    }
    args.extend(["-n".to_string(), request.namespace.clone(), request.target.clone()]);
    if let Some(container) = &request.container {
        args.extend(["-c".to_string(), container.clone()]);
    }
    args.push("--".to_string());
    args.extend(request.command.iter().cloned());
    args
}

fn port_forward_resource(kind: &str, target: &str) -> Result<String> {
    let prefix = match ResourceKind::from_token(kind) {
        Some(ResourceKind::Pods) => "pod",
        Some(ResourceKind::Services) => "service",
        Some(ResourceKind::Deployments) => "deployment",
        Some(ResourceKind::StatefulSets) => "statefulset",
        _ => anyhow::bail!("port-forward only supports pods, services, deployments and statefulsets"),
    };
    Ok(format!("{prefix}/{target}"))
}

fn spawn_watch_task(api: Api<DynamicObject>, bus: EventBus, channel: ChannelId) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut events = watcher(api.clone(), WatchConfig::default()).boxed();
            loop {
                let (kind, object) = match events.try_next().await {
                    Ok(Some(Event::InitApply(object))) => (WatchEventKind::Added, object),
                    Ok(Some(Event::Apply(object))) => (WatchEventKind::Modified, object),
                    Ok(Some(Event::Delete(object))) => (WatchEventKind::Deleted, object),
                    Ok(Some(Event::Init | Event::InitDone)) => continue,
                    Ok(None) => break,
                    Err(error) => {
                        warn!(channel = %channel, "watch stream error: {error}");
                        break;
                    }
                };
                let object = match serde_json::to_value(&object) {
                    Ok(object) => object,
                    Err(error) => {
                        warn!(channel = %channel, "failed to encode watched object: {error}");
                        continue;
                    }
                };
                if !bus.emit(&channel, json!({"kind": kind, "object": object})) {
                    debug!(channel = %channel, "watch channel closed, stopping");
                    return;
                }
            }
            tokio::time::sleep(WATCH_RESTART_DELAY).await;
            if !bus.is_open(&channel) {
                return;
            }
        }
    })
}

async fn pump_chunks<R>(mut reader: R, bus: &EventBus, channel: &ChannelId, kind: &str)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; EXEC_READ_CHUNK];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                let data = String::from_utf8_lossy(&buffer[..read]).to_string();
                bus.emit(channel, json!({"kind": kind, "data": data}));
            }
            Err(error) => {
                warn!(channel = %channel, "failed to read exec output: {error}");
                break;
            }
        }
    }
}

fn pump_terminal(mut reader: Box<dyn Read + Send>, bus: &EventBus, channel: &ChannelId) {
    let mut buffer = vec![0u8; EXEC_READ_CHUNK];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                let data = String::from_utf8_lossy(&buffer[..read]).to_string();
                bus.emit(channel, json!({"kind": "STDOUT", "data": data}));
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            // EIO once the child side of the terminal is gone.
            Err(error) => {
                debug!(channel = %channel, "exec terminal closed: {error}");
                break;
            }
        }
    }
}

async fn pump_lines<R>(reader: R, bus: &EventBus, channel: &ChannelId, kind: &str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                bus.emit(channel, json!({"kind": kind, "line": line}));
            }
            Ok(None) => break,
            Err(error) => {
                warn!(channel = %channel, "failed to read port-forward output: {error}");
                break;
            }
        }
    }
}

fn stream_scoped_tasks(apis: Vec<Api<DynamicObject>>, bus: &EventBus, channel: &ChannelId) -> Vec<JoinHandle<()>> {
    apis.into_iter()
        .map(|api| spawn_watch_task(api, bus.clone(), channel.clone()))
        .collect()
}

#[async_trait]
impl Backend for KubeBackend {
    async fn list(&self, scope: &WatchScope) -> anyhow::Result<Vec<Value>> {
        let mut items = Vec::new();
        for api in self.dynamic_apis(scope).await? {
            let listed = api
                .list(&ListParams::default())
                .await
                .with_context(|| format!("failed to list {} in {}", scope.kind, scope.cluster))?;
            for object in listed.items {
                items.push(serde_json::to_value(&object).context("failed to encode listed object")?);
            }
        }
        debug!(cluster = %scope.cluster, kind = %scope.kind, count = items.len(), "listed resources");
        Ok(items)
    }

    async fn watch(&self, scope: &WatchScope) -> anyhow::Result<ChannelId> {
        let apis = self.dynamic_apis(scope).await?;
        let channel = ChannelId::new(format!(
            "{}{}/{}",
            scope.cluster_prefix(),
            scope.kind,
            scope.namespaces.label()
        ));
        self.bus.open(&channel);
        let tasks = stream_scoped_tasks(apis, &self.bus, &channel);
        self.track_stream(&channel, StreamKind::Watch, tasks);
        Ok(channel)
    }

    async fn unwatch(&self, prefix_or_name: &str) -> anyhow::Result<()> {
        let stopped = {
            let mut streams = lock(&self.streams);
            let matching = streams
                .iter()
                .filter(|(channel, stream)| unwatch_reaches(channel, stream, prefix_or_name))
                .map(|(channel, _)| channel.clone())
                .collect::<Vec<_>>();
            matching
                .into_iter()
                .filter_map(|channel| streams.remove(&channel).map(|stream| (channel, stream)))
                .collect::<Vec<_>>()
        };
        for (channel, stream) in &stopped {
            stream.abort();
            self.bus.close(channel);
        }
        debug!(target = %prefix_or_name, stopped = stopped.len(), "unwatched channels");
        Ok(())
    }

    async fn exec_start(&self, request: &ExecRequest) -> anyhow::Result<SessionOpened> {
        let id = self.next_id();
        let channel = ChannelId::new(format!(
            "{}exec/{}/{}/{id}",
            cluster_prefix(&request.cluster),
            request.namespace,
            request.target
        ));
        let session_id = SessionId::new(format!("exec-{id}"));

        let process = if request.tty {
            self.spawn_pty_exec(request, &channel)?
        } else {
            self.spawn_piped_exec(request, &channel)?
        };
        lock(&self.execs).insert(session_id.clone(), process);
        debug!(session = %session_id, command = ?request.command, tty = request.tty, "exec started");
        Ok(SessionOpened {
            session_id,
            channel_id: channel,
        })
    }

    async fn exec_send(
        &self,
        session: &SessionId,
        input: &str,
        append_newline: bool,
    ) -> anyhow::Result<()> {
        let mut bytes = input.as_bytes().to_vec();
        if append_newline {
            bytes.push(b'\n');
        }
        let input = lock(&self.execs)
            .get(session)
            .map(|process| match &process.input {
                ExecInput::Pipe(stdin) => ExecInput::Pipe(Arc::clone(stdin)),
                ExecInput::Pty(writer) => ExecInput::Pty(Arc::clone(writer)),
            })
            .with_context(|| format!("unknown exec session {session}"))?;
        match input {
            ExecInput::Pipe(stdin) => {
                let mut stdin = stdin.lock().await;
                let writer = stdin
                    .as_mut()
                    .with_context(|| format!("stdin of {session} is closed"))?;
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            ExecInput::Pty(writer) => {
                let session = session.clone();
                tokio::task::spawn_blocking(move || -> Result<()> {
                    let mut writer = lock(&writer);
                    let terminal = writer
                        .as_mut()
                        .with_context(|| format!("terminal of {session} is closed"))?;
                    terminal.write_all(&bytes)?;
                    terminal.flush()?;
                    Ok(())
                })
                .await
                .context("exec terminal writer failed")??;
            }
        }
        Ok(())
    }

    async fn exec_stop(&self, session: &SessionId) -> anyhow::Result<()> {
        let mut process = lock(&self.execs)
            .remove(session)
            .with_context(|| format!("unknown exec session {session}"))?;
        match &process.input {
            ExecInput::Pipe(stdin) => {
                stdin.lock().await.take();
            }
            ExecInput::Pty(writer) => {
                lock(writer).take();
            }
        }
        process.kill();
        Ok(())
    }

    async fn logs_watch(&self, request: &LogRequest) -> anyhow::Result<ChannelId> {
        let pods = self.pods(&request.cluster, &request.namespace).await?;
        let params = LogParams {
            container: request.container.clone(),
            follow: true,
            tail_lines: request.tail_lines.map(i64::from),
            ..LogParams::default()
        };
        let stream = pods
            .log_stream(&request.target, &params)
            .await
            .with_context(|| {
                format!(
                    "failed to stream logs for {}/{}",
                    request.namespace, request.target
                )
            })?;

        let channel = ChannelId::new(format!(
            "{}logs/{}/{}/{}",
            cluster_prefix(&request.cluster),
            request.namespace,
            request.target,
            self.next_id()
        ));
        self.bus.open(&channel);
        let bus = self.bus.clone();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            let mut lines = stream.lines();
            loop {
                match lines.try_next().await {
                    Ok(Some(line)) => {
                        if !bus.emit(&task_channel, json!({"kind": "LOG_LINE", "log": line})) {
                            return;
                        }
                    }
                    Ok(None) => {
                        bus.emit(&task_channel, json!({"kind": "LOG_COMPLETED"}));
                        return;
                    }
                    Err(error) => {
                        bus.emit(
                            &task_channel,
                            json!({"kind": "LOG_ERROR", "error": error.to_string()}),
                        );
                        return;
                    }
                }
            }
        });
        self.track_stream(&channel, StreamKind::Logs, vec![task]);
        Ok(channel)
    }

    async fn logs_get(&self, request: &LogRequest) -> anyhow::Result<String> {
        let pods = self.pods(&request.cluster, &request.namespace).await?;
        let params = LogParams {
            container: request.container.clone(),
            tail_lines: request.tail_lines.map(i64::from),
            ..LogParams::default()
        };
        pods.logs(&request.target, &params).await.with_context(|| {
            format!(
                "failed to load logs for {}/{}",
                request.namespace, request.target
            )
        })
    }

    async fn port_forward_start(
        &self,
        request: &PortForwardRequest,
    ) -> anyhow::Result<SessionOpened> {
        let resource = port_forward_resource(&request.kind, &request.target)?;
        let id = self.next_id();
        let channel = ChannelId::new(format!(
            "{}pf/{}/{}/{id}",
            cluster_prefix(&request.cluster),
            request.namespace,
            request.target
        ));
        let session_id = SessionId::new(format!("pf-{id}"));

        let mut child = self
            .command(&request.cluster)
            .arg("port-forward")
            .arg("-n")
            .arg(&request.namespace)
            .arg(&resource)
            .arg(format!("{}:{}", request.local_port, request.remote_port))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn port-forward for {}/{resource}",
                    request.namespace
                )
            })?;
        let stdout = child
            .stdout
            .take()
            .context("kubectl port-forward stdout is unavailable")?;
        let stderr = child
            .stderr
            .take()
            .context("kubectl port-forward stderr is unavailable")?;

        self.bus.open(&channel);
        let bus = self.bus.clone();
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            tokio::join!(
                pump_lines(stdout, &bus, &task_channel, "PF_STDOUT"),
                pump_lines(stderr, &bus, &task_channel, "PF_STDERR"),
            );
            let payload = match child.wait().await {
                Ok(status) if status.success() => json!({"kind": "PF_DONE"}),
                Ok(status) => json!({"kind": "PF_ERROR", "line": format!("kubectl port-forward exited with {status}")}),
                Err(error) => json!({"kind": "PF_ERROR", "line": format!("failed to wait for kubectl port-forward: {error}")}),
            };
            bus.emit(&task_channel, payload);
        });

        let info = PortForwardInfo {
            session_id: session_id.clone(),
            cluster: request.cluster.clone(),
            namespace: request.namespace.clone(),
            target: resource,
            local_port: request.local_port,
            remote_port: request.remote_port,
            started_at: Utc::now(),
        };
        lock(&self.forwards).insert(session_id.clone(), ForwardProcess { info, task });
        info!(session = %session_id, local = request.local_port, remote = request.remote_port, "port-forward started");
        Ok(SessionOpened {
            session_id,
            channel_id: channel,
        })
    }

    async fn port_forward_stop(&self, session: &SessionId) -> anyhow::Result<()> {
        let process = lock(&self.forwards)
            .remove(session)
            .with_context(|| format!("unknown port-forward session {session}"))?;
        process.task.abort();
        Ok(())
    }

    async fn port_forward_list(&self) -> anyhow::Result<Vec<PortForwardInfo>> {
        let mut forwards = lock(&self.forwards);
        forwards.retain(|_, process| !process.task.is_finished());
        let mut infos = forwards
            .values()
            .map(|process| process.info.clone())
            .collect::<Vec<_>>();
        infos.sort_by_key(|info| info.started_at);
        Ok(infos)
    }
}

impl Drop for KubeBackend {
    fn drop(&mut self) {
        for stream in lock(&self.streams).values() {
            stream.abort();
        }
        for process in lock(&self.execs).values_mut() {
            process.kill();
        }
        for process in lock(&self.forwards).values() {
            process.task.abort();
        }
    }
}
