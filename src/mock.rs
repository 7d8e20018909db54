//! Scriptable in-memory backend for tests.
//!
//! Records every call in order and answers from pre-configured responses.
//! Session scripts are emitted into the freshly opened channel before the
//! open call returns; the bus backlog hands them to the first listener.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::backend::{
    Backend, ExecRequest, LogRequest, PortForwardInfo, PortForwardRequest, SessionOpened,
    WatchScope, cluster_prefix,
};
use crate::bus::EventBus;
use crate::model::{ChannelId, SessionId};

/// A recorded call to the mock backend.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    List(WatchScope),
    Watch(WatchScope),
    Unwatch(String),
    ExecStart(ExecRequest),
    ExecSend {
        session: SessionId,
        input: String,
        append_newline: bool,
    },
    ExecStop(SessionId),
    LogsWatch(LogRequest),
    LogsGet(LogRequest),
    PortForwardStart(PortForwardRequest),
    PortForwardStop(SessionId),
    PortForwardList,
}

/// How one session-open call behaves.
#[derive(Debug, Clone)]
pub enum SessionScript {
    /// The open call itself fails.
    Fail(String),
    /// The open succeeds and these payloads are queued on the channel.
    Emit(Vec<Value>),
    /// The open succeeds after `delay`, then queues the payloads.
    Delayed(Duration, Vec<Value>),
    /// The open never returns.
    Hang,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockBackend {
    bus: EventBus,
    next_id: AtomicU64,
    calls: Mutex<Vec<MockCall>>,
    list_items: Mutex<Vec<Value>>,
    list_results: Mutex<VecDeque<Result<Vec<Value>, String>>>,
    list_delay: Mutex<Option<Duration>>,
    watch_error: Mutex<Option<String>>,
    watch_delay: Mutex<Option<Duration>>,
    watch_payloads: Mutex<Vec<Value>>,
    unwatch_error: Mutex<Option<String>>,
    unwatch_hang: Mutex<bool>,
    watch_channels: Mutex<Vec<ChannelId>>,
    stop_error: Mutex<Option<String>>,
    exec_scripts: Mutex<VecDeque<SessionScript>>,
    log_scripts: Mutex<VecDeque<SessionScript>>,
    port_forward_scripts: Mutex<VecDeque<SessionScript>>,
    logs_text: Mutex<String>,
    port_forwards: Mutex<Vec<PortForwardInfo>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_bus(EventBus::new())
    }

    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            bus,
            next_id: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            list_items: Mutex::new(Vec::new()),
            list_results: Mutex::new(VecDeque::new()),
            list_delay: Mutex::new(None),
            watch_error: Mutex::new(None),
            watch_delay: Mutex::new(None),
            watch_payloads: Mutex::new(Vec::new()),
            unwatch_error: Mutex::new(None),
            unwatch_hang: Mutex::new(false),
            watch_channels: Mutex::new(Vec::new()),
            stop_error: Mutex::new(None),
            exec_scripts: Mutex::new(VecDeque::new()),
            log_scripts: Mutex::new(VecDeque::new()),
            port_forward_scripts: Mutex::new(VecDeque::new()),
            logs_text: Mutex::new(String::new()),
            port_forwards: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Items returned by every `list` call without a queued result.
    pub fn with_list(self, items: Vec<Value>) -> Self {
        *lock(&self.list_items) = items;
        self
    }

    /// Queues the outcome of the next `list` call.
    pub fn push_list_result(&self, result: Result<Vec<Value>, String>) {
        lock(&self.list_results).push_back(result);
    }

    pub fn with_list_delay(self, delay: Duration) -> Self {
        *lock(&self.list_delay) = Some(delay);
        self
    }

    pub fn with_watch_error(self, message: &str) -> Self {
        *lock(&self.watch_error) = Some(message.to_string());
        self
    }

    pub fn with_watch_delay(self, delay: Duration) -> Self {
        *lock(&self.watch_delay) = Some(delay);
        self
    }

    /// Watch payloads queued on each new watch channel before `watch` returns.
    pub fn with_watch_payloads(self, payloads: Vec<Value>) -> Self {
        *lock(&self.watch_payloads) = payloads;
        self
    }

    pub fn with_unwatch_error(self, message: &str) -> Self {
        *lock(&self.unwatch_error) = Some(message.to_string());
        self
    }

    /// `unwatch` records the call and then never returns.
    pub fn with_unwatch_hang(self) -> Self {
        *lock(&self.unwatch_hang) = true;
        self
    }

    pub fn with_stop_error(self, message: &str) -> Self {
        *lock(&self.stop_error) = Some(message.to_string());
        self
    }

    pub fn with_logs_text(self, text: &str) -> Self {
        *lock(&self.logs_text) = text.to_string();
        self
    }

    pub fn push_exec_script(&self, script: SessionScript) {
        lock(&self.exec_scripts).push_back(script);
    }

    pub fn push_log_script(&self, script: SessionScript) {
        lock(&self.log_scripts).push_back(script);
    }

    pub fn push_port_forward_script(&self, script: SessionScript) {
        lock(&self.port_forward_scripts).push_back(script);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn exec_starts(&self) -> Vec<ExecRequest> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                MockCall::ExecStart(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn open_scripted(
        &self,
        scripts: &Mutex<VecDeque<SessionScript>>,
        channel: ChannelId,
    ) -> anyhow::Result<ChannelId> {
        let script = lock(scripts)
            .pop_front()
            .unwrap_or(SessionScript::Emit(Vec::new()));
        match script {
            SessionScript::Fail(message) => Err(anyhow::anyhow!(message)),
            SessionScript::Hang => std::future::pending().await,
            SessionScript::Delayed(delay, payloads) => {
                tokio::time::sleep(delay).await;
                self.emit_all(&channel, payloads);
                Ok(channel)
            }
            SessionScript::Emit(payloads) => {
                self.emit_all(&channel, payloads);
                Ok(channel)
            }
        }
    }

    fn emit_all(&self, channel: &ChannelId, payloads: Vec<Value>) {
        self.bus.open(channel);
        for payload in payloads {
            self.bus.emit(channel, payload);
        }
    }

    fn stop_result(&self) -> anyhow::Result<()> {
        match lock(&self.stop_error).clone() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn list(&self, scope: &WatchScope) -> anyhow::Result<Vec<Value>> {
        self.record(MockCall::List(scope.clone()));
        let delay = *lock(&self.list_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let queued = lock(&self.list_results).pop_front();
        match queued {
            Some(Ok(items)) => Ok(items),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(lock(&self.list_items).clone()),
        }
    }

    async fn watch(&self, scope: &WatchScope) -> anyhow::Result<ChannelId> {
        self.record(MockCall::Watch(scope.clone()));
        let delay = *lock(&self.watch_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = lock(&self.watch_error).clone() {
            anyhow::bail!(message);
        }
        // Deterministic per scope, so a re-mounted view finds its cache entry.
        let channel = ChannelId::new(format!(
            "{}{}/{}",
            scope.cluster_prefix(),
            scope.kind,
            scope.namespaces.label()
        ));
        {
            let mut watches = lock(&self.watch_channels);
            if !watches.contains(&channel) {
                watches.push(channel.clone());
            }
        }
        self.bus.open(&channel);
        let payloads = lock(&self.watch_payloads).clone();
        for payload in payloads {
            self.bus.emit(&channel, payload);
        }
        Ok(channel)
    }

    async fn unwatch(&self, prefix_or_name: &str) -> anyhow::Result<()> {
        self.record(MockCall::Unwatch(prefix_or_name.to_string()));
        if *lock(&self.unwatch_hang) {
            std::future::pending::<()>().await;
        }
        if let Some(message) = lock(&self.unwatch_error).clone() {
            anyhow::bail!(message);
        }
        // A prefix reaches watch channels only; sessions on the cluster stay open.
        let mut closed = {
            let mut watches = lock(&self.watch_channels);
            let (closed, kept) = watches
                .drain(..)
                .partition::<Vec<_>, _>(|channel| channel.is_targeted_by(prefix_or_name));
            *watches = kept;
            closed
        };
        if !prefix_or_name.ends_with('/') && closed.is_empty() {
            closed.push(ChannelId::from(prefix_or_name));
        }
        for channel in &closed {
            self.bus.close(channel);
        }
        Ok(())
    }

    async fn exec_start(&self, request: &ExecRequest) -> anyhow::Result<SessionOpened> {
        self.record(MockCall::ExecStart(request.clone()));
        let id = self.next_id();
        let channel = ChannelId::new(format!(
            "{}exec/{}/{}/{id}",
            cluster_prefix(&request.cluster),
            request.namespace,
            request.target
        ));
        let channel_id = self.open_scripted(&self.exec_scripts, channel).await?;
        Ok(SessionOpened {
            session_id: SessionId::new(format!("exec-{id}")),
            channel_id,
        })
    }

    async fn exec_send(
        &self,
        session: &SessionId,
        input: &str,
        append_newline: bool,
    ) -> anyhow::Result<()> {
        self.record(MockCall::ExecSend {
            session: session.clone(),
            input: input.to_string(),
            append_newline,
        });
        Ok(())
    }

    async fn exec_stop(&self, session: &SessionId) -> anyhow::Result<()> {
        self.record(MockCall::ExecStop(session.clone()));
        self.stop_result()
    }

    async fn logs_watch(&self, request: &LogRequest) -> anyhow::Result<ChannelId> {
        self.record(MockCall::LogsWatch(request.clone()));
        let channel = ChannelId::new(format!(
            "{}logs/{}/{}/{}",
            cluster_prefix(&request.cluster),
            request.namespace,
            request.target,
            self.next_id()
        ));
        self.open_scripted(&self.log_scripts, channel).await
    }

    async fn logs_get(&self, request: &LogRequest) -> anyhow::Result<String> {
        self.record(MockCall::LogsGet(request.clone()));
        Ok(lock(&self.logs_text).clone())
    }

    async fn port_forward_start(
        &self,
        request: &PortForwardRequest,
    ) -> anyhow::Result<SessionOpened> {
        self.record(MockCall::PortForwardStart(request.clone()));
        let id = self.next_id();
        let channel = ChannelId::new(format!(
            "{}pf/{}/{}/{id}",
            cluster_prefix(&request.cluster),
            request.namespace,
            request.target
        ));
        let channel_id = self
            .open_scripted(&self.port_forward_scripts, channel)
            .await?;
        let session_id = SessionId::new(format!("pf-{id}"));
        lock(&self.port_forwards).push(PortForwardInfo {
            session_id: session_id.clone(),
            cluster: request.cluster.clone(),
            namespace: request.namespace.clone(),
            target: request.target.clone(),
            local_port: request.local_port,
            remote_port: request.remote_port,
            started_at: Utc::now(),
        });
        Ok(SessionOpened {
            session_id,
            channel_id,
        })
    }

    async fn port_forward_stop(&self, session: &SessionId) -> anyhow::Result<()> {
        self.record(MockCall::PortForwardStop(session.clone()));
        lock(&self.port_forwards).retain(|info| &info.session_id != session);
        self.stop_result()
    }

    async fn port_forward_list(&self) -> anyhow::Result<Vec<PortForwardInfo>> {
        self.record(MockCall::PortForwardList);
        Ok(lock(&self.port_forwards).clone())
    }
}
