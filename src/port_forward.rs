//! Port-forward tunnels and the periodic refresh of the backend's tunnel list.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Backend, PortForwardInfo, PortForwardRequest, SessionOpened, SyncContext};
use crate::bus::guarded;
use crate::error::{Result, with_deadline};
use crate::model::{ChannelId, PortForwardEvent, SessionHandle, SessionId};
use crate::session::{EventHandler, SessionChannel, SessionKind, StreamSignal, event_handler};

#[derive(Debug, Clone, Copy, Default)]
pub struct PortForwardKind;

#[async_trait]
impl SessionKind for PortForwardKind {
    type Args = PortForwardRequest;
    type Event = PortForwardEvent;

    const NAME: &'static str = "port-forward";

    async fn open(
        &self,
        backend: &dyn Backend,
        args: &PortForwardRequest,
    ) -> anyhow::Result<SessionOpened> {
        backend.port_forward_start(args).await
    }

    async fn close(&self, backend: &dyn Backend, session: &SessionId) -> anyhow::Result<()> {
        backend.port_forward_stop(session).await
    }

    fn classify(event: &PortForwardEvent) -> StreamSignal {
        match event {
            PortForwardEvent::PfStdout { .. } | PortForwardEvent::PfStderr { .. } => {
                StreamSignal::Data
            }
            PortForwardEvent::PfError { line } => StreamSignal::Error(
                line.clone()
                    .unwrap_or_else(|| "port-forward failed".to_string()),
            ),
            PortForwardEvent::PfDone => StreamSignal::Completed,
        }
    }
}

/// What a tunnel forwards to; ports are chosen per `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardTarget {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub target: String,
}

impl PortForwardTarget {
    fn request(&self, local_port: u16, remote_port: u16) -> PortForwardRequest {
        PortForwardRequest {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            kind: self.kind.clone(),
            target: self.target.clone(),
            local_port,
            remote_port,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PortForwardSession {
    channel: SessionChannel<PortForwardKind>,
    target: PortForwardTarget,
    lines: Arc<Mutex<Vec<String>>>,
}

impl PortForwardSession {
    pub fn new(ctx: SyncContext, target: PortForwardTarget) -> Self {
        Self {
            channel: SessionChannel::new(PortForwardKind, ctx),
            target,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn target(&self) -> &PortForwardTarget {
        &self.target
    }

    /// True from a successful start until stop or a terminal event.
    pub fn running(&self) -> bool {
        self.channel.is_active()
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.channel.last_error()
    }

    pub async fn start(&self, local_port: u16, remote_port: u16) -> Result<Option<SessionHandle>> {
        let noop = event_handler(|_event: &PortForwardEvent| Ok(()));
        self.start_with(local_port, remote_port, noop).await
    }

    pub async fn start_with(
        &self,
        local_port: u16,
        remote_port: u16,
        on_event: EventHandler<PortForwardEvent>,
    ) -> Result<Option<SessionHandle>> {
        let lines = Arc::clone(&self.lines);
        let handler = event_handler(move |event: &PortForwardEvent| {
            let line = match event {
                PortForwardEvent::PfStdout { line } | PortForwardEvent::PfStderr { line } => {
                    Some(line.clone())
                }
                PortForwardEvent::PfError { line } => line.clone(),
                PortForwardEvent::PfDone => None,
            };
            if let Some(line) = line {
                lock(&lines).push(line);
            }
            on_event(event)
        });
        self.channel
            .start(self.target.request(local_port, remote_port), handler)
            .await
    }

    pub async fn stop(&self) {
        self.channel.stop().await;
    }
}

/// Polls `port_forward_list` on a fixed interval and publishes changes.
pub struct PortForwardMonitor {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PortForwardMonitor {
    pub fn spawn<F>(ctx: SyncContext, on_update: F) -> Self
    where
        F: Fn(&[PortForwardInfo]) + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let origin = ChannelId::from("port-forwards");
            let mut ticker = interval(ctx.config.port_forward_refresh());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<Vec<PortForwardInfo>> = None;
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let listed = with_deadline(
                    "port-forward-list",
                    ctx.config.list_timeout(),
                    ctx.backend.port_forward_list(),
                )
                .await;
                match listed {
                    Ok(forwards) if last.as_ref() != Some(&forwards) => {
                        debug!(count = forwards.len(), "port-forward list changed");
                        guarded(&origin, || on_update(&forwards));
                        last = Some(forwards);
                    }
                    Ok(_) => {}
                    Err(error) => warn!("{error}"),
                }
            }
        });
        Self { token, task }
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for PortForwardMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
