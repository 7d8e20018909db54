//! Generic lifecycle of one interactive session channel (exec, logs, port-forward).
//!
//! `start` opens the session on the backend and subscribes to its channel;
//! every inbound event is interpreted for bookkeeping (`ERROR` records the
//! error and deactivates, `COMPLETED` deactivates) and then forwarded to the
//! consumer. `stop` always leaves the session inactive, even when the backend
//! close fails.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, SessionOpened, SyncContext};
use crate::bus::{Listener, guarded};
use crate::error::{Result, SyncError, with_deadline};
use crate::model::{ChannelId, SessionHandle, SessionId};

/// Consumer callback for decoded session events. Errors are logged, never propagated.
pub type EventHandler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

pub fn event_handler<E, F>(handler: F) -> EventHandler<E>
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// How one event affects the session's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Data,
    Error(String),
    Completed,
}

/// One flavour of backend session.
#[async_trait]
pub trait SessionKind: Send + Sync + 'static {
    type Args: Send + Sync;
    type Event: DeserializeOwned + Send + Sync + 'static;

    const NAME: &'static str;

    async fn open(&self, backend: &dyn Backend, args: &Self::Args) -> anyhow::Result<SessionOpened>;

    async fn close(&self, backend: &dyn Backend, session: &SessionId) -> anyhow::Result<()>;

    async fn send(
        &self,
        _backend: &dyn Backend,
        _session: &SessionId,
        _input: &str,
        _append_newline: bool,
    ) -> anyhow::Result<()> {
        anyhow::bail!("{} sessions do not accept input", Self::NAME)
    }

    fn classify(event: &Self::Event) -> StreamSignal;
}

#[derive(Default)]
struct SessionState {
    handle: Option<SessionHandle>,
    listener: Option<Listener>,
    starting: bool,
    error: Option<String>,
    token: CancellationToken,
}

pub struct SessionChannel<K: SessionKind> {
    kind: Arc<K>,
    ctx: SyncContext,
    state: Arc<Mutex<SessionState>>,
}

impl<K: SessionKind> Clone for SessionChannel<K> {
    fn clone(&self) -> Self {
        Self {
            kind: Arc::clone(&self.kind),
            ctx: self.ctx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: SessionKind> SessionChannel<K> {
    pub fn new(kind: K, ctx: SyncContext) -> Self {
        Self {
            kind: Arc::new(kind),
            ctx,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        lock(&self.state).handle.clone()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state)
            .handle
            .as_ref()
            .is_some_and(|handle| handle.active)
    }

    /// Last in-band error or failed start, cleared by the next successful start.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    /// Opens a session unless one is already active or starting.
    ///
    /// Returns `Ok(None)` when the call was a no-op, or when the session was
    /// stopped while the open was still in flight.
    pub async fn start(
        &self,
        args: K::Args,
        on_event: EventHandler<K::Event>,
    ) -> Result<Option<SessionHandle>> {
        let (token, lingering) = {
            let mut state = lock(&self.state);
            let active = state.handle.as_ref().is_some_and(|handle| handle.active);
            if state.starting || active {
                debug!(kind = K::NAME, "session already running, ignoring start");
                return Ok(None);
            }
            state.starting = true;
            state.token = CancellationToken::new();
            if let Some(listener) = state.listener.take() {
                listener.dispose();
            }
            (state.token.clone(), state.handle.take())
        };

        if let Some(handle) = lingering {
            self.release(&handle).await;
        }

        let opened = with_deadline(
            "session-start",
            self.ctx.config.session_start_timeout(),
            self.kind.open(self.ctx.backend.as_ref(), &args),
        )
        .await;

        let opened = {
            let mut state = lock(&self.state);
            state.starting = false;
            match opened {
                Err(error) => {
                    if !token.is_cancelled() {
                        state.error = Some(error.to_string());
                    }
                    return Err(error);
                }
                Ok(opened) if token.is_cancelled() => Err(opened),
                Ok(opened) => {
                    state.error = None;
                    state.handle = Some(SessionHandle {
                        session_id: opened.session_id.clone(),
                        channel_id: opened.channel_id.clone(),
                        active: true,
                    });
                    Ok(opened)
                }
            }
        };

        let opened = match opened {
            Ok(opened) => opened,
            Err(late) => {
                info!(kind = K::NAME, session = %late.session_id, "session stopped while opening, closing it");
                self.release(&SessionHandle {
                    session_id: late.session_id,
                    channel_id: late.channel_id,
                    active: false,
                })
                .await;
                return Ok(None);
            }
        };

        let handler = dispatcher::<K>(
            Arc::clone(&self.state),
            opened.channel_id.clone(),
            token.clone(),
            on_event,
        );
        let listener = self.ctx.bus.listen(&opened.channel_id, handler);

        let mut state = lock(&self.state);
        if token.is_cancelled() {
            listener.dispose();
            return Ok(None);
        }
        state.listener = Some(listener);
        debug!(kind = K::NAME, session = %opened.session_id, channel = %opened.channel_id, "session started");
        Ok(state.handle.clone())
    }

    /// Sends raw input. A no-op while the session is not active.
    pub async fn send(&self, input: &str) -> Result<()> {
        self.send_input(input, false).await
    }

    pub(crate) async fn send_input(&self, input: &str, append_newline: bool) -> Result<()> {
        let Some(session) = self
            .handle()
            .filter(|handle| handle.active)
            .map(|handle| handle.session_id)
        else {
            debug!(kind = K::NAME, "dropping input for inactive session");
            return Ok(());
        };
        with_deadline(
            "session-send",
            self.ctx.config.session_stop_timeout(),
            self.kind
                .send(self.ctx.backend.as_ref(), &session, input, append_newline),
        )
        .await
    }

    /// Unsubscribes and closes the backend session. Idempotent; never fails.
    pub async fn stop(&self) {
        let (handle, listener) = {
            let mut state = lock(&self.state);
            state.token.cancel();
            state.starting = false;
            (state.handle.take(), state.listener.take())
        };
        if let Some(listener) = listener {
            listener.dispose();
        }
        if let Some(handle) = handle {
            self.release(&handle).await;
        }
    }

    async fn release(&self, handle: &SessionHandle) {
        self.ctx.bus.close(&handle.channel_id);
        let closed = with_deadline(
            "session-stop",
            self.ctx.config.session_stop_timeout(),
            self.kind
                .close(self.ctx.backend.as_ref(), &handle.session_id),
        )
        .await;
        match closed {
            Ok(()) => debug!(kind = K::NAME, session = %handle.session_id, "session closed"),
            Err(error) => warn!(kind = K::NAME, session = %handle.session_id, "{error}"),
        }
    }
}

fn dispatcher<K: SessionKind>(
    state: Arc<Mutex<SessionState>>,
    channel: ChannelId,
    token: CancellationToken,
    on_event: EventHandler<K::Event>,
) -> impl Fn(&Value) + Send + Sync + 'static {
    move |payload: &Value| {
        if token.is_cancelled() {
            return;
        }
        let event = match serde_json::from_value::<K::Event>(payload.clone()) {
            Ok(event) => event,
            Err(source) => {
                let error = SyncError::Decode {
                    channel: channel.clone(),
                    source,
                };
                warn!(channel = %channel, "{error}");
                return;
            }
        };

        let signal = K::classify(&event);
        if signal != StreamSignal::Data {
            let mut guard = lock(&state);
            let state = &mut *guard;
            let current = state
                .handle
                .as_mut()
                .filter(|handle| handle.channel_id == channel);
            if let Some(handle) = current {
                handle.active = false;
                if let StreamSignal::Error(message) = &signal {
                    let error = SyncError::Stream {
                        channel: channel.clone(),
                        message: message.clone(),
                    };
                    info!(channel = %channel, "{error}");
                    state.error = Some(message.clone());
                }
            }
        }

        guarded(&channel, || {
            if let Err(failure) = on_event(&event) {
                let error = SyncError::ConsumerCallback {
                    channel: channel.clone(),
                    message: format!("{failure:#}"),
                };
                error!(channel = %channel, "{error}");
            }
        });
    }
}
