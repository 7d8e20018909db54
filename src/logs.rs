//! Follow-mode log tailing with a local append-only buffer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{Backend, LogRequest, SessionOpened, SyncContext};
use crate::error::{Result, with_deadline};
use crate::model::{LogEvent, SessionHandle, SessionId};
use crate::session::{EventHandler, SessionChannel, SessionKind, StreamSignal, event_handler};

/// Log streams are plain watch channels: the channel id doubles as the session id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogKind;

#[async_trait]
impl SessionKind for LogKind {
    type Args = LogRequest;
    type Event = LogEvent;

    const NAME: &'static str = "logs";

    async fn open(&self, backend: &dyn Backend, args: &LogRequest) -> anyhow::Result<SessionOpened> {
        let channel_id = backend.logs_watch(args).await?;
        Ok(SessionOpened {
            session_id: SessionId::new(channel_id.as_str()),
            channel_id,
        })
    }

    async fn close(&self, backend: &dyn Backend, session: &SessionId) -> anyhow::Result<()> {
        backend.unwatch(session.as_str()).await
    }

    fn classify(event: &LogEvent) -> StreamSignal {
        match event {
            LogEvent::LogLine { .. } => StreamSignal::Data,
            LogEvent::LogError { error } => StreamSignal::Error(
                error
                    .clone()
                    .unwrap_or_else(|| "log stream failed".to_string()),
            ),
            LogEvent::LogCompleted => StreamSignal::Completed,
        }
    }
}

pub struct LogStreamSession {
    channel: SessionChannel<LogKind>,
    request: Mutex<LogRequest>,
    buffer: Arc<Mutex<String>>,
    on_event: Mutex<Option<EventHandler<LogEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogStreamSession {
    /// A request without `tail_lines` uses the configured default.
    pub fn new(ctx: SyncContext, mut request: LogRequest) -> Self {
        if request.tail_lines.is_none() {
            request.tail_lines = Some(ctx.config.log_tail_lines);
        }
        Self {
            channel: SessionChannel::new(LogKind, ctx),
            request: Mutex::new(request),
            buffer: Arc::new(Mutex::new(String::new())),
            on_event: Mutex::new(None),
        }
    }

    pub fn request(&self) -> LogRequest {
        lock(&self.request).clone()
    }

    pub fn buffer(&self) -> String {
        lock(&self.buffer).clone()
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    pub fn last_error(&self) -> Option<String> {
        self.channel.last_error()
    }

    pub async fn start(&self) -> Result<Option<SessionHandle>> {
        let noop = event_handler(|_event: &LogEvent| Ok(()));
        self.start_with(noop).await
    }

    /// Starts tailing; `on_event` also receives every event after it is buffered.
    /// A call that finds the stream already running keeps the current consumer.
    pub async fn start_with(&self, on_event: EventHandler<LogEvent>) -> Result<Option<SessionHandle>> {
        let consumer = Arc::clone(&on_event);
        let buffer = Arc::clone(&self.buffer);
        let handler = event_handler(move |event: &LogEvent| {
            if let LogEvent::LogLine { log } = event {
                let mut buffer = lock(&buffer);
                buffer.push_str(log);
                buffer.push('\n');
            }
            consumer(event)
        });
        let started = self.channel.start(self.request(), handler).await?;
        if started.is_some() {
            *lock(&self.on_event) = Some(on_event);
        }
        Ok(started)
    }

    /// Restarts the stream with a new tail length; the buffer starts over.
    pub async fn set_tail_lines(&self, tail_lines: u32) -> Result<Option<SessionHandle>> {
        self.channel.stop().await;
        lock(&self.request).tail_lines = Some(tail_lines);
        self.clear();
        debug!(tail_lines, "restarting log stream");
        let on_event = lock(&self.on_event).clone();
        match on_event {
            Some(on_event) => self.start_with(on_event).await,
            None => self.start().await,
        }
    }

    /// Empties the local buffer; the backend stream is untouched.
    pub fn clear(&self) {
        lock(&self.buffer).clear();
    }

    /// One-shot fetch of the current log tail, independent of the stream.
    pub async fn fetch_once(&self) -> Result<String> {
        let request = self.request();
        let ctx = self.channel.context();
        with_deadline(
            "logs-get",
            ctx.config.list_timeout(),
            ctx.backend.logs_get(&request),
        )
        .await
    }

    pub async fn stop(&self) {
        self.channel.stop().await;
    }
}
