use async_trait::async_trait;

use crate::backend::{Backend, ExecRequest, SessionOpened};
use crate::error::Result;
use crate::model::{ExecEvent, SessionId};
use crate::session::{SessionChannel, SessionKind, StreamSignal};

/// Remote command execution inside a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecKind;

pub type ExecSession = SessionChannel<ExecKind>;

#[async_trait]
impl SessionKind for ExecKind {
    type Args = ExecRequest;
    type Event = ExecEvent;

    const NAME: &'static str = "exec";

    async fn open(&self, backend: &dyn Backend, args: &ExecRequest) -> anyhow::Result<SessionOpened> {
        backend.exec_start(args).await
    }

    async fn close(&self, backend: &dyn Backend, session: &SessionId) -> anyhow::Result<()> {
        backend.exec_stop(session).await
    }

    async fn send(
        &self,
        backend: &dyn Backend,
        session: &SessionId,
        input: &str,
        append_newline: bool,
    ) -> anyhow::Result<()> {
        backend.exec_send(session, input, append_newline).await
    }

    fn classify(event: &ExecEvent) -> StreamSignal {
        match event {
            ExecEvent::Stdout { .. } | ExecEvent::Stderr { .. } => StreamSignal::Data,
            ExecEvent::Error { error } => StreamSignal::Error(
                error
                    .clone()
                    .unwrap_or_else(|| "exec session failed".to_string()),
            ),
            ExecEvent::Completed => StreamSignal::Completed,
        }
    }
}

impl SessionChannel<ExecKind> {
    /// Sends `input` followed by a newline, as typed at a prompt.
    pub async fn send_line(&self, input: &str) -> Result<()> {
        self.send_input(input, true).await
    }
}
