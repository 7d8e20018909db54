//! Interactive shell negotiation over an exec session.
//!
//! Candidates are tried in order until one writes to stdout and then stays
//! alive for a short settle window. Stderr alone does not count. Under a TTY
//! the runtime's "executable not found" message arrives on stdout, so output
//! followed by an exit inside the settle window is still a failed attempt.
//! A failed start, an in-band `ERROR`, or a `COMPLETED` before the shell has
//! settled moves on to the next candidate after a short debounce. If an
//! attempt stays silent for the whole grace window, negotiation gives up. The
//! transition function is pure; the async driver only turns its actions into
//! session calls and timers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::backend::{ExecRequest, SyncContext};
use crate::exec::{ExecKind, ExecSession};
use crate::model::{ExecCandidate, ExecEvent};
use crate::session::{EventHandler, event_handler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    Connecting { attempt: usize },
    /// Printed something; waiting out the settle window.
    Settling { attempt: usize },
    Retrying { next: usize },
    Connected { attempt: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationInput {
    Begin,
    StartFailed(String),
    Output,
    StreamError(String),
    Completed,
    DebounceElapsed,
    GraceElapsed,
    SettleElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    /// Start the candidate at this index.
    Start(usize),
    ArmGrace,
    /// Replaces the grace timer with the settle timer.
    ArmSettle,
    ScheduleDebounce,
    Surface(ShellOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutcome {
    Connected {
        candidate: ExecCandidate,
        attempts: usize,
    },
    Failed {
        reason: String,
        attempts: usize,
    },
}

impl ShellOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Pure negotiation state machine.
#[derive(Debug, Clone)]
pub struct Negotiation {
    candidates: Vec<ExecCandidate>,
    state: ShellState,
    attempts: usize,
}

impl Negotiation {
    pub fn new(candidates: Vec<ExecCandidate>) -> Self {
        Self {
            candidates,
            state: ShellState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &ShellState {
        &self.state
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn candidate(&self, index: usize) -> Option<&ExecCandidate> {
        self.candidates.get(index)
    }

    /// Index of the attempt whose stream signals are still relevant.
    pub fn current_attempt(&self) -> Option<usize> {
        match self.state {
            ShellState::Connecting { attempt } | ShellState::Settling { attempt } => Some(attempt),
            _ => None,
        }
    }

    pub fn advance(&mut self, input: NegotiationInput) -> Vec<NegotiationAction> {
        match (self.state.clone(), input) {
            (ShellState::Idle, NegotiationInput::Begin) => {
                if self.candidates.is_empty() {
                    self.fail("no shell candidates configured".to_string())
                } else {
                    self.connect(0)
                }
            }
            (ShellState::Connecting { attempt }, NegotiationInput::Output) => {
                self.state = ShellState::Settling { attempt };
                vec![NegotiationAction::ArmSettle]
            }
            (ShellState::Settling { attempt }, NegotiationInput::SettleElapsed) => {
                self.state = ShellState::Connected { attempt };
                let candidate = self.candidates[attempt].clone();
                vec![NegotiationAction::Surface(ShellOutcome::Connected {
                    candidate,
                    attempts: self.attempts,
                })]
            }
            (
                ShellState::Connecting { attempt } | ShellState::Settling { attempt },
                NegotiationInput::StartFailed(reason) | NegotiationInput::StreamError(reason),
            ) => self.retry_or_fail(attempt, &reason),
            (ShellState::Connecting { attempt }, NegotiationInput::Completed) => {
                self.retry_or_fail(attempt, "exited before producing output")
            }
            (ShellState::Settling { attempt }, NegotiationInput::Completed) => {
                self.retry_or_fail(attempt, "exited right after its first output")
            }
            (ShellState::Connecting { .. }, NegotiationInput::GraceElapsed) => {
                self.fail("shell did not respond in time".to_string())
            }
            (ShellState::Retrying { next }, NegotiationInput::DebounceElapsed) => {
                self.connect(next)
            }
            _ => Vec::new(),
        }
    }

    fn connect(&mut self, attempt: usize) -> Vec<NegotiationAction> {
        self.state = ShellState::Connecting { attempt };
        self.attempts += 1;
        vec![NegotiationAction::ArmGrace, NegotiationAction::Start(attempt)]
    }

    fn retry_or_fail(&mut self, attempt: usize, reason: &str) -> Vec<NegotiationAction> {
        let label = self.candidates[attempt].label();
        debug!(candidate = %label, "{reason}");
        let next = attempt + 1;
        if next < self.candidates.len() {
            self.state = ShellState::Retrying { next };
            vec![NegotiationAction::ScheduleDebounce]
        } else {
            let tried = self
                .candidates
                .iter()
                .map(ExecCandidate::label)
                .collect::<Vec<_>>()
                .join(", ");
            self.fail(format!("no usable shell found (tried {tried}); last error: {reason}"))
        }
    }

    fn fail(&mut self, reason: String) -> Vec<NegotiationAction> {
        self.state = ShellState::Failed {
            reason: reason.clone(),
        };
        vec![NegotiationAction::Surface(ShellOutcome::Failed {
            reason,
            attempts: self.attempts,
        })]
    }
}

/// Container a shell is negotiated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
}

impl ShellTarget {
    fn request(&self, candidate: &ExecCandidate) -> ExecRequest {
        ExecRequest {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            target: self.pod.clone(),
            container: self.container.clone(),
            command: candidate.command.clone(),
            tty: true,
        }
    }
}

pub struct ShellNegotiator {
    session: ExecSession,
    candidates: Vec<ExecCandidate>,
    debounce: Duration,
    grace: Duration,
    settle: Duration,
}

impl ShellNegotiator {
    pub fn new(ctx: SyncContext) -> Self {
        let config = Arc::clone(&ctx.config);
        Self {
            session: ExecSession::new(ExecKind, ctx),
            candidates: config.shell_candidates.clone(),
            debounce: config.shell_debounce(),
            grace: config.shell_grace(),
            settle: config.shell_settle(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<ExecCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    /// The exec session that carries the negotiated shell.
    pub fn session(&self) -> &ExecSession {
        &self.session
    }

    /// Runs negotiation to a terminal outcome. `on_event` sees every event of
    /// every attempt, and keeps receiving the connected shell's output.
    pub async fn negotiate(
        &self,
        target: &ShellTarget,
        on_event: EventHandler<ExecEvent>,
    ) -> ShellOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, NegotiationInput)>();
        let mut machine = Negotiation::new(self.candidates.clone());
        let mut queued = VecDeque::from([NegotiationInput::Begin]);
        let mut grace: Option<Instant> = None;
        let mut debounce: Option<Instant> = None;
        let mut settle: Option<Instant> = None;

        loop {
            let input = match queued.pop_front() {
                Some(input) => Some(input),
                None => tokio::select! {
                    Some((attempt, input)) = rx.recv() => {
                        (machine.current_attempt() == Some(attempt)).then_some(input)
                    }
                    () = sleep_until(grace.unwrap_or_else(Instant::now)), if grace.is_some() => {
                        grace = None;
                        Some(NegotiationInput::GraceElapsed)
                    }
                    () = sleep_until(debounce.unwrap_or_else(Instant::now)), if debounce.is_some() => {
                        debounce = None;
                        Some(NegotiationInput::DebounceElapsed)
                    }
                    () = sleep_until(settle.unwrap_or_else(Instant::now)), if settle.is_some() => {
                        settle = None;
                        Some(NegotiationInput::SettleElapsed)
                    }
                },
            };
            let Some(input) = input else {
                continue;
            };

            for action in machine.advance(input) {
                match action {
                    NegotiationAction::ArmGrace => grace = Some(Instant::now() + self.grace),
                    NegotiationAction::ArmSettle => {
                        grace = None;
                        settle = Some(Instant::now() + self.settle);
                    }
                    NegotiationAction::ScheduleDebounce => {
                        grace = None;
                        settle = None;
                        debounce = Some(Instant::now() + self.debounce);
                    }
                    NegotiationAction::Start(index) => {
                        let Some(candidate) = machine.candidate(index).cloned() else {
                            continue;
                        };
                        if let Some(reason) = self
                            .start_attempt(index, &candidate, target, &tx, &on_event)
                            .await
                        {
                            queued.push_back(NegotiationInput::StartFailed(reason));
                        }
                    }
                    NegotiationAction::Surface(outcome) => {
                        match &outcome {
                            ShellOutcome::Connected { candidate, attempts } => info!(
                                pod = %target.pod,
                                shell = %candidate.label(),
                                attempts,
                                "shell connected"
                            ),
                            ShellOutcome::Failed { reason, attempts } => {
                                warn!(pod = %target.pod, attempts, "{reason}");
                                self.session.stop().await;
                            }
                        }
                        return outcome;
                    }
                }
            }
        }
    }

    async fn start_attempt(
        &self,
        index: usize,
        candidate: &ExecCandidate,
        target: &ShellTarget,
        tx: &mpsc::UnboundedSender<(usize, NegotiationInput)>,
        on_event: &EventHandler<ExecEvent>,
    ) -> Option<String> {
        self.session.stop().await;

        let signals = tx.clone();
        let consumer = Arc::clone(on_event);
        let handler = event_handler(move |event: &ExecEvent| {
            let signal = match event {
                ExecEvent::Stdout { .. } => Some(NegotiationInput::Output),
                ExecEvent::Stderr { .. } => None,
                ExecEvent::Error { error } => Some(NegotiationInput::StreamError(
                    error
                        .clone()
                        .unwrap_or_else(|| "exec session failed".to_string()),
                )),
                ExecEvent::Completed => Some(NegotiationInput::Completed),
            };
            if let Some(signal) = signal {
                let _ = signals.send((index, signal));
            }
            consumer(event)
        });

        debug!(pod = %target.pod, shell = %candidate.label(), attempt = index + 1, "trying shell");
        match self.session.start(target.request(candidate), handler).await {
            Ok(Some(_)) => None,
            Ok(None) => Some("exec session already running".to_string()),
            Err(error) => Some(error.to_string()),
        }
    }
}
