//! Process-wide event bus multiplexing backend payloads by channel id.
//!
//! Backends `open` a channel and `emit` JSON payloads into it; consumers
//! `listen` on the channel id returned by a backend command. Payloads emitted
//! before the first listener attaches are kept in a bounded backlog and
//! replayed to that listener, so early session output is never lost.
//! Payloads for unknown or closed channels are dropped.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{error, trace, warn};

use crate::error::SyncError;
use crate::model::ChannelId;

const BACKLOG_LIMIT: usize = 1024;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Channel {
    listeners: Vec<(u64, Handler)>,
    backlog: VecDeque<Value>,
    attached: bool,
    overflowed: bool,
}

#[derive(Default)]
struct BusState {
    channels: HashMap<ChannelId, Channel>,
    next_listener: u64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares a channel so payloads emitted before anyone listens are kept.
    pub fn open(&self, channel: &ChannelId) {
        self.lock().channels.entry(channel.clone()).or_default();
    }

    pub fn is_open(&self, channel: &ChannelId) -> bool {
        self.lock().channels.contains_key(channel)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids = self.lock().channels.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Delivers `payload` to every listener of `channel`, in call order.
    ///
    /// Returns false when the channel is unknown and the payload was dropped.
    pub fn emit(&self, channel: &ChannelId, payload: Value) -> bool {
        let handlers = {
            let mut state = self.lock();
            let Some(entry) = state.channels.get_mut(channel) else {
                trace!(channel = %channel, "dropping payload for closed channel");
                return false;
            };
            if entry.listeners.is_empty() {
                if !entry.attached {
                    entry.backlog.push_back(payload);
                    if entry.backlog.len() > BACKLOG_LIMIT {
                        entry.backlog.pop_front();
                        if !entry.overflowed {
                            entry.overflowed = true;
                            warn!(channel = %channel, "backlog full, dropping oldest payloads");
                        }
                    }
                }
                return true;
            }
            entry
                .listeners
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect::<Vec<_>>()
        };

        for handler in handlers {
            dispatch(channel, &handler, &payload);
        }
        true
    }

    pub fn listen<F>(&self, channel: &ChannelId, handler: F) -> Listener
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let (id, backlog) = {
            let mut state = self.lock();
            let id = state.next_listener;
            state.next_listener += 1;
            let entry = state.channels.entry(channel.clone()).or_default();
            entry.listeners.push((id, Arc::clone(&handler)));
            entry.attached = true;
            (id, std::mem::take(&mut entry.backlog))
        };

        for payload in &backlog {
            dispatch(channel, &handler, payload);
        }

        Listener {
            bus: self.clone(),
            channel: channel.clone(),
            id,
            disposed: AtomicBool::new(false),
        }
    }

    fn unlisten(&self, channel: &ChannelId, id: u64) {
        if let Some(entry) = self.lock().channels.get_mut(channel) {
            entry.listeners.retain(|(listener, _)| *listener != id);
        }
    }

    pub fn close(&self, channel: &ChannelId) -> bool {
        self.lock().channels.remove(channel).is_some()
    }
}

fn dispatch(channel: &ChannelId, handler: &Handler, payload: &Value) {
    guarded(channel, || handler(payload));
}

/// Runs a consumer callback, logging instead of unwinding if it panics.
pub(crate) fn guarded(channel: &ChannelId, call: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(call)) {
        let failure = SyncError::ConsumerCallback {
            channel: channel.clone(),
            message: panic_message(panic.as_ref()),
        };
        error!(channel = %channel, "{failure}");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Subscription to one bus channel. Disposing is idempotent and also happens on drop.
pub struct Listener {
    bus: EventBus,
    channel: ChannelId,
    id: u64,
    disposed: AtomicBool,
}

impl Listener {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.bus.unlisten(&self.channel, self.id);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("channel", &self.channel)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
