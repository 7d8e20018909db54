//! Teardown of stale watch channels when the cluster or namespace selection changes.
//!
//! Before a watch is opened for cluster C, every watch channel tracked for
//! the previously active cluster is closed locally (so late events are
//! dropped) and an `unwatch` of the old cluster prefix is issued. Session
//! channels (exec, logs, port-forward) on that cluster are left alone. Within
//! one cluster, a kind whose namespace selection changes gets its previous
//! channels closed the same way.
//!
//! Unwatch requests are issued in call order but never awaited by the caller;
//! their outcome is bounded by `unwatch_timeout` and failures are only logged.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Context;

use futures::task::noop_waker_ref;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, WatchScope, cluster_prefix};
use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::error::with_deadline;
use crate::model::{ChannelId, NamespaceScope};

struct TrackedChannel {
    cluster: String,
    kind: String,
    namespaces: NamespaceScope,
    channel: ChannelId,
    token: CancellationToken,
}

#[derive(Default)]
struct TrackerState {
    cluster: Option<String>,
    namespaces: HashMap<String, NamespaceScope>,
    channels: Vec<TrackedChannel>,
}

/// What one `activate` call tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeChange {
    pub closed_prefix: Option<String>,
    pub closed_channels: Vec<ChannelId>,
}

#[derive(Clone)]
pub struct NamespaceScopeTracker {
    backend: Arc<dyn Backend>,
    bus: EventBus,
    config: Arc<SyncConfig>,
    state: Arc<Mutex<TrackerState>>,
}

impl NamespaceScopeTracker {
    pub fn new(backend: Arc<dyn Backend>, bus: EventBus, config: Arc<SyncConfig>) -> Self {
        Self {
            backend,
            bus,
            config,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_cluster(&self) -> Option<String> {
        self.lock().cluster.clone()
    }

    pub fn tracked_channels(&self) -> Vec<ChannelId> {
        self.lock()
            .channels
            .iter()
            .map(|tracked| tracked.channel.clone())
            .collect()
    }

    /// Makes `scope` the active selection, closing whatever it makes stale.
    pub async fn activate(&self, scope: &WatchScope) -> ScopeChange {
        let (closed_prefix, stale) = {
            let mut state = self.lock();
            let mut closed_prefix = None;
            let mut stale = Vec::new();

            if let Some(previous) = state.cluster.as_deref()
                && previous != scope.cluster
            {
                let previous = previous.to_string();
                let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.channels)
                    .into_iter()
                    .partition(|tracked| tracked.cluster == previous);
                state.channels = kept;
                state.namespaces.clear();
                stale.extend(gone);
                closed_prefix = Some(cluster_prefix(&previous));
            }
            state.cluster = Some(scope.cluster.clone());

            if let Some(previous) = state
                .namespaces
                .insert(scope.kind.clone(), scope.namespaces.clone())
                && previous != scope.namespaces
            {
                let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.channels)
                    .into_iter()
                    .partition(|tracked| {
                        tracked.cluster == scope.cluster
                            && tracked.kind == scope.kind
                            && tracked.namespaces != scope.namespaces
                    });
                state.channels = kept;
                stale.extend(gone);
            }

            (closed_prefix, stale)
        };

        for tracked in &stale {
            tracked.token.cancel();
            self.bus.close(&tracked.channel);
        }

        if let Some(prefix) = &closed_prefix {
            info!(prefix = %prefix, closed = stale.len(), "cluster changed, closing stale watches");
            self.request_unwatch(prefix);
        }

        let mut change = ScopeChange {
            closed_prefix,
            closed_channels: Vec::new(),
        };
        let mut requested = HashSet::new();
        for tracked in stale {
            let covered = change
                .closed_prefix
                .as_deref()
                .is_some_and(|prefix| tracked.channel.is_targeted_by(prefix));
            if !covered && requested.insert(tracked.channel.clone()) {
                debug!(channel = %tracked.channel, "namespace selection changed, closing channel");
                self.request_unwatch(tracked.channel.as_str());
            }
            change.closed_channels.push(tracked.channel);
        }
        change
    }

    /// Records an opened watch channel. Returns false when `scope` is no longer
    /// the active selection; the token is then cancelled and the channel closed.
    pub async fn register(
        &self,
        scope: &WatchScope,
        channel: ChannelId,
        token: CancellationToken,
    ) -> bool {
        let current = {
            let mut state = self.lock();
            let current = state.cluster.as_deref() == Some(scope.cluster.as_str())
                && state.namespaces.get(&scope.kind) == Some(&scope.namespaces);
            if current {
                state.channels.push(TrackedChannel {
                    cluster: scope.cluster.clone(),
                    kind: scope.kind.clone(),
                    namespaces: scope.namespaces.clone(),
                    channel: channel.clone(),
                    token: token.clone(),
                });
            }
            current
        };

        if !current {
            token.cancel();
            self.bus.close(&channel);
            self.request_unwatch(channel.as_str());
        }
        current
    }

    /// Drops the registration of a disposed view (its token is already
    /// cancelled). The last view on a channel closes it and unwatches it.
    pub fn release(&self, channel: &ChannelId) {
        let last = {
            let mut state = self.lock();
            let position = state
                .channels
                .iter()
                .position(|tracked| &tracked.channel == channel && tracked.token.is_cancelled());
            let Some(position) = position else {
                return;
            };
            state.channels.remove(position);
            !state.channels.iter().any(|tracked| &tracked.channel == channel)
        };
        if last {
            debug!(channel = %channel, "last view disposed, closing watch");
            self.bus.close(channel);
            self.request_unwatch(channel.as_str());
        }
    }

    /// Issues `unwatch(target)` now and lets it finish in the background.
    fn request_unwatch(&self, target: &str) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(target = %target, "no runtime, skipping unwatch");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let timeout = self.config.unwatch_timeout();
        let target = target.to_string();
        let mut request = Box::pin(async move {
            let result = with_deadline("unwatch", timeout, backend.unwatch(&target)).await;
            if let Err(error) = result {
                warn!(target = %target, "{error}");
            }
        });
        // The first poll sends the request, so it precedes anything the caller opens next.
        let mut cx = Context::from_waker(noop_waker_ref());
        if request.as_mut().poll(&mut cx).is_pending() {
            runtime.spawn(request);
        }
    }
}
