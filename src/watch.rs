//! Reconciliation of an initial list snapshot with a live watch stream.
//!
//! Per (cluster, kind, namespaces) subscription:
//! 1. the scope tracker tears down channels the new selection makes stale;
//! 2. a watch channel is opened, and a cached snapshot for that channel (if
//!    still valid) is published right away as a provisional view;
//! 3. the authoritative list is fetched, deduplicated (first occurrence
//!    wins), published and cached;
//! 4. every watch event is merged by `ResourceKey` and the result republished.
//!
//! Watch events that arrive before the list resolves are held back and
//! replayed on top of it in arrival order. A failed watch-open degrades to a
//! list-only view; a failed list is reported through `on_error`.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{SyncContext, WatchScope};
use crate::bus::{Listener, guarded};
use crate::cache::CacheStore;
use crate::error::{SyncError, with_deadline};
use crate::model::{ChannelId, Keyed, ResourceKey, WatchEvent, WatchEventKind};
use crate::scope::NamespaceScopeTracker;

type ItemsCallback<T> = Box<dyn Fn(&[T]) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&SyncError) + Send + Sync>;

/// Consumer side of a subscription.
pub struct WatchCallbacks<T> {
    on_items: ItemsCallback<T>,
    on_error: ErrorCallback,
}

impl<T> WatchCallbacks<T> {
    pub fn new<I, E>(on_items: I, on_error: E) -> Self
    where
        I: Fn(&[T]) + Send + Sync + 'static,
        E: Fn(&SyncError) + Send + Sync + 'static,
    {
        Self {
            on_items: Box::new(on_items),
            on_error: Box::new(on_error),
        }
    }
}

/// Keeps the first item seen for each key, in input order. Keyless items are dropped.
pub fn dedup_by_key<T: Keyed>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| match item.resource_key() {
            Some(key) => seen.insert(key),
            None => {
                debug!("dropping list item without a resource key");
                false
            }
        })
        .collect()
}

/// In-memory materialized view of one subscription.
struct Reconciler<T> {
    items: BTreeMap<ResourceKey, T>,
    primed: bool,
    pending: Vec<WatchEvent<T>>,
}

impl<T: Keyed + Clone> Reconciler<T> {
    fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            primed: false,
            pending: Vec::new(),
        }
    }

    fn replace(&mut self, items: Vec<T>) {
        self.items = dedup_by_key(items)
            .into_iter()
            .filter_map(|item| item.resource_key().map(|key| (key, item)))
            .collect();
    }

    /// Seeds a provisional view from the cache; ignored once the list landed.
    fn prime_provisional(&mut self, items: Vec<T>) -> Option<Vec<T>> {
        if self.primed {
            return None;
        }
        self.replace(items);
        Some(self.snapshot())
    }

    fn apply_list(&mut self, items: Vec<T>) -> Vec<T> {
        self.replace(items);
        self.release_pending();
        self.snapshot()
    }

    /// Marks the view live without a list, replaying held-back events.
    /// Returns a snapshot only if something was replayed.
    fn release_pending(&mut self) -> bool {
        self.primed = true;
        let pending = std::mem::take(&mut self.pending);
        let replayed = !pending.is_empty();
        for event in pending {
            self.merge(event);
        }
        replayed
    }

    fn apply_event(&mut self, event: WatchEvent<T>) -> Option<Vec<T>> {
        if !self.primed {
            self.pending.push(event);
            return None;
        }
        self.merge(event);
        Some(self.snapshot())
    }

    fn merge(&mut self, event: WatchEvent<T>) {
        let Some(key) = event.object.resource_key() else {
            warn!("ignoring watch event without a resource key");
            return;
        };
        match event.kind {
            WatchEventKind::Added | WatchEventKind::Modified => match self.items.get_mut(&key) {
                Some(existing) => existing.merge_from(event.object),
                None => {
                    self.items.insert(key, event.object);
                }
            },
            WatchEventKind::Deleted => {
                self.items.remove(&key);
            }
        }
    }

    fn snapshot(&self) -> Vec<T> {
        self.items.values().cloned().collect()
    }
}

struct Shared<T> {
    reconciler: Mutex<Reconciler<T>>,
    callbacks: WatchCallbacks<T>,
    token: CancellationToken,
    origin: ChannelId,
}

impl<T: Keyed + Clone> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Reconciler<T>> {
        self.reconciler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, items: &[T]) {
        if self.token.is_cancelled() {
            return;
        }
        guarded(&self.origin, || (self.callbacks.on_items)(items));
    }

    fn fail(&self, error: &SyncError) {
        if self.token.is_cancelled() {
            return;
        }
        guarded(&self.origin, || (self.callbacks.on_error)(error));
    }
}

/// Handle of one live subscription. `dispose` is idempotent and runs on drop.
pub struct WatchSubscription {
    channel: Option<ChannelId>,
    listener: Option<Listener>,
    token: CancellationToken,
    tracker: NamespaceScopeTracker,
    disposed: AtomicBool,
}

impl WatchSubscription {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.channel.as_ref()
    }

    /// False once disposed or torn down by a scope change.
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        if let Some(listener) = &self.listener {
            listener.dispose();
        }
        if let Some(channel) = &self.channel {
            self.tracker.release(channel);
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub struct ResourceWatchCache<T> {
    ctx: SyncContext,
    cache: CacheStore<T>,
}

impl<T> ResourceWatchCache<T>
where
    T: Keyed + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(ctx: SyncContext, cache: CacheStore<T>) -> Self {
        Self { ctx, cache }
    }

    pub fn cache(&self) -> &CacheStore<T> {
        &self.cache
    }

    pub async fn subscribe(
        &self,
        scope: WatchScope,
        callbacks: WatchCallbacks<T>,
    ) -> WatchSubscription {
        let config = &self.ctx.config;
        let ttl = config.cache_ttl();
        let token = CancellationToken::new();
        let shared = Arc::new(Shared {
            reconciler: Mutex::new(Reconciler::new()),
            callbacks,
            token: token.clone(),
            origin: ChannelId::new(format!(
                "{}{}/{}",
                scope.cluster_prefix(),
                scope.kind,
                scope.namespaces.label()
            )),
        });

        self.ctx.scope.activate(&scope).await;

        let mut subscription = WatchSubscription {
            channel: None,
            listener: None,
            token: token.clone(),
            tracker: self.ctx.scope.clone(),
            disposed: AtomicBool::new(false),
        };

        match with_deadline(
            "watch-open",
            config.watch_open_timeout(),
            self.ctx.backend.watch(&scope),
        )
        .await
        {
            Ok(channel) => {
                if self
                    .ctx
                    .scope
                    .register(&scope, channel.clone(), token.clone())
                    .await
                {
                    let handler = event_handler(Arc::clone(&shared), self.cache.clone(), channel.clone(), ttl);
                    subscription.listener = Some(self.ctx.bus.listen(&channel, handler));
                    if let Some(cached) = self.cache.get(&channel) {
                        let provisional = shared.lock().prime_provisional(cached);
                        if let Some(items) = provisional {
                            debug!(channel = %channel, count = items.len(), "publishing cached snapshot");
                            shared.publish(&items);
                        }
                    }
                    subscription.channel = Some(channel);
                }
            }
            Err(error) => {
                warn!(
                    cluster = %scope.cluster,
                    kind = %scope.kind,
                    "{error}; continuing without live updates"
                );
            }
        }

        if token.is_cancelled() {
            return subscription;
        }

        let listed = with_deadline(
            "list",
            config.list_timeout(),
            self.ctx.backend.list(&scope),
        )
        .await;
        if token.is_cancelled() {
            debug!(kind = %scope.kind, "discarding list result for a torn-down view");
            return subscription;
        }

        match listed {
            Ok(values) => {
                let items = decode_items(&shared.origin, values);
                let snapshot = shared.lock().apply_list(items);
                if let Some(channel) = &subscription.channel {
                    self.cache.set(channel, snapshot.clone(), ttl);
                }
                shared.publish(&snapshot);
            }
            Err(error) => {
                shared.fail(&error);
                let replayed = {
                    let mut reconciler = shared.lock();
                    reconciler.release_pending().then(|| reconciler.snapshot())
                };
                if let Some(snapshot) = replayed {
                    if let Some(channel) = &subscription.channel {
                        self.cache.set(channel, snapshot.clone(), ttl);
                    }
                    shared.publish(&snapshot);
                }
            }
        }

        subscription
    }
}

fn event_handler<T>(
    shared: Arc<Shared<T>>,
    cache: CacheStore<T>,
    channel: ChannelId,
    ttl: Duration,
) -> impl Fn(&Value) + Send + Sync + 'static
where
    T: Keyed + DeserializeOwned + Clone + Send + Sync + 'static,
{
    move |payload: &Value| {
        if shared.token.is_cancelled() {
            return;
        }
        let event = match serde_json::from_value::<WatchEvent<T>>(payload.clone()) {
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
        let snapshot = shared.lock().apply_event(event);
        if let Some(items) = snapshot {
            cache.set(&channel, items.clone(), ttl);
            shared.publish(&items);
        }
    }
}

fn decode_items<T: DeserializeOwned>(origin: &ChannelId, values: Vec<Value>) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(source) => {
                let error = SyncError::Decode {
                    channel: origin.clone(),
                    source,
                };
                warn!("{error}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::SyncConfig;
    use crate::backend::ExecRequest;
    use crate::exec::{ExecKind, ExecSession};
    use crate::mock::{MockBackend, MockCall};
    use crate::model::{ExecEvent, NamespaceScope};
    use crate::session::event_handler as session_handler;
    use serde_json::json;

    type Published = Arc<Mutex<Vec<Vec<Value>>>>;
    type Errors = Arc<Mutex<Vec<String>>>;

    fn context(mock: &Arc<MockBackend>) -> SyncContext {
        SyncContext::new(mock.clone(), mock.bus(), SyncConfig::default())
    }

    fn recording() -> (Published, Errors, WatchCallbacks<Value>) {
        let published: Published = Arc::new(Mutex::new(Vec::new()));
        let errors: Errors = Arc::new(Mutex::new(Vec::new()));
        let items_sink = published.clone();
        let error_sink = errors.clone();
        let callbacks = WatchCallbacks::new(
            move |items: &[Value]| items_sink.lock().expect("lock").push(items.to_vec()),
            move |error: &SyncError| error_sink.lock().expect("lock").push(error.to_string()),
        );
        (published, errors, callbacks)
    }

    fn last(published: &Published) -> Vec<Value> {
        published
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }

    fn pod(name: &str, phase: &str) -> Value {
        json!({"metadata": {"namespace": "default", "name": name}, "phase": phase})
    }

    fn pods(cluster: &str) -> WatchScope {
        WatchScope::new(cluster, "pods", NamespaceScope::named(["default"]))
    }

    #[test]
    fn duplicate_keys_keep_the_first_occurrence() {
        let deduped = dedup_by_key(vec![pod("a", "Pending"), pod("a", "Running"), pod("b", "Running")]);
        assert_eq!(deduped, vec![pod("a", "Pending"), pod("b", "Running")]);
    }

    #[test]
    fn events_for_one_key_apply_in_arrival_order() {
        let sequences = [
            vec![WatchEventKind::Added, WatchEventKind::Modified, WatchEventKind::Deleted],
            vec![WatchEventKind::Deleted, WatchEventKind::Added, WatchEventKind::Modified],
            vec![WatchEventKind::Modified, WatchEventKind::Deleted, WatchEventKind::Added],
            vec![WatchEventKind::Added, WatchEventKind::Added, WatchEventKind::Modified],
        ];
        for sequence in sequences {
            let mut reconciler = Reconciler::new();
            reconciler.apply_list(Vec::new());
            let mut expected: Option<Value> = None;
            for (step, kind) in sequence.iter().enumerate() {
                let object = json!({"name": "a", "step": step});
                reconciler.apply_event(WatchEvent {
                    kind: *kind,
                    object: object.clone(),
                });
                expected = match kind {
                    WatchEventKind::Deleted => None,
                    _ => Some(object),
                };
            }
            let snapshot = reconciler.snapshot();
            assert!(snapshot.len() <= 1);
            assert_eq!(snapshot.first().cloned(), expected, "sequence {sequence:?}");
        }
    }

    #[tokio::test]
    async fn list_snapshot_is_deduplicated_and_cached() {
        let mock = Arc::new(MockBackend::new().with_list(vec![
            pod("a", "Pending"),
            pod("a", "Running"),
            pod("b", "Running"),
        ]));
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, errors, callbacks) = recording();

        let subscription = watch.subscribe(pods("prod"), callbacks).await;

        assert_eq!(last(&published), vec![pod("a", "Pending"), pod("b", "Running")]);
        assert!(errors.lock().expect("lock").is_empty());
        let channel = subscription.channel_id().expect("watch channel").clone();
        assert_eq!(watch.cache().get(&channel).map(|items| items.len()), Some(2));
    }

    #[tokio::test]
    async fn watch_events_merge_partially_and_delete() {
        let mock = Arc::new(MockBackend::new().with_list(vec![pod("a", "Pending")]));
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, _errors, callbacks) = recording();
        let subscription = watch.subscribe(pods("prod"), callbacks).await;
        let channel = subscription.channel_id().expect("channel").clone();
        let bus = mock.bus();

        bus.emit(
            &channel,
            json!({"kind": "MODIFIED", "object": {"metadata": {"namespace": "default", "name": "a"}, "ready": true}}),
        );
        assert_eq!(
            last(&published),
            vec![json!({"metadata": {"namespace": "default", "name": "a"}, "phase": "Pending", "ready": true})]
        );

        bus.emit(&channel, json!({"kind": "ADDED", "object": pod("b", "Running")}));
        bus.emit(&channel, json!({"kind": "DELETED", "object": pod("a", "Pending")}));
        assert_eq!(last(&published), vec![pod("b", "Running")]);
        assert_eq!(watch.cache().get(&channel), Some(vec![pod("b", "Running")]));

        bus.emit(&channel, json!({"kind": "BOGUS"}));
        assert_eq!(published.lock().expect("lock").len(), 4);
    }

    #[tokio::test]
    async fn events_before_the_list_are_replayed_on_top_of_it() {
        let mock = Arc::new(
            MockBackend::new()
                .with_list(vec![pod("a", "Running"), pod("b", "Running")])
                .with_watch_payloads(vec![
                    json!({"kind": "ADDED", "object": pod("c", "Pending")}),
                    json!({"kind": "DELETED", "object": pod("a", "Running")}),
                ]),
        );
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, _errors, callbacks) = recording();

        let _subscription = watch.subscribe(pods("prod"), callbacks).await;

        assert_eq!(published.lock().expect("lock").len(), 1);
        assert_eq!(last(&published), vec![pod("b", "Running"), pod("c", "Pending")]);
    }

    #[tokio::test]
    async fn remount_primes_from_cache_before_the_list() {
        let mock = Arc::new(MockBackend::new());
        mock.push_list_result(Ok(vec![pod("a", "Running")]));
        mock.push_list_result(Ok(vec![pod("a", "Running"), pod("b", "Pending")]));
        let clock = Arc::new(ManualClock::new());
        let cache = CacheStore::with_clock(clock.clone());
        let watch = ResourceWatchCache::new(context(&mock), cache);

        let (_first, _errors, callbacks) = recording();
        let first = watch.subscribe(pods("prod"), callbacks).await;
        first.dispose();

        let (published, _errors, callbacks) = recording();
        let _second = watch.subscribe(pods("prod"), callbacks).await;
        let history = published.lock().expect("lock").clone();
        assert_eq!(
            history,
            vec![
                vec![pod("a", "Running")],
                vec![pod("a", "Running"), pod("b", "Pending")],
            ]
        );
    }

    #[tokio::test]
    async fn expired_cache_is_not_used_as_provisional_state() {
        let mock = Arc::new(MockBackend::new());
        mock.push_list_result(Ok(vec![pod("a", "Running")]));
        mock.push_list_result(Ok(vec![pod("b", "Running")]));
        let clock = Arc::new(ManualClock::new());
        let watch =
            ResourceWatchCache::new(context(&mock), CacheStore::with_clock(clock.clone()));

        let (_first, _errors, callbacks) = recording();
        drop(watch.subscribe(pods("prod"), callbacks).await);
        clock.advance(SyncConfig::default().cache_ttl());

        let (published, _errors, callbacks) = recording();
        let _second = watch.subscribe(pods("prod"), callbacks).await;
        assert_eq!(
            published.lock().expect("lock").clone(),
            vec![vec![pod("b", "Running")]]
        );
    }

    #[tokio::test]
    async fn failed_watch_open_degrades_to_list_only() {
        let mock = Arc::new(
            MockBackend::new()
                .with_list(vec![pod("a", "Running")])
                .with_watch_error("watch forbidden"),
        );
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, errors, callbacks) = recording();

        let subscription = watch.subscribe(pods("prod"), callbacks).await;

        assert!(subscription.channel_id().is_none());
        assert!(errors.lock().expect("lock").is_empty());
        assert_eq!(last(&published), vec![pod("a", "Running")]);
    }

    #[tokio::test(start_paused = true)]
    async fn list_timeout_is_surfaced() {
        let mock = Arc::new(MockBackend::new().with_list_delay(Duration::from_secs(60)));
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, errors, callbacks) = recording();

        let _subscription = watch.subscribe(pods("prod"), callbacks).await;

        assert!(published.lock().expect("lock").is_empty());
        assert_eq!(
            *errors.lock().expect("lock"),
            vec!["list timed out after 15000ms".to_string()]
        );
    }

    #[tokio::test]
    async fn list_failure_still_applies_live_events() {
        let mock = Arc::new(MockBackend::new());
        mock.push_list_result(Err("apiserver unavailable".to_string()));
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, errors, callbacks) = recording();

        let subscription = watch.subscribe(pods("prod"), callbacks).await;
        assert_eq!(
            *errors.lock().expect("lock"),
            vec!["list failed: apiserver unavailable".to_string()]
        );

        let channel = subscription.channel_id().expect("channel").clone();
        mock.bus()
            .emit(&channel, json!({"kind": "ADDED", "object": pod("a", "Running")}));
        assert_eq!(last(&published), vec![pod("a", "Running")]);
    }

    #[tokio::test]
    async fn disposed_subscription_ignores_events() {
        let mock = Arc::new(MockBackend::new());
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (published, _errors, callbacks) = recording();
        let subscription = watch.subscribe(pods("prod"), callbacks).await;
        let channel = subscription.channel_id().expect("channel").clone();

        subscription.dispose();
        subscription.dispose();
        assert!(!subscription.is_live());
        mock.bus()
            .emit(&channel, json!({"kind": "ADDED", "object": pod("a", "Running")}));

        assert_eq!(published.lock().expect("lock").len(), 1);
        assert!(last(&published).is_empty());
    }

    #[tokio::test]
    async fn dispose_unwatches_and_closes_the_channel() {
        let mock = Arc::new(MockBackend::new());
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (_published, _errors, callbacks) = recording();
        let subscription = watch.subscribe(pods("prod"), callbacks).await;
        let channel = subscription.channel_id().expect("channel").clone();

        drop(subscription);

        assert_eq!(
            mock.calls().last(),
            Some(&MockCall::Unwatch(channel.as_str().to_string()))
        );
        assert!(!mock.bus().is_open(&channel));
        assert!(watch.cache().get(&channel).is_some());
    }

    #[tokio::test]
    async fn shared_channel_stays_open_until_the_last_view_goes() {
        let mock = Arc::new(MockBackend::new());
        let watch = ResourceWatchCache::new(context(&mock), CacheStore::new());
        let (_first_items, _errors, callbacks) = recording();
        let first = watch.subscribe(pods("prod"), callbacks).await;
        let (second_items, _errors, callbacks) = recording();
        let second = watch.subscribe(pods("prod"), callbacks).await;
        let channel = second.channel_id().expect("channel").clone();

        first.dispose();
        assert!(!mock.calls().iter().any(|call| matches!(call, MockCall::Unwatch(_))));
        mock.bus()
            .emit(&channel, json!({"kind": "ADDED", "object": pod("a", "Running")}));
        assert_eq!(last(&second_items), vec![pod("a", "Running")]);

        second.dispose();
        assert!(mock.calls().contains(&MockCall::Unwatch(channel.as_str().to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_unwatch_does_not_delay_the_next_watch() {
        let mock = Arc::new(MockBackend::new().with_unwatch_hang());
        let ctx = context(&mock);
        let prod_view = ResourceWatchCache::new(ctx.clone(), CacheStore::new());
        let staging_view = ResourceWatchCache::new(ctx, CacheStore::new());
        let (_prod_items, _errors, callbacks) = recording();
        let _prod = prod_view.subscribe(pods("prod"), callbacks).await;

        let started = tokio::time::Instant::now();
        let (staging_items, _errors, callbacks) = recording();
        let staging = staging_view.subscribe(pods("staging"), callbacks).await;

        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(staging.channel_id().is_some());
        assert_eq!(staging_items.lock().expect("lock").len(), 1);
        let calls = mock.calls();
        let unwatch = calls
            .iter()
            .position(|call| call == &MockCall::Unwatch("prod/".to_string()))
            .expect("prod unwatch issued");
        let staging_watch = calls
            .iter()
            .position(|call| matches!(call, MockCall::Watch(scope) if scope.cluster == "staging"))
            .expect("staging watch opened");
        assert!(unwatch < staging_watch);
    }

    #[tokio::test]
    async fn cluster_switch_keeps_exec_sessions_running() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock);
        let prod_view = ResourceWatchCache::new(ctx.clone(), CacheStore::new());
        let staging_view = ResourceWatchCache::new(ctx.clone(), CacheStore::new());
        let (_prod_items, _errors, callbacks) = recording();
        let _prod = prod_view.subscribe(pods("prod"), callbacks).await;

        let output = Arc::new(Mutex::new(Vec::new()));
        let sink = output.clone();
        let exec = ExecSession::new(ExecKind, ctx);
        let handle = exec
            .start(
                ExecRequest {
                    cluster: "prod".to_string(),
                    namespace: "default".to_string(),
                    target: "api-0".to_string(),
                    container: None,
                    command: vec!["sh".to_string()],
                    tty: true,
                },
                session_handler(move |event: &ExecEvent| {
                    sink.lock().expect("lock").push(event.clone());
                    Ok(())
                }),
            )
            .await
            .expect("start")
            .expect("handle");

        let (_staging_items, _errors, callbacks) = recording();
        let _staging = staging_view.subscribe(pods("staging"), callbacks).await;

        assert!(exec.is_active());
        assert!(mock.bus().emit(&handle.channel_id, json!({"kind": "STDOUT", "data": "$ "})));
        assert_eq!(
            *output.lock().expect("lock"),
            vec![ExecEvent::Stdout {
                data: "$ ".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn cluster_switch_unwatches_before_opening_and_isolates_items() {
        let mock = Arc::new(MockBackend::new().with_list(vec![pod("a", "Running")]));
        let ctx = context(&mock);
        let prod_view = ResourceWatchCache::new(ctx.clone(), CacheStore::new());
        let staging_view = ResourceWatchCache::new(ctx, CacheStore::new());

        let (_prod_items, _errors, callbacks) = recording();
        let prod = prod_view.subscribe(pods("prod"), callbacks).await;
        let prod_channel = prod.channel_id().expect("prod channel").clone();

        let (staging_items, _errors, callbacks) = recording();
        let _staging = staging_view.subscribe(pods("staging"), callbacks).await;

        let calls = mock.calls();
        let unwatch = calls
            .iter()
            .position(|call| call == &MockCall::Unwatch("prod/".to_string()))
            .expect("prod unwatch requested");
        let staging_watch = calls
            .iter()
            .position(|call| matches!(call, MockCall::Watch(scope) if scope.cluster == "staging"))
            .expect("staging watch opened");
        assert!(unwatch < staging_watch);

        assert!(!prod.is_live());
        mock.bus().emit(
            &prod_channel,
            json!({"kind": "ADDED", "object": pod("ghost", "Running")}),
        );
        assert_eq!(last(&staging_items), vec![pod("a", "Running")]);
        assert_eq!(staging_items.lock().expect("lock").len(), 1);
    }
}
