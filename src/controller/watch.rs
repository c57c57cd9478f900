//! Per-kind event dispatch
//!
//! Every watched kind runs its own dispatch loop: watcher events are applied
//! to the kind's reflector store first and then handed to the handler as
//! [`Change`]s, in order. Changes produced before the [`ReadyGate`] opens are
//! buffered and replayed once every cache is populated.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gate::ReadyGate;

/// A change to one object, with the previous version on updates
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    /// Object seen for the first time
    Added(T),
    /// Object changed
    Updated {
        /// Version before the change
        old: T,
        /// Version after the change
        new: T,
    },
    /// Object removed
    Deleted(T),
}

impl<T> Change<T> {
    /// Convert both sides of the change
    pub fn map<U>(self, f: impl Fn(&T) -> U) -> Change<U> {
        match self {
            Self::Added(obj) => Change::Added(f(&obj)),
            Self::Updated { old, new } => Change::Updated {
                old: f(&old),
                new: f(&new),
            },
            Self::Deleted(obj) => Change::Deleted(f(&obj)),
        }
    }
}

/// Receiver of changes for kind `K`
#[async_trait]
pub trait ChangeHandler<K>: Send + Sync {
    /// Handle one change; the store already reflects it
    async fn handle(&self, change: Change<Arc<K>>);
}

/// Handler for kinds that are only watched to keep their store current
pub struct StoreOnly;

#[async_trait]
impl<K: Send + Sync + 'static> ChangeHandler<K> for StoreOnly {
    async fn handle(&self, _change: Change<Arc<K>>) {}
}

/// Turns watcher events into store updates and [`Change`]s for one kind
pub struct KindDispatch<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Writer<K>,
    relist: Vec<Arc<K>>,
}

impl<K> KindDispatch<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Wrap a reflector store/writer pair
    pub fn new(store: Store<K>, writer: Writer<K>) -> Self {
        Self {
            store,
            writer,
            relist: Vec::new(),
        }
    }

    /// Apply `event` to the store and return the changes it caused.
    ///
    /// A listing (`Init` .. `InitDone`) only replaces the store at `InitDone`,
    /// so its changes are emitted then, including deletions of objects the
    /// listing no longer contains.
    pub fn apply(&mut self, event: Event<K>) -> Vec<Change<Arc<K>>> {
        match event {
            Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(&obj));
                self.writer.apply_watcher_event(&Event::Apply(obj.clone()));
                let new = Arc::new(obj);
                vec![match old {
                    Some(old) => Change::Updated { old, new },
                    None => Change::Added(new),
                }]
            }
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&Event::Delete(obj.clone()));
                vec![Change::Deleted(Arc::new(obj))]
            }
            Event::Init => {
                self.relist.clear();
                self.writer.apply_watcher_event(&Event::Init);
                Vec::new()
            }
            Event::InitApply(obj) => {
                self.writer.apply_watcher_event(&Event::InitApply(obj.clone()));
                self.relist.push(Arc::new(obj));
                Vec::new()
            }
            Event::InitDone => {
                let listed = std::mem::take(&mut self.relist);
                let seen: HashSet<ObjectRef<K>> =
                    listed.iter().map(|obj| ObjectRef::from_obj(obj.as_ref())).collect();

                let mut changes: Vec<Change<Arc<K>>> = listed
                    .into_iter()
                    .map(|new| match self.store.get(&ObjectRef::from_obj(new.as_ref())) {
                        Some(old) => Change::Updated { old, new },
                        None => Change::Added(new),
                    })
                    .collect();
                changes.extend(
                    self.store
                        .state()
                        .into_iter()
                        .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                        .map(Change::Deleted),
                );

                self.writer.apply_watcher_event(&Event::InitDone);
                changes
            }
        }
    }
}

/// Dispatch a kind's event stream to `handler` until the stream ends or `token` fires.
///
/// The kind is reported to `gate` after its first complete listing; from then
/// on the loop waits for the gate before handing any change to the handler.
pub async fn dispatch<K, H, S>(
    kind: &str,
    events: S,
    mut kind_dispatch: KindDispatch<K>,
    gate: Arc<ReadyGate>,
    handler: Arc<H>,
    token: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    H: ChangeHandler<K> + ?Sized,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    let mut events = std::pin::pin!(events);
    let mut buffered: Vec<Change<Arc<K>>> = Vec::new();
    let mut synced = false;

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => {
                debug!(kind, "Watch dispatch stopping");
                return;
            }
            event = events.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(kind, error = %e, "Watch error, stream will retry");
                continue;
            }
            None => {
                warn!(kind, "Watch stream ended");
                return;
            }
        };

        let initial_sync_done = !synced && matches!(event, Event::InitDone);
        let changes = kind_dispatch.apply(event);

        if !synced {
            buffered.extend(changes);
            if !initial_sync_done {
                continue;
            }
            synced = true;
            gate.mark_synced(kind);

            tokio::select! {
                _ = token.cancelled() => return,
                _ = gate.wait_ready() => {}
            }
            debug!(kind, replayed = buffered.len(), "Replaying changes from initial sync");
            for change in buffered.drain(..) {
                handler.handle(change).await;
            }
            continue;
        }

        for change in changes {
            handler.handle(change).await;
        }
    }
}

/// Watch every object of kind `K` through `api`, registering the kind with `gate`
pub fn spawn_watch<K, H>(
    kind: &'static str,
    api: Api<K>,
    (store, writer): (Store<K>, Writer<K>),
    gate: &Arc<ReadyGate>,
    handler: Arc<H>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    H: ChangeHandler<K> + ?Sized + 'static,
{
    gate.register(kind);
    let gate = Arc::clone(gate);
    let events = watcher(api, watcher::Config::default()).default_backoff();
    tokio::spawn(dispatch(
        kind,
        events,
        KindDispatch::new(store, writer),
        gate,
        handler,
        token,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use kube::runtime::reflector;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn cm(name: &str, rv: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(changes: &[Change<Arc<ConfigMap>>]) -> Vec<String> {
        changes
            .iter()
            .map(|c| match c {
                Change::Added(o) => format!("added:{}", o.metadata.name.as_deref().unwrap_or("")),
                Change::Updated { new, .. } => {
                    format!("updated:{}", new.metadata.name.as_deref().unwrap_or(""))
                }
                Change::Deleted(o) => {
                    format!("deleted:{}", o.metadata.name.as_deref().unwrap_or(""))
                }
            })
            .collect()
    }

    mod kind_dispatch {
        use super::*;

        #[test]
        fn apply_distinguishes_add_from_update() {
            let (store, writer) = reflector::store();
            let mut kind_dispatch = KindDispatch::new(store.clone(), writer);

            let first = kind_dispatch.apply(Event::Apply(cm("a", "1")));
            assert_eq!(names(&first), vec!["added:a"]);

            let second = kind_dispatch.apply(Event::Apply(cm("a", "2")));
            match &second[0] {
                Change::Updated { old, new } => {
                    assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                    assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
                }
                other => panic!("expected update, got {other:?}"),
            }

            let deleted = kind_dispatch.apply(Event::Delete(cm("a", "2")));
            assert_eq!(names(&deleted), vec!["deleted:a"]);
            assert!(store.state().is_empty());
        }

        #[test]
        fn listing_is_emitted_at_init_done() {
            let (store, writer) = reflector::store();
            let mut kind_dispatch = KindDispatch::new(store.clone(), writer);

            assert!(kind_dispatch.apply(Event::Init).is_empty());
            assert!(kind_dispatch.apply(Event::InitApply(cm("a", "1"))).is_empty());
            assert!(store.state().is_empty());

            let changes = kind_dispatch.apply(Event::InitDone);
            assert_eq!(names(&changes), vec!["added:a"]);
            assert_eq!(store.state().len(), 1);
        }

        #[test]
        fn relist_reports_updates_and_vanished_objects() {
            let (store, writer) = reflector::store();
            let mut kind_dispatch = KindDispatch::new(store.clone(), writer);
            kind_dispatch.apply(Event::Apply(cm("kept", "1")));
            kind_dispatch.apply(Event::Apply(cm("gone", "1")));

            kind_dispatch.apply(Event::Init);
            kind_dispatch.apply(Event::InitApply(cm("kept", "2")));
            let mut changes = names(&kind_dispatch.apply(Event::InitDone));
            changes.sort();

            assert_eq!(changes, vec!["deleted:gone", "updated:kept"]);
            assert_eq!(store.state().len(), 1);
        }
    }

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ChangeHandler<ConfigMap> for Recorder {
        async fn handle(&self, change: Change<Arc<ConfigMap>>) {
            self.0.lock().extend(names(&[change]));
        }
    }

    mod gating {
        use super::*;

        #[tokio::test]
        async fn changes_wait_for_every_kind_to_sync() {
            let gate = Arc::new(ReadyGate::new());
            gate.register("ConfigMap");
            gate.register("Other");
            gate.start();

            let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
            let (tx, rx) = mpsc::unbounded();
            let (store, writer) = reflector::store();
            let token = CancellationToken::new();

            let task = tokio::spawn(dispatch(
                "ConfigMap",
                rx,
                KindDispatch::new(store.clone(), writer),
                gate.clone(),
                recorder.clone(),
                token.clone(),
            ));

            tx.unbounded_send(Ok(Event::Init)).unwrap();
            tx.unbounded_send(Ok(Event::InitApply(cm("a", "1")))).unwrap();
            tx.unbounded_send(Ok(Event::InitDone)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            // Store is populated but nothing reached the handler.
            assert_eq!(store.state().len(), 1);
            assert!(recorder.0.lock().is_empty());

            gate.mark_synced("Other");
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(*recorder.0.lock(), vec!["added:a"]);

            tx.unbounded_send(Ok(Event::Apply(cm("a", "2")))).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(*recorder.0.lock(), vec!["added:a", "updated:a"]);

            token.cancel();
            task.await.unwrap();
        }

        #[tokio::test]
        async fn cancellation_stops_a_kind_waiting_for_the_gate() {
            let gate = Arc::new(ReadyGate::new());
            gate.register("ConfigMap");
            gate.register("Never");
            gate.start();

            let events = futures::stream::iter(vec![Ok(Event::Init), Ok(Event::InitDone)])
                .chain(futures::stream::pending());
            let (store, writer) = reflector::store::<ConfigMap>();
            let token = CancellationToken::new();
            let task = tokio::spawn(dispatch(
                "ConfigMap",
                events,
                KindDispatch::new(store, writer),
                gate,
                Arc::new(StoreOnly),
                token.clone(),
            ));

            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
