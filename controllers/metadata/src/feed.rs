//! Kubernetes change feed.
//!
//! Runs reflectors for `Endpoints` and `Node`, translates endpoints watch
//! events into add/update/delete notifications for the [`EventHandler`],
//! and periodically redelivers every known endpoints object so bundles are
//! rewritten before their TTL runs out.

use crate::error::ControllerError;
use crate::handlers::{endpoints_key, DeletedEndpoints, EventHandler, Tombstone};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node};
use kube::{Api, Client};
use kube_runtime::reflector::{self, store::Writer, Store};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A change notification for one endpoints object.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Object seen for the first time
    Add(Endpoints),
    /// Known object changed (old, new)
    Update(Endpoints, Endpoints),
    /// Object deleted
    Delete(DeletedEndpoints),
}

/// Tracks the endpoints the feed has delivered so watch events can be
/// classified as add or update, and so objects that vanished during a
/// relist are reported as tombstones.
///
/// Objects listed during a relist are only announced at `InitDone`: the
/// reflector store swaps in the relisted objects at that point, and a
/// worker reading the store earlier would see the previous listing.
#[derive(Debug, Default)]
pub struct EndpointsTracker {
    known: HashMap<String, Endpoints>,
    relisted: Option<HashMap<String, Endpoints>>,
    relisted_unkeyed: Vec<Endpoints>,
}

impl EndpointsTracker {
    /// Translate one watch event into notifications.
    pub fn observe(&mut self, event: watcher::Event<Endpoints>) -> Vec<Notification> {
        match event {
            watcher::Event::Apply(endpoints) => {
                let Some(key) = endpoints_key(&endpoints) else {
                    return vec![Notification::Add(endpoints)];
                };
                let notification = self.classify(&key, &endpoints);
                self.known.insert(key, endpoints);
                vec![notification]
            }
            watcher::Event::Delete(endpoints) => {
                if let Some(key) = endpoints_key(&endpoints) {
                    self.known.remove(&key);
                }
                vec![Notification::Delete(DeletedEndpoints::Final(endpoints))]
            }
            watcher::Event::Init => {
                trace!("Endpoints relist started");
                self.relisted = Some(HashMap::new());
                self.relisted_unkeyed.clear();
                Vec::new()
            }
            watcher::Event::InitApply(endpoints) => {
                match endpoints_key(&endpoints) {
                    Some(key) => {
                        self.relisted.get_or_insert_with(HashMap::new).insert(key, endpoints);
                    }
                    None => self.relisted_unkeyed.push(endpoints),
                }
                Vec::new()
            }
            watcher::Event::InitDone => self.finish_relist(),
        }
    }

    /// Announce the relisted objects, then tombstones for the known objects
    /// the relist no longer contains.
    fn finish_relist(&mut self) -> Vec<Notification> {
        let relisted = self.relisted.take().unwrap_or_default();

        let mut listed: Vec<(&String, &Endpoints)> = relisted.iter().collect();
        listed.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut notifications: Vec<Notification> = listed
            .into_iter()
            .map(|(key, endpoints)| self.classify(key, endpoints))
            .collect();
        notifications.extend(self.relisted_unkeyed.drain(..).map(Notification::Add));

        let mut vanished: Vec<(String, Endpoints)> = self
            .known
            .drain()
            .filter(|(key, _)| !relisted.contains_key(key))
            .collect();
        vanished.sort_by(|(a, _), (b, _)| a.cmp(b));
        trace!(
            "Endpoints relist listed {} objects, removed {}",
            relisted.len(),
            vanished.len()
        );
        self.known = relisted;

        notifications.extend(vanished.into_iter().map(|(key, last_known)| {
            Notification::Delete(DeletedEndpoints::Tombstone(Tombstone {
                key,
                last_known: Some(last_known),
            }))
        }));
        notifications
    }

    fn classify(&self, key: &str, endpoints: &Endpoints) -> Notification {
        match self.known.get(key) {
            Some(old) => Notification::Update(old.clone(), endpoints.clone()),
            None => Notification::Add(endpoints.clone()),
        }
    }

    /// Number of objects currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }
}

/// Hand one notification to the event handler
pub fn dispatch(handler: &EventHandler, notification: &Notification) {
    match notification {
        Notification::Add(endpoints) => handler.on_add(endpoints),
        Notification::Update(old, new) => handler.on_update(old, new),
        Notification::Delete(deleted) => handler.on_delete(deleted),
    }
}

/// Redeliver every object in `store` as an update to itself.
pub fn resync_once(store: &Store<Endpoints>, handler: &EventHandler) -> usize {
    let objects = store.state();
    trace!("Resyncing {} endpoints", objects.len());
    for endpoints in &objects {
        handler.on_update(endpoints, endpoints);
    }
    objects.len()
}

/// Running reflectors and the stores they fill.
#[derive(Debug)]
pub struct ChangeFeed {
    endpoints: Store<Endpoints>,
    nodes: Store<Node>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChangeFeed {
    /// Start watching endpoints (all namespaces, or `namespace`) and nodes.
    pub fn start(
        client: &Client,
        namespace: Option<&str>,
        handler: EventHandler,
        resync_period: Duration,
        cancel: &CancellationToken,
    ) -> Self {
        let endpoints_api: Api<Endpoints> = match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let node_api: Api<Node> = Api::all(client.clone());

        let (endpoints, endpoints_writer) = reflector::store();
        let (nodes, nodes_writer) = reflector::store();

        let tasks = vec![
            tokio::spawn(watch_endpoints(
                endpoints_api,
                endpoints_writer,
                handler.clone(),
                cancel.clone(),
            )),
            tokio::spawn(watch_nodes(node_api, nodes_writer, cancel.clone())),
            tokio::spawn(resync_endpoints(
                endpoints.clone(),
                handler,
                resync_period,
                cancel.clone(),
            )),
        ];

        Self {
            endpoints,
            nodes,
            tasks,
        }
    }

    /// Local store of endpoints objects
    #[must_use]
    pub fn endpoints_store(&self) -> Store<Endpoints> {
        self.endpoints.clone()
    }

    /// Local store of nodes
    #[must_use]
    pub fn node_store(&self) -> Store<Node> {
        self.nodes.clone()
    }

    /// Future resolving once both stores completed their initial listing.
    pub fn synced(&self) -> impl Future<Output = Result<(), ControllerError>> + Send + 'static {
        wait_for_sync(self.endpoints.clone(), self.nodes.clone())
    }

    /// Wait for the feed tasks to finish after cancellation.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Change feed task failed: {}", e);
            }
        }
    }
}

/// Wait until both stores completed their initial listing.
pub async fn wait_for_sync(endpoints: Store<Endpoints>, nodes: Store<Node>) -> Result<(), ControllerError> {
    info!("Waiting for Endpoints and Node caches to sync");
    let (endpoints_ready, nodes_ready) = tokio::join!(endpoints.wait_until_ready(), nodes.wait_until_ready());
    endpoints_ready.map_err(|e| ControllerError::Watch(format!("Endpoints cache never synced: {e}")))?;
    nodes_ready.map_err(|e| ControllerError::Watch(format!("Node cache never synced: {e}")))?;
    info!("Endpoints and Node caches synced");
    Ok(())
}

async fn watch_endpoints(
    api: Api<Endpoints>,
    writer: Writer<Endpoints>,
    handler: EventHandler,
    cancel: CancellationToken,
) {
    info!("Starting Endpoints watcher");
    let mut stream = pin!(reflector::reflector(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    ));
    let mut tracker = EndpointsTracker::default();

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                let relist_done = matches!(event, watcher::Event::InitDone);
                for notification in tracker.observe(event) {
                    dispatch(&handler, &notification);
                }
                if relist_done {
                    debug!("Endpoints watcher listed {} objects", tracker.len());
                }
            }
            Some(Err(e)) => warn!("Endpoints watcher error, will retry: {}", e),
            None => {
                warn!("Endpoints watcher stream has terminated unexpectedly");
                break;
            }
        }
    }
    info!("Stopping Endpoints watcher");
}

async fn watch_nodes(api: Api<Node>, writer: Writer<Node>, cancel: CancellationToken) {
    info!("Starting Node watcher");
    let mut stream = pin!(reflector::reflector(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    ));

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(watcher::Event::InitDone)) => debug!("Node watcher initialization complete"),
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!("Node watcher error, will retry: {}", e),
            None => {
                warn!("Node watcher stream has terminated unexpectedly");
                break;
            }
        }
    }
    info!("Stopping Node watcher");
}

async fn resync_endpoints(
    store: Store<Endpoints>,
    handler: EventHandler,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial listing already
    // delivered every object.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        resync_once(&store, &handler);
    }
    debug!("Stopping Endpoints resync");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::bundle::BundleCache;
    use crate::queue::WorkQueue;
    use crate::reconciler::Reconciler;
    use crate::test_utils::{create_test_endpoints, MockNodeLister};
    use crate::worker::process_next_work_item;
    use agent_cache::Cache;
    use std::sync::Arc;

    fn keys(notifications: &[Notification]) -> Vec<String> {
        notifications
            .iter()
            .map(|n| match n {
                Notification::Add(e) => format!("add {}", endpoints_key(e).unwrap_or_default()),
                Notification::Update(_, e) => format!("update {}", endpoints_key(e).unwrap_or_default()),
                Notification::Delete(DeletedEndpoints::Final(e)) => {
                    format!("delete {}", endpoints_key(e).unwrap_or_default())
                }
                Notification::Delete(DeletedEndpoints::Tombstone(t)) => format!("tombstone {}", t.key),
            })
            .collect()
    }

    #[test]
    fn test_apply_classifies_add_then_update() {
        let mut tracker = EndpointsTracker::default();
        let svc = create_test_endpoints("foo", "svc1", &[]);

        let first = tracker.observe(watcher::Event::Apply(svc.clone()));
        let second = tracker.observe(watcher::Event::Apply(svc));

        assert_eq!(keys(&first), vec!["add foo/svc1"]);
        assert_eq!(keys(&second), vec!["update foo/svc1"]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_delete_forgets_object() {
        let mut tracker = EndpointsTracker::default();
        let svc = create_test_endpoints("foo", "svc1", &[]);
        tracker.observe(watcher::Event::Apply(svc.clone()));

        let deleted = tracker.observe(watcher::Event::Delete(svc.clone()));
        assert_eq!(keys(&deleted), vec!["delete foo/svc1"]);
        assert_eq!(tracker.len(), 0);

        let re_added = tracker.observe(watcher::Event::Apply(svc));
        assert_eq!(keys(&re_added), vec!["add foo/svc1"]);
    }

    #[test]
    fn test_relist_reports_vanished_objects_as_tombstones() {
        let mut tracker = EndpointsTracker::default();
        tracker.observe(watcher::Event::Apply(create_test_endpoints("foo", "svc1", &[])));
        tracker.observe(watcher::Event::Apply(create_test_endpoints("foo", "svc2", &[])));
        tracker.observe(watcher::Event::Apply(create_test_endpoints("foo", "svc3", &[])));

        let mut notifications = tracker.observe(watcher::Event::Init);
        notifications.extend(tracker.observe(watcher::Event::InitApply(create_test_endpoints("foo", "svc2", &[]))));
        notifications.extend(tracker.observe(watcher::Event::InitApply(create_test_endpoints("foo", "svc4", &[]))));
        notifications.extend(tracker.observe(watcher::Event::InitDone));

        assert_eq!(
            keys(&notifications),
            vec!["update foo/svc2", "add foo/svc4", "tombstone foo/svc1", "tombstone foo/svc3"]
        );
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_relisted_objects_wait_for_init_done() {
        let mut tracker = EndpointsTracker::default();
        tracker.observe(watcher::Event::Apply(create_test_endpoints("foo", "svc1", &[])));

        assert!(tracker.observe(watcher::Event::Init).is_empty());
        assert!(tracker.observe(watcher::Event::InitApply(create_test_endpoints("foo", "svc1", &[]))).is_empty());
        assert!(tracker.observe(watcher::Event::InitApply(create_test_endpoints("foo", "svc2", &[]))).is_empty());

        let notifications = tracker.observe(watcher::Event::InitDone);
        assert_eq!(keys(&notifications), vec!["update foo/svc1", "add foo/svc2"]);
    }

    #[tokio::test]
    async fn test_relisted_object_is_reconciled_against_committed_store() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let handler = EventHandler::new(Arc::clone(&queue));
        let bundles = BundleCache::new(Arc::new(Cache::new()), Duration::from_secs(60));
        let (store, mut writer) = reflector::store::<Endpoints>();
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(MockNodeLister::new(&["node1"])),
            bundles.clone(),
        );
        let mut tracker = EndpointsTracker::default();

        // Reflector first, tracker second, as in the watch loop
        let svc1 = create_test_endpoints("foo", "svc1", &[("node1", "foo", "podA")]);
        for event in [
            watcher::Event::Init,
            watcher::Event::InitApply(svc1),
        ] {
            writer.apply_watcher_event(&event);
            for notification in tracker.observe(event) {
                dispatch(&handler, &notification);
            }
        }
        assert!(queue.is_empty(), "Nothing to reconcile while the relist is buffered");

        writer.apply_watcher_event(&watcher::Event::InitDone);
        for notification in tracker.observe(watcher::Event::InitDone) {
            dispatch(&handler, &notification);
        }
        assert_eq!(queue.len(), 1);

        assert!(process_next_work_item(&queue, &reconciler, 15).await);
        assert_eq!(
            bundles.lookup_services("node1", "foo", "podA").unwrap(),
            Some(vec!["svc1".to_string()])
        );
    }

    #[test]
    fn test_tombstone_carries_last_known_state() {
        let mut tracker = EndpointsTracker::default();
        tracker.observe(watcher::Event::Apply(create_test_endpoints("foo", "svc1", &[("node1", "foo", "pod1")])));
        tracker.observe(watcher::Event::Init);

        let notifications = tracker.observe(watcher::Event::InitDone);
        let [Notification::Delete(DeletedEndpoints::Tombstone(tombstone))] = notifications.as_slice() else {
            panic!("expected one tombstone, got {notifications:?}");
        };
        assert_eq!(
            tombstone.last_known.as_ref().and_then(endpoints_key).as_deref(),
            Some("foo/svc1")
        );
    }

    #[tokio::test]
    async fn test_resync_redelivers_every_object() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let handler = EventHandler::new(Arc::clone(&queue));
        let (store, mut writer) = reflector::store::<Endpoints>();
        writer.apply_watcher_event(&watcher::Event::Apply(create_test_endpoints("foo", "svc1", &[])));
        writer.apply_watcher_event(&watcher::Event::Apply(create_test_endpoints("bar", "svc2", &[])));

        assert_eq!(resync_once(&store, &handler), 2);
        assert_eq!(queue.len(), 2);

        let mut delivered = vec![queue.dequeue().await.unwrap(), queue.dequeue().await.unwrap()];
        delivered.sort();
        assert_eq!(delivered, vec!["bar/svc2".to_string(), "foo/svc1".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_feeds_queue() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let handler = EventHandler::new(Arc::clone(&queue));
        let mut tracker = EndpointsTracker::default();

        for notification in tracker.observe(watcher::Event::Apply(create_test_endpoints("foo", "svc1", &[]))) {
            dispatch(&handler, &notification);
        }

        assert_eq!(queue.dequeue().await.as_deref(), Some("foo/svc1"));
    }
}
