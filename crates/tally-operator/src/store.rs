//! Read-through cache of declarative resources
//!
//! One [`Store`] per resource kind, populated by a kube watch pump and
//! shared read-only with the reconcilers. Event hooks fire for every add,
//! update and delete, on the initial list, and again on each periodic
//! resync; hooks enqueue keys, they never do work inline.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, warn};

use tally_common::config::DEFAULT_RESYNC_PERIOD;

use crate::workqueue::WorkQueue;

/// `(namespace, name)` identity of a namespaced resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` queue key.
    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Hook invoked on store events. Implementations must be cheap and
/// non-blocking; the watch pump calls them inline.
pub trait EventHook: Send + Sync {
    fn on_change(&self, key: &ObjectKey);
    fn on_delete(&self, key: &ObjectKey) {
        let _ = key;
    }
}

/// Hook that enqueues changed keys on a work queue.
pub struct EnqueueHook {
    queue: Arc<WorkQueue>,
}

impl EnqueueHook {
    pub fn new(queue: Arc<WorkQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }
}

impl EventHook for EnqueueHook {
    fn on_change(&self, key: &ObjectKey) {
        self.queue.add(&key.to_string());
    }
}

/// Per-kind cache of shared resource snapshots.
pub struct Store<K> {
    cache: DashMap<ObjectKey, Arc<K>>,
    hooks: parking_lot::RwLock<Vec<Arc<dyn EventHook>>>,
    synced: AtomicBool,
}

impl<K> Store<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: DashMap::new(),
            hooks: parking_lot::RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        })
    }

    pub fn register_hook(&self, hook: Arc<dyn EventHook>) {
        self.hooks.write().push(hook);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.cache
            .get(&ObjectKey::new(namespace, name))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every cached resource in `namespace`.
    pub fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.cache
            .iter()
            .filter(|entry| entry.key().namespace == namespace)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// True once the initial list has completed.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    fn key_of(obj: &K) -> Option<ObjectKey> {
        let namespace = obj.namespace()?;
        Some(ObjectKey::new(namespace, obj.name_any()))
    }

    /// Upsert from a watch event and fire change hooks.
    pub fn apply(&self, obj: K) {
        let Some(key) = Self::key_of(&obj) else {
            warn!("dropping cluster-scoped object from namespaced store");
            return;
        };
        self.cache.insert(key.clone(), Arc::new(obj));
        for hook in self.hooks.read().iter() {
            hook.on_change(&key);
        }
    }

    /// Remove from a delete event and fire delete + change hooks.
    pub fn delete(&self, obj: &K) {
        let Some(key) = Self::key_of(obj) else {
            return;
        };
        self.cache.remove(&key);
        for hook in self.hooks.read().iter() {
            hook.on_delete(&key);
            hook.on_change(&key);
        }
    }

    /// Re-fire change hooks for every cached key (periodic resync).
    pub fn resync(&self) {
        for entry in self.cache.iter() {
            for hook in self.hooks.read().iter() {
                hook.on_change(entry.key());
            }
        }
    }
}

/// Pump watch events for one resource kind into its store until the stop
/// signal fires. Restarts of the underlying watch re-list into the cache;
/// a resync ticker re-enqueues every key each minute.
pub async fn run_watch<K>(api: Api<K>, store: Arc<Store<K>>, mut stop: watch::Receiver<bool>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + DEFAULT_RESYNC_PERIOD,
        DEFAULT_RESYNC_PERIOD,
    );

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("watch pump stopping");
                return;
            }
            _ = resync.tick() => {
                store.resync();
            }
            event = stream.try_next() => match event {
                Ok(Some(watcher::Event::Apply(obj))) => store.apply(obj),
                Ok(Some(watcher::Event::Delete(obj))) => store.delete(&obj),
                Ok(Some(watcher::Event::Init)) => {}
                Ok(Some(watcher::Event::InitApply(obj))) => store.apply(obj),
                Ok(Some(watcher::Event::InitDone)) => store.mark_synced(),
                Ok(None) => {
                    warn!("watch stream ended");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "watch error, backing off");
                }
            }
        }
    }
}
