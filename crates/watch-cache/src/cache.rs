//! Watch cache.
//!
//! Applies a list/watch stream (the `kube_runtime::watcher::Event`
//! vocabulary) to a [`Store`] and tells subscribers what changed. Sources are
//! responsible for retrying and relisting; every relist is reconciled against
//! the store so that objects which disappeared while the stream was down are
//! reported as deletions.

use crate::store::{ObjectKey, Store};
use futures::{Stream, StreamExt};
use kube::Resource;
use kube_runtime::watcher;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Consumer of cache notifications.
///
/// Handlers run on the cache's delivery loop, one call at a time, in the
/// order the source emitted the changes. They must return quickly; the usual
/// implementation just enqueues a key.
pub trait EventHandler<K>: Send + Sync {
    /// `is_in_initial_list` is true while the first list is being applied.
    fn on_add(&self, obj: &Arc<K>, is_in_initial_list: bool);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &Arc<K>);
}

/// Local mirror of a remote collection.
///
/// Cheap to clone; clones share the store, the subscribers and the sync flag.
pub struct WatchCache<K> {
    name: Arc<str>,
    store: Store<K>,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler<K>>>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl<K> Clone for WatchCache<K> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: self.store.clone(),
            handlers: Arc::clone(&self.handlers),
            synced: Arc::clone(&self.synced),
        }
    }
}

impl<K> fmt::Debug for WatchCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchCache")
            .field("name", &self.name)
            .field("store", &self.store)
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl<K> WatchCache<K> {
    /// Creates an empty, unsynced cache over a fresh store.
    pub fn new(name: &str) -> Self {
        Self::with_store(name, Store::default())
    }

    /// Creates a cache over an existing (possibly seeded) store.
    pub fn with_store(name: &str, store: Store<K>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name: Arc::from(name),
            store,
            handlers: Arc::new(RwLock::new(Vec::new())),
            synced: Arc::new(synced),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Registers a subscriber for every change applied after this call.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// True once the first full list has been applied. Never goes back to false.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Blocks until the cache has synced or `shutdown` fires.
    ///
    /// Returns whether the cache is synced.
    pub async fn wait_for_sync(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            biased;
            res = synced.wait_for(|s| *s) => res.is_ok(),
            _ = shutdown.wait_for(|stop| *stop) => self.has_synced(),
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<K: Resource> WatchCache<K> {
    /// Applies `stream` to the store until the stream ends or `shutdown` fires.
    ///
    /// Errors yielded by the stream are logged; the source is expected to
    /// recover by itself (retry, then relist).
    pub async fn run<S, E>(&self, stream: S, mut shutdown: watch::Receiver<bool>)
    where
        S: Stream<Item = Result<watcher::Event<K>, E>>,
        E: fmt::Display,
    {
        info!(cache = %self.name, "Starting watch cache");
        let mut stream = std::pin::pin!(stream);
        let mut relist: Option<HashMap<ObjectKey, Arc<K>>> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!(cache = %self.name, "Stopping watch cache");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event, &mut relist),
                    Some(Err(e)) => {
                        warn!(cache = %self.name, error = %e, "Watch stream error, waiting for the source to recover");
                    }
                    None => {
                        warn!(cache = %self.name, "Watch stream ended");
                        break;
                    }
                },
            }
        }
    }

    fn apply(&self, event: watcher::Event<K>, relist: &mut Option<HashMap<ObjectKey, Arc<K>>>) {
        match event {
            watcher::Event::Init => {
                debug!(cache = %self.name, "Relist started");
                *relist = Some(HashMap::new());
            }
            watcher::Event::InitApply(obj) => match relist.as_mut() {
                Some(buffer) => {
                    buffer.insert(ObjectKey::from_resource(&obj), Arc::new(obj));
                }
                None => self.apply_one(obj),
            },
            watcher::Event::InitDone => {
                let fresh = relist.take().unwrap_or_default();
                self.replace(fresh);
            }
            watcher::Event::Apply(obj) => self.apply_one(obj),
            watcher::Event::Delete(obj) => {
                let key = ObjectKey::from_resource(&obj);
                if self.store.remove(&key).is_some() {
                    debug!(cache = %self.name, key = %key, "Object deleted");
                    let obj = Arc::new(obj);
                    for handler in self.handlers() {
                        handler.on_delete(&obj);
                    }
                }
            }
        }
    }

    fn apply_one(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        let obj = Arc::new(obj);
        let previous = self.store.upsert(key, Arc::clone(&obj));
        for handler in self.handlers() {
            match &previous {
                Some(old) => handler.on_update(old, &obj),
                None => handler.on_add(&obj, false),
            }
        }
    }

    /// Reconciles a complete list against the store.
    fn replace(&self, fresh: HashMap<ObjectKey, Arc<K>>) {
        let initial = !self.has_synced();
        let additions: Vec<(ObjectKey, Arc<K>)> = fresh
            .iter()
            .map(|(key, obj)| (key.clone(), Arc::clone(obj)))
            .collect();
        let mut previous = self.store.replace(fresh);
        let handlers = self.handlers();

        for (key, obj) in &additions {
            match previous.remove(key) {
                Some(old) => handlers.iter().for_each(|h| h.on_update(&old, obj)),
                None => handlers.iter().for_each(|h| h.on_add(obj, initial)),
            }
        }
        for (key, gone) in previous {
            debug!(cache = %self.name, key = %key, "Object vanished during relist");
            handlers.iter().for_each(|h| h.on_delete(&gone));
        }

        info!(cache = %self.name, objects = additions.len(), "Relist complete");
        self.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
    }
}
