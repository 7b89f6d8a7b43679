//! In-memory cache of watched objects
use crate::{
    event::{DeletedObject, ResourceEvent, Tombstone},
    key::ObjectKey,
};
use ahash::AHashMap;
use kube::{runtime::watcher, Resource};
use parking_lot::RwLock;
use std::{fmt::Debug, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;

type Cache<K> = Arc<RwLock<AHashMap<ObjectKey, Arc<K>>>>;

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple informers.
/// In particular, relists will clobber the state of other connected writers.
#[derive(Debug)]
pub struct Writer<K: 'static + Resource> {
    store: Cache<K>,
    buffer: AHashMap<ObjectKey, Arc<K>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<K: 'static + Resource + Clone> Default for Writer<K> {
    fn default() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            store: Arc::default(),
            buffer: AHashMap::new(),
            ready_tx,
            ready_rx,
        }
    }
}

impl<K: 'static + Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }

    /// Applies a single watcher event to the store, returning the resulting change notifications
    ///
    /// A relist (`Init` .. `InitDone`) is buffered and then diffed against the cache as a whole:
    /// objects that are new become [`ResourceEvent::Added`], objects that are still around become
    /// [`ResourceEvent::Updated`] (with unchanged resource versions if nothing happened), and objects
    /// that disappeared while we weren't watching become tombstoned [`ResourceEvent::Deleted`]s.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) -> Vec<ResourceEvent<K>> {
        match event {
            watcher::Event::Apply(obj) => {
                let Some(key) = ObjectKey::from_obj(obj) else {
                    return vec![];
                };
                let new = Arc::new(obj.clone());
                match self.store.write().insert(key, new.clone()) {
                    Some(old) => vec![ResourceEvent::Updated { old, new }],
                    None => vec![ResourceEvent::Added(new)],
                }
            }
            watcher::Event::Delete(obj) => {
                if let Some(key) = ObjectKey::from_obj(obj) {
                    self.store.write().remove(&key);
                }
                vec![ResourceEvent::Deleted(DeletedObject::Object(Arc::new(obj.clone())))]
            }
            watcher::Event::Init => {
                self.buffer = AHashMap::new();
                vec![]
            }
            watcher::Event::InitApply(obj) => {
                if let Some(key) = ObjectKey::from_obj(obj) {
                    self.buffer.insert(key, Arc::new(obj.clone()));
                }
                vec![]
            }
            watcher::Event::InitDone => {
                let listed = std::mem::take(&mut self.buffer);
                let events = {
                    let mut store = self.store.write();
                    let mut events = Vec::with_capacity(listed.len());
                    for (key, old) in store.iter() {
                        if !listed.contains_key(key) {
                            events.push(ResourceEvent::Deleted(DeletedObject::Tombstone(Tombstone {
                                key: key.clone(),
                                last_known: old.clone(),
                            })));
                        }
                    }
                    for (key, new) in &listed {
                        events.push(match store.get(key) {
                            Some(old) => ResourceEvent::Updated {
                                old: old.clone(),
                                new: new.clone(),
                            },
                            None => ResourceEvent::Added(new.clone()),
                        });
                    }
                    *store = listed;
                    events
                };
                // Mark as ready after the first relist, allowing `wait_until_ready` to return
                self.ready_tx.send_replace(true);
                events
            }
        }
    }

    /// Re-delivers every cached object as an update to itself
    ///
    /// Consumers that only react to real changes (see [`EventTranslator`](crate::EventTranslator))
    /// ignore these.
    pub fn resync(&self) -> Vec<ResourceEvent<K>> {
        self.store
            .read()
            .values()
            .map(|obj| ResourceEvent::Updated {
                old: obj.clone(),
                new: obj.clone(),
            })
            .collect()
    }
}

/// A readable cache of Kubernetes objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Debug)]
pub struct Store<K: 'static + Resource> {
    store: Cache<K>,
    ready_rx: watch::Receiver<bool>,
}

impl<K: 'static + Resource> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }
}

/// The [`Writer`] was dropped before the store finished its initial list
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("writer was dropped before store became ready")]
pub struct WriterDropped;

impl<K: 'static + Clone + Resource> Store<K> {
    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    /// If any of these are a problem then return an error from the reconciler and let it retry later.
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Whether the initial list has been received
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait for the store to be populated by the initial list
    ///
    /// # Errors
    ///
    /// Fails if the [`Writer`] is dropped before the initial list completed.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        self.sync_handle().wait().await
    }

    /// A type-erased handle to the readiness of this store
    #[must_use]
    pub fn sync_handle(&self) -> CacheSync {
        CacheSync(self.ready_rx.clone())
    }
}

/// Readiness of a single store, independent of the object type it holds
#[derive(Debug, Clone)]
pub struct CacheSync(watch::Receiver<bool>);

impl CacheSync {
    /// Whether the store has received its initial list
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// # Errors
    ///
    /// Fails if the [`Writer`] is dropped before the initial list completed.
    pub async fn wait(&self) -> Result<(), WriterDropped> {
        let mut rx = self.0.clone();
        rx.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| WriterDropped)
    }
}

/// Create a (Reader, Writer) for a `Store<K>` for a typed resource `K`
///
/// The `Writer` is meant to be driven by an [`Informer`](crate::Informer).
#[must_use]
pub fn store<K>() -> (Store<K>, Writer<K>)
where
    K: Resource + Clone + 'static,
{
    let w = Writer::<K>::default();
    let r = w.as_reader();
    (r, w)
}
