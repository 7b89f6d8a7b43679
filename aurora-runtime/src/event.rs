//! Change notifications delivered by an [`Informer`](crate::Informer) and their translation into queue keys
use crate::key::ObjectKey;
use kube::{Resource, ResourceExt};
use std::sync::Arc;

/// A change to a cached object
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    /// An object was seen for the first time
    Added(Arc<K>),
    /// A known object was modified, or re-delivered by a resync
    Updated {
        /// The cached state before the change
        old: Arc<K>,
        /// The state after the change
        new: Arc<K>,
    },
    /// An object was removed
    Deleted(DeletedObject<K>),
}

/// The state of an object at the time it was deleted
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    /// The delete was observed on the watch, with the final object
    Object(Arc<K>),
    /// The delete was inferred from a relist, the object is only the last state we knew about
    Tombstone(Tombstone<K>),
}

/// The last known state of an object whose delete event was missed
#[derive(Debug, Clone)]
pub struct Tombstone<K> {
    /// The key the object was cached under
    pub key: ObjectKey,
    /// The object as it was before it vanished
    pub last_known: Arc<K>,
}

impl<K> DeletedObject<K> {
    /// The object as it was last seen, tombstone or not
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Object(obj) => obj,
            Self::Tombstone(tombstone) => &tombstone.last_known,
        }
    }
}

impl<K> ResourceEvent<K> {
    /// The object the event is about (the new state for updates)
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(obj) | Self::Updated { new: obj, .. } => obj,
            Self::Deleted(deleted) => deleted.object(),
        }
    }
}

impl<K: Resource> ResourceEvent<K> {
    /// The key of the object the event is about
    ///
    /// Tombstones fall back to the key they were cached under if the last known
    /// state carries no name.
    pub fn key(&self) -> Option<ObjectKey> {
        match self {
            Self::Deleted(DeletedObject::Tombstone(tombstone)) => {
                ObjectKey::from_obj(&*tombstone.last_known).or_else(|| Some(tombstone.key.clone()))
            }
            _ => ObjectKey::from_obj(&**self.object()),
        }
    }
}

/// Which kinds of notifications a watched source reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triggers {
    /// React to [`ResourceEvent::Added`]
    pub added: bool,
    /// React to [`ResourceEvent::Updated`] where the resource version changed
    pub updated: bool,
    /// React to [`ResourceEvent::Deleted`], tombstones included
    pub deleted: bool,
}

impl Triggers {
    /// React to every notification
    pub const ALL: Self = Self {
        added: true,
        updated: true,
        deleted: true,
    };
    /// React to adds and real updates, ignore deletes
    pub const APPLIED: Self = Self {
        added: true,
        updated: true,
        deleted: false,
    };
    /// React to real updates and deletes, ignore adds
    pub const CHANGED: Self = Self {
        added: false,
        updated: true,
        deleted: true,
    };
}

impl Default for Triggers {
    fn default() -> Self {
        Self::ALL
    }
}

type Mapper<K> = Box<dyn Fn(&K) -> Option<ObjectKey> + Send + Sync>;

enum KeySource<K> {
    /// The changed object is what gets reconciled
    Own,
    /// Some other object, found by the mapper
    Mapped(Mapper<K>),
}

/// Decides whether a notification should enqueue, and under which key
///
/// All the filtering rules live here rather than in the individual event callbacks:
///
/// - the notification kind must be enabled in the [`Triggers`]
/// - an update where the old and new object carry the same resource version is a
///   resync artifact and is dropped
/// - the object (or tombstone) is mapped to the key of the object to reconcile
pub struct EventTranslator<K> {
    triggers: Triggers,
    source: KeySource<K>,
}

impl<K: Resource + 'static> EventTranslator<K> {
    /// Reconciles the changed object itself
    #[must_use]
    pub fn for_self(triggers: Triggers) -> Self {
        Self {
            triggers,
            source: KeySource::Own,
        }
    }

    /// Reconciles whatever `mapper` points at, if anything
    ///
    /// Tombstones are mapped from their last known state like any other delete.
    #[must_use]
    pub fn with_mapper(
        triggers: Triggers,
        mapper: impl Fn(&K) -> Option<ObjectKey> + Send + Sync + 'static,
    ) -> Self {
        Self {
            triggers,
            source: KeySource::Mapped(Box::new(mapper)),
        }
    }

    /// Translate a notification into the key that should be enqueued, if any
    pub fn translate(&self, event: &ResourceEvent<K>) -> Option<ObjectKey> {
        let enabled = match event {
            ResourceEvent::Added(_) => self.triggers.added,
            ResourceEvent::Updated { old, new } => self.triggers.updated && !is_resync(&**old, &**new),
            ResourceEvent::Deleted(_) => self.triggers.deleted,
        };
        if !enabled {
            return None;
        }
        match &self.source {
            KeySource::Own => event.key(),
            KeySource::Mapped(mapper) => mapper(&**event.object()),
        }
    }
}

/// Whether an update only re-delivers an unchanged object
fn is_resync<K: Resource>(old: &K, new: &K) -> bool {
    match (old.resource_version(), new.resource_version()) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}
