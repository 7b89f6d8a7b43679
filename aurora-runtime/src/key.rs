//! Names of the objects that flow through the work queue
use kube::Resource;
use std::fmt::{self, Display};

/// The identity of an object to reconcile
///
/// Keys are what the [`WorkQueue`](crate::WorkQueue) deduplicates on, so two events
/// for the same object always collapse into a single key regardless of which watch
/// event produced them.
///
/// ```
/// use aurora_runtime::ObjectKey;
/// assert_eq!(ObjectKey::new("default").within("kube-system").to_string(), "kube-system/default");
/// assert_eq!(ObjectKey::new("kube-system").to_string(), "kube-system");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The namespace of the object
    ///
    /// `None` for cluster-scoped kinds such as `Namespace`.
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectKey {
    /// A key for the cluster-scoped object `name`
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Moves the key into `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ObjectKey` from the object's metadata
    ///
    /// Returns `None` if the object has no name, which the API server never emits.
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self {
            name: meta.name.clone()?,
            namespace: meta.namespace.clone(),
        })
    }

    /// Parses the `namespace/name` (or bare `name`) form produced by [`Display`]
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some(Self::new(name).within(ns))
            }
            Some(_) => None,
            None if key.is_empty() => None,
            None => Some(Self::new(key)),
        }
    }

    /// The namespace, or an empty string for cluster-scoped keys
    #[must_use]
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.name)
    }
}
