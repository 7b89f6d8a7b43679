//! Keeps a [`Store`] in sync with the cluster and fans out change notifications
use crate::{
    event::ResourceEvent,
    store::{store, Store, Writer},
};
use futures::{future, stream::BoxStream, Future, Stream, StreamExt};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Resource,
};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, time::Duration};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

type Subscriber<K> = Box<dyn Fn(&ResourceEvent<K>) + Send + Sync>;

/// A shared informer for one kind of object
///
/// The informer owns the [`Writer`] half of a cache. While [`run`](Self::run) is
/// polled it applies every watch event to the cache and then hands the resulting
/// [`ResourceEvent`]s to each subscriber, in registration order. The cache is
/// always updated before subscribers see the change, so handlers that look an
/// object up in response to an event observe at least that state.
///
/// With a resync period set, every cached object is periodically re-delivered as
/// an update to itself.
pub struct Informer<K: Resource + 'static> {
    events: BoxStream<'static, watcher::Result<watcher::Event<K>>>,
    writer: Writer<K>,
    subscribers: Vec<Subscriber<K>>,
    resync_period: Option<Duration>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Watches `api` with `config`, reconnecting with the default watch backoff on errors
    #[must_use]
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self::from_stream(watcher(api, config).default_backoff())
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Drives the informer from an arbitrary stream of watch events
    pub fn from_stream<S>(events: S) -> Self
    where
        S: Stream<Item = watcher::Result<watcher::Event<K>>> + Send + 'static,
    {
        let (_, writer) = store();
        Self {
            events: events.boxed(),
            writer,
            subscribers: Vec::new(),
            resync_period: None,
        }
    }

    /// Re-delivers all cached objects every `period`
    #[must_use]
    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }

    /// A read handle to the informer's cache
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Registers a callback that receives every change notification
    pub fn subscribe(&mut self, subscriber: impl Fn(&ResourceEvent<K>) + Send + Sync + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Runs until `shutdown` resolves or the watch stream ends
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let kind = K::kind(&K::DynamicType::default()).into_owned();
        let mut resync = self.resync_period.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    debug!(%kind, "informer shutting down");
                    break;
                }
                event = self.events.next() => match event {
                    Some(Ok(event)) => {
                        let notifications = self.writer.apply_watcher_event(&event);
                        self.dispatch(&notifications);
                    }
                    Some(Err(err)) => warn!(%kind, error = %err, "watch failed"),
                    None => {
                        debug!(%kind, "watch stream ended");
                        break;
                    }
                },
                () = tick(&mut resync) => {
                    let notifications = self.writer.resync();
                    trace!(%kind, objects = notifications.len(), "resync");
                    self.dispatch(&notifications);
                }
            }
        }
    }

    fn dispatch(&self, notifications: &[ResourceEvent<K>]) {
        for notification in notifications {
            for subscriber in &self.subscribers {
                subscriber(notification);
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
