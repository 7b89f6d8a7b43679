//! Runs a [`Reconciler`] for every key that the watched informers enqueue

use crate::{
    backoff::ItemBackoff,
    event::{EventTranslator, ResourceEvent},
    informer::Informer,
    key::ObjectKey,
    store::{CacheSync, WriterDropped},
    wait::wait_for_cache_sync,
    workqueue::WorkQueue,
};
use async_trait::async_trait;
use futures::Future;
use kube::Resource;
use std::{fmt::Debug, pin::pin, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Reasons a [`Controller`] fails to start
#[derive(Debug, Error)]
pub enum Error {
    /// A watched informer went away before its cache was filled
    #[error("cache lost its watch before syncing")]
    CacheSyncFailed(#[source] WriterDropped),
    /// [`Config::cache_sync_timeout`] elapsed first
    #[error("caches did not sync within {0:?}")]
    CacheSyncTimeout(Duration),
    /// The shutdown signal fired while waiting for the caches
    #[error("shut down before caches synced")]
    ShutdownBeforeSync,
}

/// Brings the object behind a key to its desired state
///
/// Implementations must be idempotent: they are called at least once for every change,
/// possibly more often, and should read the current state before deciding to act.
/// Returning an error retries the key with backoff, the [`Controller`] owns all retry policy.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The error returned by failed attempts
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reconciles the object that `key` names, which may no longer exist
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), Self::Error>;
}

/// Tuning for a [`Controller`]
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent workers
    pub workers: usize,
    /// How many times a failing key is requeued before it is dropped
    pub max_retries: u32,
    /// Delay before the first retry of a key
    pub base_delay: Duration,
    /// Upper bound of the delay between retries
    pub max_delay: Duration,
    /// Give up starting if the caches have not synced by then
    pub cache_sync_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 15,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1000),
            cache_sync_timeout: None,
        }
    }
}

impl Config {
    /// Sets [`Config::workers`]
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets [`Config::max_retries`]
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry delays, see [`ItemBackoff::new`]
    #[must_use]
    pub fn backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Sets [`Config::cache_sync_timeout`]
    #[must_use]
    pub fn cache_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }
}

/// A work queue, a pool of workers and the [`Reconciler`] they call
///
/// Sources are attached with [`watches`](Self::watches) before the controller is
/// started, each with an [`EventTranslator`] that decides which of its notifications
/// enqueue which key. [`run`](Self::run) then waits for all of their caches to sync,
/// and processes keys until shut down.
///
/// A key is never reconciled by two workers at once. Notifications that arrive for a
/// key while it is being reconciled collapse into a single follow-up run.
pub struct Controller<R> {
    name: &'static str,
    reconciler: R,
    config: Config,
    queue: Arc<WorkQueue<ObjectKey>>,
    caches: Vec<CacheSync>,
}

impl<R: Reconciler> Controller<R> {
    /// Must be called from within a tokio runtime, see [`WorkQueue::new`]
    pub fn new(name: &'static str, reconciler: R, config: Config) -> Self {
        let queue = WorkQueue::new(ItemBackoff::new(config.base_delay, config.max_delay));
        Self {
            name,
            reconciler,
            config,
            queue,
            caches: Vec::new(),
        }
    }

    /// Enqueues the keys that `translator` derives from `informer`'s notifications
    ///
    /// The informer's cache also becomes a precondition for starting the workers.
    pub fn watches<K>(&mut self, informer: &mut Informer<K>, translator: EventTranslator<K>)
    where
        K: Resource + Clone + Debug + Send + Sync + 'static,
        K::DynamicType: Default,
    {
        let queue = self.queue.clone();
        informer.subscribe(move |event| {
            if let Some(key) = translator.translate(event) {
                queue.add(key);
            }
        });
        self.caches.push(informer.store().sync_handle());
    }

    /// Enqueues the object behind `event` for reconciliation, bypassing all filters
    ///
    /// Deletes that only carry a tombstone still enqueue the key it was cached under.
    pub fn handle_object<K: Resource>(&self, event: &ResourceEvent<K>) {
        match event.key() {
            Some(key) => self.queue.add(key),
            None => warn!(controller = self.name, "ignoring object without a name"),
        }
    }

    /// The controller's work queue
    #[must_use]
    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        self.queue.clone()
    }

    /// Runs the workers until `shutdown` resolves
    ///
    /// Keys that are already queued when `shutdown` resolves are still processed,
    /// pending retries are dropped. Returns once every worker has exited.
    ///
    /// # Errors
    ///
    /// Fails without starting any worker if the watched caches don't sync, see [`Error`].
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        let mut shutdown = pin!(shutdown);
        let name = self.name;
        info!(controller = name, "waiting for caches to sync");
        tokio::select! {
            biased;
            synced = self.wait_for_caches() => synced?,
            () = &mut shutdown => return Err(Error::ShutdownBeforeSync),
        }

        let controller = Arc::new(self);
        let mut workers = JoinSet::new();
        for worker in 0..controller.config.workers {
            let controller = controller.clone();
            workers.spawn(
                async move { while controller.process_next_work_item().await {} }
                    .instrument(info_span!("worker", controller = name, worker)),
            );
        }
        info!(controller = name, workers = controller.config.workers, "started workers");

        shutdown.await;
        info!(controller = name, "shutting down workers");
        controller.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(err) = res {
                error!(controller = name, error = %err, "worker crashed");
            }
        }
        Ok(())
    }

    async fn wait_for_caches(&self) -> Result<(), Error> {
        let synced = wait_for_cache_sync(&self.caches);
        match self.config.cache_sync_timeout {
            Some(timeout) => tokio::time::timeout(timeout, synced)
                .await
                .map_err(|_| Error::CacheSyncTimeout(timeout))?
                .map_err(Error::CacheSyncFailed),
            None => synced.await.map_err(Error::CacheSyncFailed),
        }
    }

    /// Takes one key off the queue and reconciles it
    ///
    /// Returns `false` once the queue has shut down.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        match self.reconciler.reconcile(&key).await {
            Ok(()) => {
                debug!(%key, "reconciled");
                self.queue.forget(&key);
            }
            Err(err) => {
                let requeues = self.queue.num_requeues(&key);
                if requeues < self.config.max_retries {
                    warn!(%key, error = %err, requeues, "reconcile failed, retrying");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(%key, error = %err, requeues, "reconcile failed, dropping key out of the queue");
                    self.queue.forget(&key);
                }
            }
        }
        self.queue.done(&key);
        true
    }
}
