//! A deduplicating, rate-limited queue of keys shared by a pool of workers
use crate::{
    backoff::{ItemBackoff, MAX_DELAY},
    scheduler::{scheduler, ScheduleRequest},
};
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tracing::{error, trace};

/// Queue bookkeeping, only ever touched under the lock
struct State<K> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<K>,
    /// Keys that need processing; every key in `queue` is dirty
    dirty: HashSet<K>,
    /// Keys currently leased to a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Work queue handing out keys to workers
///
/// The queue guarantees that a key is never handed to two workers at once:
///
/// - [`add`](Self::add) of a key that is already queued is a no-op
/// - [`add`](Self::add) of a key that a worker is processing marks it dirty, it is
///   queued again (once) when the worker calls [`done`](Self::done)
///
/// Failed keys are retried through [`add_rate_limited`](Self::add_rate_limited), which
/// delays them according to the key's consecutive failures.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ItemBackoff<K>,
    delayed_tx: Mutex<Option<mpsc::UnboundedSender<ScheduleRequest<K>>>>,
    delayed_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K> WorkQueue<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    /// Creates a queue and starts the background task that releases delayed keys
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(backoff: ItemBackoff<K>) -> Arc<Self> {
        let (delayed_tx, delayed_rx) = mpsc::unbounded();
        let queue = Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
            delayed_tx: Mutex::new(Some(delayed_tx)),
            delayed_task: Mutex::new(None),
        });
        let task = tokio::spawn(release_delayed(Arc::downgrade(&queue), delayed_rx));
        *queue.delayed_task.lock() = Some(task);
        queue
    }

    /// Marks `key` as needing processing
    pub fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Picked up again by `done`
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `key` once `delay` has passed
    ///
    /// If the key is already waiting, the earlier deadline wins.
    /// Delays beyond [`MAX_DELAY`] are shortened to it.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        if self.is_shutting_down() {
            return;
        }
        if let Some(tx) = self.delayed_tx.lock().as_ref() {
            let request = ScheduleRequest {
                message: key,
                run_at: Instant::now() + delay.min(MAX_DELAY),
            };
            if let Err(err) = tx.unbounded_send(request) {
                error!(key = ?err.into_inner().message, "delayed key lost, the release task is gone");
            }
        }
    }

    /// Adds `key` after the backoff delay for its consecutive failures
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.backoff.next_delay(&key);
        trace!(?key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Resets the failure count of `key`
    ///
    /// This does not remove the key from the queue, it only stops tracking its backoff.
    pub fn forget(&self, key: &K) {
        self.backoff.forget(key);
    }

    /// How many times `key` has been requeued through [`add_rate_limited`](Self::add_rate_limited)
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.backoff.requeues(key)
    }

    /// Waits for the next key to process
    ///
    /// Returns `None` once the queue is shut down and every ready key has been handed out.
    /// The caller owns the key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so an `add` racing with us is never missed
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases the lease on `key`
    ///
    /// If the key was added while it was being processed it is queued again.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops accepting new keys and wakes up all waiting workers
    ///
    /// Keys that are already ready are still handed out by [`get`](Self::get),
    /// keys waiting for a delay are discarded.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.delayed_tx.lock().take();
        if let Some(task) = self.delayed_task.lock().take() {
            task.abort();
        }
        self.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for WorkQueue<K> {
    fn drop(&mut self) {
        if let Some(task) = self.delayed_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Feeds keys into the queue once their delay has expired
async fn release_delayed<K>(queue: Weak<WorkQueue<K>>, requests: mpsc::UnboundedReceiver<ScheduleRequest<K>>)
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    let mut ready = Box::pin(scheduler(requests));
    while let Some(key) = ready.next().await {
        match queue.upgrade() {
            Some(queue) => queue.add(key),
            None => break,
        }
    }
}
