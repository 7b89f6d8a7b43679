//! Delays messages until a requested deadline, collapsing duplicates
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    collections::{hash_map::Entry, HashMap},
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request to emit `message` at a given `Instant` (`run_at`).
#[derive(Debug)]
pub struct ScheduleRequest<T> {
    /// What to emit
    pub message: T,
    /// When to emit it
    pub run_at: Instant,
}

/// Internal metadata for a scheduled message.
struct ScheduledEntry {
    run_at: Instant,
    queue_key: delay_queue::Key,
}

/// Stream returned by [`scheduler`]
#[pin_project(project = SchedulerProj)]
pub struct Scheduler<T, R> {
    /// Queue of already-scheduled messages.
    ///
    /// Only touch this through `schedule_message` and `poll_pop_queue_message`,
    /// so that `scheduled` stays in sync.
    queue: DelayQueue<T>,
    /// Metadata for all currently scheduled messages. Used to detect duplicate messages.
    scheduled: HashMap<T, ScheduledEntry>,
    /// Incoming queue of scheduling requests.
    #[pin]
    requests: Fuse<R>,
}

impl<T, R: Stream> Scheduler<T, R> {
    fn new(requests: R) -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
            requests: requests.fuse(),
        }
    }
}

impl<T: Hash + Eq + Clone, R> SchedulerProj<'_, T, R> {
    /// Attempt to schedule a message into the queue.
    ///
    /// If the message is already in the queue then the earlier `request.run_at` takes precedence.
    fn schedule_message(&mut self, request: ScheduleRequest<T>) {
        match self.scheduled.entry(request.message) {
            Entry::Occupied(mut old_entry) if old_entry.get().run_at > request.run_at => {
                // Old entry would run after the new request, so pull it forward
                let entry = old_entry.get_mut();
                self.queue.reset_at(&entry.queue_key, request.run_at);
                entry.run_at = request.run_at;
            }
            // Equal or earlier deadline already pending
            Entry::Occupied(_old_entry) => {}
            Entry::Vacant(entry) => {
                let message = entry.key().clone();
                entry.insert(ScheduledEntry {
                    run_at: request.run_at,
                    queue_key: self.queue.insert_at(message, request.run_at),
                });
            }
        }
    }

    fn poll_pop_queue_message(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let msg = expired.into_inner();
                self.scheduled.remove(&msg);
                Poll::Ready(Some(msg))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, R> Scheduler<T, R> {
    /// Number of messages waiting for their deadline
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    /// Whether no message is waiting
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }
}

impl<T, R> Stream for Scheduler<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = ScheduleRequest<T>>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut scheduler = self.project();

        while let Poll::Ready(Some(request)) = scheduler.requests.as_mut().poll_next(cx) {
            scheduler.schedule_message(request);
        }

        match scheduler.poll_pop_queue_message(cx) {
            Poll::Ready(Some(msg)) => Poll::Ready(Some(msg)),
            Poll::Ready(None) => {
                if scheduler.requests.is_terminated() {
                    // No more requests can arrive and nothing is left in flight
                    Poll::Ready(None)
                } else {
                    // The delay queue is empty, but we may get more requests in the future...
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Stream transformer that takes a message and `Instant` (in the form of a `ScheduleRequest`), and emits
/// the message at the specified `Instant`.
///
/// Messages are de-duplicated: if a message is submitted twice before being emitted then it will only be
/// emitted once, at the earlier of the two `Instant`s.
pub fn scheduler<T: Eq + Hash + Clone, S: Stream<Item = ScheduleRequest<T>>>(requests: S) -> Scheduler<T, S> {
    Scheduler::new(requests)
}
