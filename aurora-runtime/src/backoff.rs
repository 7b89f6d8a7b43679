//! Per-key exponential backoff for failing work items
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use parking_lot::Mutex;
use std::{collections::HashMap, hash::Hash, time::Duration};

/// Longest delay a key can be held back for
///
/// Longer delays are clamped to this, the timer wheel behind the queue cannot go much further.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Tracks consecutive failures per key and hands out the delay before the next retry
///
/// The first failure of a key waits `base_delay`, every further failure doubles the
/// previous delay, up to `max_delay`. [`forget`](Self::forget) resets the key.
pub struct ItemBackoff<K> {
    builder: ExponentialBuilder,
    max_delay: Duration,
    failures: Mutex<HashMap<K, Failures>>,
}

struct Failures {
    requeues: u32,
    delays: ExponentialBackoff,
}

impl<K: Hash + Eq + Clone> ItemBackoff<K> {
    /// Backs off from `base_delay` up to `max_delay`, both capped at [`MAX_DELAY`]
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay = base_delay.min(MAX_DELAY);
        let max_delay = max_delay.clamp(base_delay, MAX_DELAY);
        Self {
            builder: ExponentialBuilder::default()
                .with_min_delay(base_delay)
                .with_max_delay(max_delay)
                .with_factor(2.0)
                .without_max_times(),
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying it
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let entry = failures.entry(key.clone()).or_insert_with(|| Failures {
            requeues: 0,
            delays: self.builder.build(),
        });
        entry.requeues = entry.requeues.saturating_add(1);
        entry.delays.next().unwrap_or(self.max_delay)
    }

    /// How many times `key` has been handed a delay since it was last forgotten
    pub fn requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).map_or(0, |f| f.requeues)
    }

    /// Stops tracking `key`, the next failure starts over at the base delay
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }
}

impl<K: Hash + Eq + Clone> Default for ItemBackoff<K> {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(1000))
    }
}
