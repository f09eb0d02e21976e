//! Trailing-edge throttling
//!
//! Progress events fire far more often than anyone needs to redraw a peer
//! list. A [`Throttle`] keeps only the newest value offered during a window
//! and releases it once the window closes. Nothing is queued.
//!
//! Time is always passed in, so the owner decides which clock drives it.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::time::{Duration, Instant};

/// Default delivery cadence for peer updates
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Stand-in for "never": roughly thirty years out, like tokio's own far future
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + delay`, clamped so huge delays can't overflow the clock
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Rate limiter for a single stream of values
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            deadline: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a value, replacing any value still waiting
    ///
    /// The first offer of a window fixes its deadline; later offers in the
    /// same window only swap the pending value. Windows open on an offer,
    /// so two deliveries are always at least one interval apart.
    pub fn offer(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        if self.deadline.is_none() {
            self.deadline = Some(deadline_after(now, self.interval));
        }
    }

    /// Take the pending value if its window has closed
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Take the pending value right away, ignoring the window
    pub fn flush(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }

    /// When the pending value becomes due
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Independent throttles keyed by source
///
/// Values offered under one key never delay or replace values under another.
#[derive(Debug)]
pub struct ThrottleSet<K, T> {
    interval: Duration,
    throttles: HashMap<K, Throttle<T>>,
}

impl<K: Eq + Hash + Clone, T> ThrottleSet<K, T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            throttles: HashMap::new(),
        }
    }

    pub fn offer(&mut self, key: K, value: T, now: Instant) {
        let interval = self.interval;
        self.throttles
            .entry(key)
            .or_insert_with(|| Throttle::new(interval))
            .offer(value, now);
    }

    /// Every value whose window has closed, oldest deadline first
    pub fn poll(&mut self, now: Instant) -> Vec<(K, T)> {
        let mut due: Vec<(Instant, K, T)> = Vec::new();
        for (key, throttle) in self.throttles.iter_mut() {
            let deadline = throttle.deadline();
            if let (Some(deadline), Some(value)) = (deadline, throttle.poll(now)) {
                due.push((deadline, key.clone(), value));
            }
        }
        due.sort_by_key(|(deadline, _, _)| *deadline);
        due.into_iter().map(|(_, key, value)| (key, value)).collect()
    }

    pub fn flush(&mut self, key: &K) -> Option<T> {
        self.throttles.get_mut(key).and_then(Throttle::flush)
    }

    /// Take every pending value regardless of its window, oldest deadline first
    pub fn flush_all(&mut self) -> Vec<(K, T)> {
        let mut pending: Vec<(Option<Instant>, K, T)> = Vec::new();
        for (key, throttle) in self.throttles.iter_mut() {
            let deadline = throttle.deadline();
            if let Some(value) = throttle.flush() {
                pending.push((deadline, key.clone(), value));
            }
        }
        pending.sort_by_key(|(deadline, _, _)| *deadline);
        pending.into_iter().map(|(_, key, value)| (key, value)).collect()
    }

    /// Forget a source entirely, dropping anything pending
    pub fn remove(&mut self, key: &K) {
        self.throttles.remove(key);
    }

    /// Earliest deadline across all keys
    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttles.values().filter_map(Throttle::deadline).min()
    }

    pub fn len(&self) -> usize {
        self.throttles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }
}
