//! One-shot timers and the clock that drives them

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time for the resolver
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Cloning yields a handle to the same clock, so a test can keep one handle
/// and give the other to a resolver.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::from_secs(0))),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A heap of one-shot timers carrying a payload
///
/// Cancelled timers stay in the heap until they reach the top, the payload
/// map is the source of truth for what is still armed.
pub struct TimerHeap<T> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    armed: HashMap<TimerId, T>,
    next_id: u64,
}

impl<T> TimerHeap<T> {
    pub fn new() -> TimerHeap<T> {
        TimerHeap {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.heap.push(Reverse((deadline, id)));
        self.armed.insert(id, payload);

        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.armed.remove(&id)
    }

    /// Remove and return every armed timer whose deadline is at or before
    /// `now`, earliest first.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }

            self.heap.pop();
            if let Some(payload) = self.armed.remove(&id) {
                expired.push(payload);
            }
        }

        expired
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.armed.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }

        None
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.armed.clear();
    }
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        TimerHeap::new()
    }
}
