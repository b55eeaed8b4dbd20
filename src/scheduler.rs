// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Time-ordered timer queue driven by the reactor tick.

use crate::collections::IndexedHeap;
use crate::fail::Fail;
use crate::future::{Future, Promise};

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Instant;

/// `(deadline, insertion tiebreak)` — timers with equal deadlines expire in
/// insertion order, matching the heap's stable tiebreak requirement.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Order {
    deadline: Instant,
    tiebreak: u64,
}

impl PartialOrd for Order {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Order {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.tiebreak.cmp(&other.tiebreak))
    }
}

struct ScheduledTimer {
    order: Order,
    promise: Promise<Instant>,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}
impl Eq for ScheduledTimer {}
impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.cmp(&other.order)
    }
}

/// Min-heap of pending timers. The heap is keyed by [`Future::identity`],
/// which doubles as the map from timer future to timer record, so there's
/// no separate structure to keep in sync.
pub struct Scheduler {
    heap: Mutex<IndexedHeap<usize, ScheduledTimer>>,
    tiebreak: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            heap: Mutex::new(IndexedHeap::new()),
            tiebreak: AtomicU64::new(0),
        }
    }

    /// Schedules a timer to fire at `now + duration` and returns its future.
    pub fn schedule_timer(&self, now: Instant, duration: std::time::Duration) -> Future<Instant> {
        let (promise, future) = Promise::new();
        let order = Order {
            deadline: now + duration,
            tiebreak: self.tiebreak.fetch_add(1, AtomicOrdering::Relaxed),
        };
        let id = future.identity();
        self.heap
            .lock()
            .unwrap()
            .push(id, ScheduledTimer { order, promise });
        future
    }

    /// Cancels a previously scheduled timer, failing its promise with a
    /// cancellation error. A no-op if the timer has already expired (or was
    /// never scheduled through this scheduler).
    pub fn cancel_timer(&self, future: &Future<Instant>) {
        if let Some(timer) = self.heap.lock().unwrap().delete(&future.identity()) {
            let _ = timer.promise.fail(Fail::Cancelled);
        }
    }

    /// Pops and fulfills every timer whose deadline has passed.
    pub fn tick(&self, now: Instant) {
        loop {
            let expired = {
                let mut heap = self.heap.lock().unwrap();
                match heap.peek() {
                    Some(top) if top.order.deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            match expired {
                Some((_, timer)) => {
                    let deadline = timer.order.deadline;
                    let _ = timer.promise.fulfill(deadline);
                }
                None => break,
            }
        }
    }

    /// Drains every remaining timer, failing each with a cancellation
    /// error. Called at reactor shutdown.
    pub fn cancel_timers(&self) {
        let mut heap = self.heap.lock().unwrap();
        while let Some((_, timer)) = heap.pop() {
            let _ = timer.promise.fail(Fail::Cancelled);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
