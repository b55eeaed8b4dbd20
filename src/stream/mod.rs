// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Multi-subscriber publish stream with transformations.
//!
//! A [`Stream<T>`] is the read side: `subscribe`/`unsubscribe`. A [`Source<T>`]
//! is the write side. Both user-publishable sources and processors/derived
//! streams ([`Stream::map`], [`Stream::select`], [`Stream::aggregate`],
//! [`Stream::take`], [`Stream::drop`]) share this split: a derived stream is
//! just a `Source` fed by a subscription on some upstream `Stream`.
//!
//! Closures aren't `Eq` in Rust, so `subscribe` returns an opaque
//! [`SubscriptionId`] handle instead of identifying subscribers by the
//! callable itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque handle returned by [`Stream::subscribe`]; pass it to
/// [`Stream::unsubscribe`] to remove that subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<Mutex<dyn FnMut(&T) + Send>>;

struct Inner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
}

/// The read side of a stream: subscribe to and unsubscribe from elements.
pub struct Stream<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stream<T> {
    pub fn new() -> Self {
        Stream {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a subscriber; returns a handle to unsubscribe it later.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: FnMut(&T) + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(Mutex::new(f))));
        id
    }

    /// Removes the subscriber identified by `id`. A no-op if already
    /// removed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|(existing, _)| *existing != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Delivers `value` to every current subscriber. A panicking subscriber
    /// is isolated — delivery continues to the rest. The subscriber list is
    /// snapshotted before delivery so a subscriber that subscribes or
    /// unsubscribes from within its own callback does not deadlock or
    /// corrupt iteration.
    fn publish(&self, value: &T) {
        let subs: Vec<(SubscriptionId, Subscriber<T>)> =
            self.inner.subscribers.lock().unwrap().clone();
        for (_, cb) in subs {
            let mut cb = cb.lock().unwrap();
            let _ = catch_unwind(AssertUnwindSafe(|| (cb)(value)));
        }
    }
}

/// The write side of a stream.
#[derive(Clone)]
pub struct Source<T> {
    stream: Stream<T>,
}

impl<T> Default for Source<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Source<T> {
    pub fn new() -> Self {
        Source {
            stream: Stream::new(),
        }
    }

    /// Returns a read handle onto this source's stream.
    pub fn stream(&self) -> Stream<T> {
        self.stream.clone()
    }

    /// Publishes `value` to every current subscriber (the `<<` operator in
    /// the source material).
    pub fn publish(&self, value: T) {
        self.stream.publish(&value);
    }
}

impl<T> Stream<T>
where
    T: Clone + Send + 'static,
{
    /// Derived stream applying `f` to every element.
    pub fn map<U, F>(&self, f: F) -> Stream<U>
    where
        F: Fn(T) -> U + Send + 'static,
        U: Clone + Send + 'static,
    {
        let source = Source::new();
        let out = source.stream();
        self.subscribe(move |v: &T| source.publish(f(v.clone())));
        out
    }

    /// Derived stream passing through only elements matching `pred`.
    pub fn select<F>(&self, pred: F) -> Stream<T>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let source = Source::new();
        let out = source.stream();
        self.subscribe(move |v: &T| {
            if pred(v) {
                source.publish(v.clone());
            }
        });
        out
    }

    /// Derived stream that threads `state` across every input element and
    /// may publish zero or more elements per input via the `Source<U>`
    /// handle `f` is given.
    pub fn aggregate<S, U, F>(&self, init: S, f: F) -> Stream<U>
    where
        S: Send + 'static,
        U: Clone + Send + 'static,
        F: Fn(&mut S, T, &Source<U>) + Send + 'static,
    {
        let source = Source::new();
        let out = source.stream();
        let state = Mutex::new(init);
        self.subscribe(move |v: &T| {
            let mut state = state.lock().unwrap();
            f(&mut state, v.clone(), &source);
        });
        out
    }

    /// Derived stream passing through the first `n` elements, then
    /// unsubscribing itself from the upstream.
    pub fn take(&self, n: usize) -> Stream<T> {
        let source = Source::new();
        let out = source.stream();
        let upstream = self.clone();
        let upstream_for_closure = self.clone();
        let count = Mutex::new(0usize);
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let id_slot_for_closure = id_slot.clone();
        let id = upstream.subscribe(move |v: &T| {
            let mut c = count.lock().unwrap();
            if *c >= n {
                return;
            }
            *c += 1;
            source.publish(v.clone());
            if *c == n {
                if let Some(id) = id_slot_for_closure.lock().unwrap().take() {
                    upstream_for_closure.unsubscribe(id);
                }
            }
        });
        *id_slot.lock().unwrap() = Some(id);
        out
    }

    /// Derived stream skipping the first `n` elements.
    #[allow(clippy::should_implement_trait)]
    pub fn drop(&self, n: usize) -> Stream<T> {
        let source = Source::new();
        let out = source.stream();
        let count = Mutex::new(0usize);
        self.subscribe(move |v: &T| {
            let mut c = count.lock().unwrap();
            if *c < n {
                *c += 1;
                return;
            }
            source.publish(v.clone());
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn publish_reaches_every_subscriber() {
        let source = Source::new();
        let stream = source.stream();
        let seen: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_a = seen.clone();
        let seen_b = seen.clone();
        stream.subscribe(move |v: &i32| seen_a.lock().unwrap().push(*v));
        stream.subscribe(move |v: &i32| seen_b.lock().unwrap().push(*v * 10));
        source.publish(5);
        assert_eq!(*seen.lock().unwrap(), vec![5, 50]);
    }

    #[test]
    fn unsubscribe_removes_by_identity() {
        let source = Source::new();
        let stream = source.stream();
        let count = Arc::new(StdMutex::new(0));
        let count2 = count.clone();
        let id = stream.subscribe(move |_: &i32| {
            *count2.lock().unwrap() += 1;
        });
        source.publish(1);
        stream.unsubscribe(id);
        source.publish(2);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let source = Source::new();
        let stream = source.stream();
        let ran = Arc::new(StdMutex::new(false));
        let ran2 = ran.clone();
        stream.subscribe(|_: &i32| panic!("boom"));
        stream.subscribe(move |_: &i32| *ran2.lock().unwrap() = true);
        source.publish(1);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn map_transforms_elements() {
        let source = Source::new();
        let doubled = source.stream().map(|v: i32| v * 2);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        doubled.subscribe(move |v: &i32| seen2.lock().unwrap().push(*v));
        source.publish(3);
        source.publish(4);
        assert_eq!(*seen.lock().unwrap(), vec![6, 8]);
    }

    #[test]
    fn select_filters_elements() {
        let source = Source::new();
        let evens = source.stream().select(|v: &i32| v % 2 == 0);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        evens.subscribe(move |v: &i32| seen2.lock().unwrap().push(*v));
        for v in 1..=4 {
            source.publish(v);
        }
        assert_eq!(*seen.lock().unwrap(), vec![2, 4]);
    }

    #[test]
    fn take_unsubscribes_after_n() {
        let source = Source::new();
        let first_two = source.stream().take(2);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        first_two.subscribe(move |v: &i32| seen2.lock().unwrap().push(*v));
        for v in 1..=5 {
            source.publish(v);
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(source.stream().subscriber_count(), 0);
    }

    #[test]
    fn drop_skips_first_n() {
        let source = Source::new();
        let skipped = source.stream().drop(2);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        skipped.subscribe(move |v: &i32| seen2.lock().unwrap().push(*v));
        for v in 1..=4 {
            source.publish(v);
        }
        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
    }

    #[test]
    fn aggregate_threads_state_and_can_publish_many() {
        let source = Source::new();
        // splits each input into two outputs: the value and its running sum
        let running = source.stream().aggregate(0i32, |state, v: i32, out| {
            *state += v;
            out.publish(v);
            out.publish(*state);
        });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        running.subscribe(move |v: &i32| seen2.lock().unwrap().push(*v));
        source.publish(1);
        source.publish(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 1, 2, 3]);
    }
}
