// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Throughput of the future combinator chain under concurrent completion,
//! since C3 is the component the budget calls out as dominating line count.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;

use tidepool::future::{all, reduce, resolved};
use tidepool::{Future, Promise};

fn map_chain(c: &mut Criterion) {
    c.bench_function("map_chain_10_deep", |b| {
        b.iter(|| {
            let mut f = resolved(0i64);
            for i in 0..10 {
                f = f.map(move |v| v + i);
            }
            black_box(f.value().unwrap());
        })
    });
}

fn all_fan_in(c: &mut Criterion) {
    c.bench_function("all_of_100_resolved", |b| {
        b.iter(|| {
            let futures: Vec<Future<i64>> = (0..100).map(resolved).collect();
            black_box(all(futures).value().unwrap());
        })
    });
}

fn reduce_unordered_cross_thread(c: &mut Criterion) {
    c.bench_function("reduce_unordered_8_producer_threads", |b| {
        b.iter(|| {
            let promises: Vec<(Promise<i64>, Future<i64>)> = (0..8).map(|_| Promise::new()).collect();
            let futures: Vec<Future<i64>> = promises.iter().map(|(_, f)| f.clone()).collect();
            let result = reduce(futures, Some(0), false, |a, b| a + b);
            let handles: Vec<_> = promises
                .into_iter()
                .enumerate()
                .map(|(i, (p, _))| thread::spawn(move || p.fulfill(i as i64).unwrap()))
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            black_box(result.value().unwrap());
        })
    });
}

fn listener_fan_out(c: &mut Criterion) {
    c.bench_function("on_complete_1000_listeners", |b| {
        b.iter(|| {
            let (promise, future) = Promise::<i64>::new();
            let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            for _ in 0..1000 {
                let count = count.clone();
                future.on_complete(move |_, _| {
                    count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                });
            }
            promise.fulfill(1).unwrap();
            black_box(count.load(std::sync::atomic::Ordering::Relaxed));
        })
    });
}

criterion_group!(benches, map_chain, all_fan_in, reduce_unordered_cross_thread, listener_fan_out);
criterion_main!(benches);
