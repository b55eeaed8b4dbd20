// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Free-standing future factories: `resolved`, `failed`, `all`, `first`,
//! `traverse`, `reduce`.

use super::{Future, Promise};
use crate::fail::Fail;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// An immediately-resolved future.
pub fn resolved<T>(value: T) -> Future<T>
where
    T: Clone + Send + 'static,
{
    let (promise, future) = Promise::new();
    let _ = promise.fulfill(value);
    future
}

/// An immediately-failed future.
pub fn failed<T>(error: Fail) -> Future<T>
where
    T: Clone + Send + 'static,
{
    let (promise, future) = Promise::new();
    let _ = promise.fail(error);
    future
}

/// Resolves to a list of values in input order once every future resolves;
/// fails fast with the first failure observed. Empty input resolves to the
/// empty list.
pub fn all<T>(futures: Vec<Future<T>>) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
{
    if futures.is_empty() {
        return resolved(Vec::new());
    }
    let n = futures.len();
    let (promise, future) = Promise::new();
    let promise = Arc::new(Mutex::new(Some(promise)));
    let results: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; n]));
    let remaining = Arc::new(Mutex::new(n));

    for (i, fut) in futures.into_iter().enumerate() {
        let promise = promise.clone();
        let results = results.clone();
        let remaining = remaining.clone();
        fut.on_complete(move |outcome, _| match outcome {
            Ok(v) => {
                let done = {
                    let mut r = results.lock().unwrap();
                    r[i] = Some(v.clone());
                    let mut rem = remaining.lock().unwrap();
                    *rem -= 1;
                    *rem == 0
                };
                if done {
                    if let Some(p) = promise.lock().unwrap().take() {
                        let vals = results
                            .lock()
                            .unwrap()
                            .iter()
                            .cloned()
                            .map(|v| v.expect("all slots filled when remaining hits zero"))
                            .collect();
                        let _ = p.fulfill(vals);
                    }
                }
            }
            Err(e) => {
                if let Some(p) = promise.lock().unwrap().take() {
                    let _ = p.fail(e.clone());
                }
            }
        });
    }
    future
}

/// Resolves to the first value observed; fails only once every future has
/// failed, with the last failure's error. Empty input resolves to `None`,
/// since Rust has no universal null for an arbitrary `T`.
pub fn first<T>(futures: Vec<Future<T>>) -> Future<Option<T>>
where
    T: Clone + Send + 'static,
{
    if futures.is_empty() {
        return resolved(None);
    }
    let n = futures.len();
    let (promise, future) = Promise::new();
    let promise = Arc::new(Mutex::new(Some(promise)));
    let remaining = Arc::new(Mutex::new(n));
    let last_error: Arc<Mutex<Option<Fail>>> = Arc::new(Mutex::new(None));

    for fut in futures {
        let promise = promise.clone();
        let remaining = remaining.clone();
        let last_error = last_error.clone();
        fut.on_complete(move |outcome, _| match outcome {
            Ok(v) => {
                if let Some(p) = promise.lock().unwrap().take() {
                    let _ = p.fulfill(Some(v.clone()));
                }
            }
            Err(e) => {
                *last_error.lock().unwrap() = Some(e.clone());
                let done = {
                    let mut rem = remaining.lock().unwrap();
                    *rem -= 1;
                    *rem == 0
                };
                if done {
                    if let Some(p) = promise.lock().unwrap().take() {
                        let err = last_error
                            .lock()
                            .unwrap()
                            .clone()
                            .expect("set by the failure that zeroed `remaining`");
                        let _ = p.fail(err);
                    }
                }
            }
        });
    }
    future
}

/// Equivalent to `all(xs.map(fn))`, with panics from `fn` captured into a
/// failed future rather than propagating.
pub fn traverse<X, T, F>(xs: Vec<X>, f: F) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
    F: Fn(X) -> Future<T>,
{
    let futures = xs
        .into_iter()
        .map(|x| match catch_unwind(AssertUnwindSafe(|| f(x))) {
            Ok(fut) => fut,
            Err(_) => failed(Fail::Future {
                reason: "panic in traverse closure".to_string(),
            }),
        })
        .collect();
    all(futures)
}

/// Folds the resolved values of `futures` with `op`. When `ordered`, `op` is
/// applied in input order once every future has resolved; otherwise it is
/// applied in completion order as each future resolves (`op` must then be
/// associative and commutative; it is never called concurrently, so no
/// locking is needed inside it). If `init` is `None`, the first value — in
/// input order if `ordered`, in completion order otherwise — seeds the fold
/// and `op` is first called against the second value. Empty input with a
/// seed resolves to that seed; empty input with no seed fails, since there
/// is then no value of any kind to resolve to.
pub fn reduce<T, F>(futures: Vec<Future<T>>, init: Option<T>, ordered: bool, op: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    if futures.is_empty() {
        return match init {
            Some(seed) => resolved(seed),
            None => failed(Fail::Future {
                reason: "reduce of empty input with no seed".to_string(),
            }),
        };
    }

    if ordered {
        return all(futures).flat_map(move |values| {
            let mut iter = values.into_iter();
            let seed = match init {
                Some(seed) => seed,
                None => iter.next().expect("non-empty futures checked above"),
            };
            let acc = iter.fold(seed, &op);
            resolved(acc)
        });
    }

    let n = futures.len();
    let (promise, future) = Promise::new();
    let promise = Arc::new(Mutex::new(Some(promise)));
    let acc: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(init));
    let remaining = Arc::new(Mutex::new(n));
    let op = Arc::new(op);

    for fut in futures {
        let promise = promise.clone();
        let acc = acc.clone();
        let remaining = remaining.clone();
        let op = op.clone();
        fut.on_complete(move |outcome, _| match outcome {
            Ok(v) => {
                let done = {
                    let mut a = acc.lock().unwrap();
                    *a = Some(match a.take() {
                        Some(prev) => op(prev, v.clone()),
                        None => v.clone(),
                    });
                    let mut rem = remaining.lock().unwrap();
                    *rem -= 1;
                    *rem == 0
                };
                if done {
                    if let Some(p) = promise.lock().unwrap().take() {
                        let result = acc
                            .lock()
                            .unwrap()
                            .clone()
                            .expect("at least one value observed when remaining hits zero");
                        let _ = p.fulfill(result);
                    }
                }
            }
            Err(e) => {
                if let Some(p) = promise.lock().unwrap().take() {
                    let _ = p.fail(e.clone());
                }
            }
        });
    }
    future
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_resolves_in_input_order() {
        let f = all(vec![resolved(1), resolved(2), resolved(3)]);
        assert_eq!(f.value(), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn all_empty_resolves_to_empty_list() {
        let f: Future<Vec<i32>> = all(Vec::new());
        assert_eq!(f.value(), Ok(Vec::new()));
    }

    #[test]
    fn all_fails_fast_on_first_failure() {
        let f = all(vec![failed(Fail::Cancelled), resolved(2)]);
        assert_eq!(f.value(), Err(Fail::Cancelled));
    }

    #[test]
    fn first_resolves_to_first_success() {
        let f = first(vec![resolved(1), resolved(2)]);
        assert_eq!(f.value().unwrap(), Some(1));
    }

    #[test]
    fn first_fails_only_when_all_fail_with_last_error() {
        let (pa, fa) = Promise::<i32>::new();
        let (pb, fb) = Promise::<i32>::new();
        let first_fut = first(vec![fa, fb]);
        pa.fail(Fail::Cancelled).unwrap();
        pb.fail(Fail::ConnectionTimeout).unwrap();
        assert_eq!(first_fut.value(), Err(Fail::ConnectionTimeout));
    }

    #[test]
    fn first_empty_resolves_to_none() {
        let f: Future<Option<i32>> = first(Vec::new());
        assert_eq!(f.value(), Ok(None));
    }

    #[test]
    fn traverse_matches_all_of_mapped() {
        let f = traverse(vec![1, 2, 3], |x| resolved(x * 2));
        assert_eq!(f.value(), Ok(vec![2, 4, 6]));
    }

    #[test]
    fn reduce_ordered_sums_in_order() {
        let f = reduce(
            vec![resolved(1), resolved(2), resolved(3)],
            Some(0),
            true,
            |a, b| a + b,
        );
        assert_eq!(f.value(), Ok(6));
    }

    #[test]
    fn reduce_unordered_builds_list_in_completion_order() {
        let (pa, fa) = Promise::<char>::new();
        let (pb, fb) = Promise::<char>::new();
        let (pc, fc) = Promise::<char>::new();
        let f = reduce(vec![fa, fb, fc], Some(Vec::new()), false, |mut acc, v| {
            acc.push(v);
            acc
        });
        pb.fulfill('B').unwrap();
        pa.fulfill('A').unwrap();
        pc.fulfill('C').unwrap();
        assert_eq!(f.value(), Ok(vec!['B', 'A', 'C']));
    }

    #[test]
    fn reduce_without_seed_uses_first_value() {
        let f = reduce(
            vec![resolved(1), resolved(2), resolved(3)],
            None,
            true,
            |a, b| a + b,
        );
        assert_eq!(f.value(), Ok(6));
    }

    #[test]
    fn reduce_empty_without_seed_fails() {
        let f: Future<i32> = reduce(Vec::new(), None, true, |a, b| a + b);
        assert!(f.value().is_err());
    }
}
