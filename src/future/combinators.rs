// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Combinators: functions that derive a new future from existing one(s)
//! without mutating the receiver.

use super::{Future, Outcome, Promise};
use crate::fail::Fail;
use std::panic::{catch_unwind, AssertUnwindSafe};

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Resolves to `f(v)` when this future resolves to `v`. If `f` panics,
    /// the returned future fails instead of propagating the panic. Failure
    /// propagates unchanged.
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
        U: Clone + Send + 'static,
    {
        let (promise, future) = Promise::new();
        self.on_complete(move |outcome, _| match outcome {
            Ok(v) => match catch_unwind(AssertUnwindSafe(|| f(v.clone()))) {
                Ok(u) => {
                    let _ = promise.fulfill(u);
                }
                Err(_) => {
                    let _ = promise.fail(panicked_in("map"));
                }
            },
            Err(e) => {
                let _ = promise.fail(e.clone());
            }
        });
        future
    }

    /// `f` returns a future; the returned future mirrors its outcome.
    pub fn flat_map<U, F>(&self, f: F) -> Future<U>
    where
        F: FnOnce(T) -> Future<U> + Send + 'static,
        U: Clone + Send + 'static,
    {
        let (promise, future) = Promise::new();
        self.on_complete(move |outcome, _| match outcome {
            Ok(v) => match catch_unwind(AssertUnwindSafe(|| f(v.clone()))) {
                Ok(inner) => {
                    inner.on_complete(move |inner_outcome, _| match inner_outcome {
                        Ok(u) => {
                            let _ = promise.fulfill(u.clone());
                        }
                        Err(e) => {
                            let _ = promise.fail(e.clone());
                        }
                    });
                }
                Err(_) => {
                    let _ = promise.fail(panicked_in("flat_map"));
                }
            },
            Err(e) => {
                let _ = promise.fail(e.clone());
            }
        });
        future
    }

    /// Chains a future-producing continuation. The source's "future-like by
    /// duck typing" dispatch (detecting `on_complete`'s presence at runtime)
    /// has no static-typing equivalent, so `then` is narrowed to always take
    /// a continuation returning `Future<U>` — exactly [`Future::flat_map`].
    /// Callers who want `map`'s plain-value shape call `.map(f)` directly,
    /// or wrap a plain value with [`super::resolved`].
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        F: FnOnce(T) -> Future<U> + Send + 'static,
        U: Clone + Send + 'static,
    {
        self.flat_map(f)
    }

    /// On failure, resolves to `f(error)`. Mirrors the value on success.
    pub fn recover<F>(&self, f: F) -> Future<T>
    where
        F: FnOnce(Fail) -> T + Send + 'static,
    {
        let (promise, future) = Promise::new();
        self.on_complete(move |outcome, _| match outcome {
            Ok(v) => {
                let _ = promise.fulfill(v.clone());
            }
            Err(e) => match catch_unwind(AssertUnwindSafe(|| f(e.clone()))) {
                Ok(v) => {
                    let _ = promise.fulfill(v);
                }
                Err(_) => {
                    let _ = promise.fail(panicked_in("recover"));
                }
            },
        });
        future
    }

    /// On failure, `f` returns a future whose outcome is mirrored. Mirrors
    /// the value on success.
    pub fn fallback<F>(&self, f: F) -> Future<T>
    where
        F: FnOnce(Fail) -> Future<T> + Send + 'static,
    {
        let (promise, future) = Promise::new();
        self.on_complete(move |outcome, _| match outcome {
            Ok(v) => {
                let _ = promise.fulfill(v.clone());
            }
            Err(e) => match catch_unwind(AssertUnwindSafe(|| f(e.clone()))) {
                Ok(inner) => {
                    inner.on_complete(move |inner_outcome, _| match inner_outcome {
                        Ok(v) => {
                            let _ = promise.fulfill(v.clone());
                        }
                        Err(e2) => {
                            let _ = promise.fail(e2.clone());
                        }
                    });
                }
                Err(_) => {
                    let _ = promise.fail(panicked_in("fallback"));
                }
            },
        });
        future
    }
}

fn panicked_in(where_: &str) -> Fail {
    Fail::Future {
        reason: format!("panic in {} closure", where_),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{failed, resolved};
    use crate::fail::Fail;

    #[test]
    fn map_transforms_value() {
        assert_eq!(resolved(2).map(|v: i32| v * 10).value(), Ok(20));
    }

    #[test]
    fn map_propagates_failure_unchanged() {
        let f = failed::<i32>(Fail::Cancelled).map(|v| v * 10);
        assert_eq!(f.value(), Err(Fail::Cancelled));
    }

    #[test]
    fn map_panic_becomes_failure() {
        let f = resolved(1).map(|_: i32| -> i32 { panic!("nope") });
        assert!(f.value().is_err());
    }

    #[test]
    fn flat_map_mirrors_inner_future() {
        let f = resolved(2).flat_map(|v: i32| resolved(v * 10));
        assert_eq!(f.value(), Ok(20));
    }

    #[test]
    fn flat_map_value_law() {
        let f = |v: i32| resolved(v + 1);
        assert_eq!(resolved(1).flat_map(f).value(), f(1).value());
    }

    #[test]
    fn recover_replaces_failure_with_value() {
        let f = failed::<i32>(Fail::Cancelled).recover(|_| 5);
        assert_eq!(f.value(), Ok(5));
    }

    #[test]
    fn recover_law() {
        assert_eq!(failed::<i32>(Fail::Cancelled).recover(|_| 9).value(), Ok(9));
    }

    #[test]
    fn fallback_mirrors_inner_future_on_failure() {
        let f = failed::<i32>(Fail::Cancelled).fallback(|_| resolved(3));
        assert_eq!(f.value(), Ok(3));
    }

    #[test]
    fn then_behaves_like_flat_map() {
        let f = resolved(2).then(|v: i32| resolved(v + 1));
        assert_eq!(f.value(), Ok(3));
    }
}
