// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Thread-safe asynchronous value with combinators.
//!
//! A [`Future<T>`] has exactly one terminal [`Outcome`]. It may be completed
//! from any thread (via its [`Promise<T>`]) and observed from any thread.
//! Internally a single mutex guards `(state, listeners)`; on completion the
//! listener list is drained out from under the lock before any listener
//! runs, so a listener that re-enters this future's machinery (e.g. by
//! completing another future that in turn notifies a listener registered
//! back on this one) cannot deadlock.

mod combinators;
mod factories;

pub use factories::{all, failed, first, reduce, resolved, traverse};

use crate::fail::Fail;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

/// The terminal result of a future: a value or a [`Fail`].
pub type Outcome<T> = Result<T, Fail>;

/// A completion listener: `(outcome, future_handle)`. A single listener
/// contract in place of arity-based dispatch; `on_value`/`on_failure` are
/// typed adapters over it.
type Listener<T> = Box<dyn FnOnce(&Outcome<T>, &Future<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Outcome<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

/// A read handle onto an asynchronous value. Cheap to clone; every clone
/// observes the same completion.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Future<T> {
    /// A stable identity for this future, shared by every clone of the same
    /// handle. Used by the scheduler as the key from "timer future" to
    /// timer record, since `Future<T>` has no other notion of
    /// identity or hash/equality independent of `T`.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// The write capability for exactly one [`Future<T>`]. Completing a promise
/// twice raises [`Fail::Future`]; it does not silently succeed.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Promise<T> {
    /// Creates a fresh, pending promise and its associated future.
    pub fn new() -> (Promise<T>, Future<T>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Pending(Vec::new())),
            condvar: Condvar::new(),
        });
        (
            Promise {
                inner: inner.clone(),
            },
            Future { inner },
        )
    }

    /// Returns a future handle onto this promise's value.
    pub fn future(&self) -> Future<T> {
        Future {
            inner: self.inner.clone(),
        }
    }

    /// Completes the future with a value. Fails with [`Fail::Future`] if
    /// already completed.
    pub fn fulfill(&self, value: T) -> Result<(), Fail>
    where
        T: Clone + Send + 'static,
    {
        complete(&self.inner, Ok(value))
    }

    /// Completes the future with an error. Fails with [`Fail::Future`] if
    /// already completed.
    pub fn fail(&self, error: Fail) -> Result<(), Fail>
    where
        T: Clone + Send + 'static,
    {
        complete(&self.inner, Err(error))
    }
}

fn complete<T>(inner: &Arc<Inner<T>>, outcome: Outcome<T>) -> Result<(), Fail>
where
    T: Clone + Send + 'static,
{
    let listeners = {
        let mut guard = inner.state.lock().unwrap();
        if let State::Done(_) = &*guard {
            return Err(Fail::Future {
                reason: "promise completed twice".to_string(),
            });
        }
        match std::mem::replace(&mut *guard, State::Done(outcome.clone())) {
            State::Pending(listeners) => listeners,
            State::Done(_) => unreachable!("checked above"),
        }
    };
    inner.condvar.notify_all();
    let handle = Future {
        inner: inner.clone(),
    };
    for listener in listeners {
        // Listener panics are swallowed so one bad observer can't stop
        // delivery to the rest, or poison a completion happening on an
        // arbitrary caller thread.
        let _ = catch_unwind(AssertUnwindSafe(|| listener(&outcome, &handle)));
    }
    Ok(())
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Registers a listener invoked exactly once with this future's outcome.
    /// If the future is already completed, the listener runs synchronously
    /// on the calling thread before this method returns.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>, &Future<T>) + Send + 'static,
    {
        let mut guard = self.inner.state.lock().unwrap();
        match &mut *guard {
            State::Pending(listeners) => listeners.push(Box::new(listener)),
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(guard);
                let _ = catch_unwind(AssertUnwindSafe(|| listener(&outcome, self)));
            }
        }
    }

    /// Filtered form of [`Future::on_complete`]: runs only on success.
    pub fn on_value<F>(&self, listener: F)
    where
        F: FnOnce(&T, &Future<T>) + Send + 'static,
    {
        self.on_complete(move |outcome, fut| {
            if let Ok(v) = outcome {
                listener(v, fut);
            }
        });
    }

    /// Filtered form of [`Future::on_complete`]: runs only on failure.
    pub fn on_failure<F>(&self, listener: F)
    where
        F: FnOnce(&Fail, &Future<T>) + Send + 'static,
    {
        self.on_complete(move |outcome, fut| {
            if let Err(e) = outcome {
                listener(e, fut);
            }
        });
    }

    /// Blocks the calling thread until completion, then returns the value or
    /// re-raises the error. Only this call may block; every other operation
    /// in this crate is non-blocking.
    pub fn value(&self) -> Outcome<T> {
        let guard = self.inner.state.lock().unwrap();
        let guard = self
            .inner
            .condvar
            .wait_while(guard, |s| matches!(s, State::Pending(_)))
            .unwrap();
        match &*guard {
            State::Done(outcome) => outcome.clone(),
            State::Pending(_) => unreachable!("wait_while guarantees Done"),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(Ok(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(Err(_)))
    }
}
