// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! `tidepool` is a small reactive I/O framework: a thread-safe future/promise
//! pair with combinators, a single-threaded reactor multiplexing non-blocking
//! sockets and timers, and a protocol-agnostic connection state machine with
//! optional TLS layering.
//!
//! The pieces compose roughly bottom-up:
//!
//! - [`collections`] — the double-buffered [`collections::ByteBuffer`] and
//!   the [`collections::IndexedHeap`] the scheduler is built on.
//! - [`future`] — [`future::Future`]/[`future::Promise`] and their combinators.
//! - [`stream`] — multi-subscriber [`stream::Stream`]/[`stream::Source`].
//! - [`sync`] — the self-pipe [`sync::Unblocker`] used to interrupt `poll`.
//! - [`clock`] — an injectable clock so timeouts and timers are testable.
//! - [`scheduler`] — the timer heap the reactor drains every tick.
//! - [`connection`] / [`acceptor`] — the per-socket state machines.
//! - [`reactor`] — the background thread tying all of the above together.
//!
//! Most applications only need [`reactor::Reactor`], [`options`] and
//! [`fail::Fail`]; the rest is exported for composing smaller pieces (e.g.
//! using [`future::Future`] independently of any I/O).

pub mod acceptor;
pub mod clock;
pub mod collections;
pub mod connection;
pub mod fail;
pub mod future;
pub mod options;
pub mod reactor;
pub mod scheduler;
pub mod stream;
pub mod sync;

pub use acceptor::Acceptor;
pub use connection::{Connection, ConnectionState};
pub use fail::Fail;
pub use future::{Future, Promise};
pub use options::{BindOptions, ConnectOptions, ReactorOptions, Ssl};
pub use reactor::Reactor;
pub use stream::{Source, Stream};
