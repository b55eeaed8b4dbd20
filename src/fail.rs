// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error taxonomy for the reactor core. Every fallible surface in this crate
//! returns `Result<_, Fail>`; the variants below are the complete set from
//! the component design's error handling section.

use custom_error::custom_error;
use std::io;

custom_error! {
    /// Errors surfaced by futures, connections, the scheduler, and the reactor.
    pub Fail

    Cancelled = "operation was cancelled",
    Io { cause: IoCause } = "I/O error: {cause}",
    Connection { cause: IoCause } = "connection error: {cause}",
    ConnectionClosed { cause: IoCause } = "connection closed: {cause}",
    ConnectionTimeout = "connection attempt timed out",
    Reactor { reason: String } = "reactor error: {reason}",
    Future { reason: String } = "future error: {reason}",
}

// `custom_error!` derives `Debug` for us but not `Clone`/`Eq`; both are
// needed so a single `Fail` can be handed to every listener of a completed
// future. Implemented by hand rather than risking an unsupported derive
// attribute inside the macro invocation.
impl Clone for Fail {
    fn clone(&self) -> Self {
        match self {
            Fail::Cancelled => Fail::Cancelled,
            Fail::Io { cause } => Fail::Io { cause: cause.clone() },
            Fail::Connection { cause } => Fail::Connection { cause: cause.clone() },
            Fail::ConnectionClosed { cause } => Fail::ConnectionClosed { cause: cause.clone() },
            Fail::ConnectionTimeout => Fail::ConnectionTimeout,
            Fail::Reactor { reason } => Fail::Reactor { reason: reason.clone() },
            Fail::Future { reason } => Fail::Future { reason: reason.clone() },
        }
    }
}

impl PartialEq for Fail {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Fail::Cancelled, Fail::Cancelled) => true,
            (Fail::Io { cause: a }, Fail::Io { cause: b }) => a == b,
            (Fail::Connection { cause: a }, Fail::Connection { cause: b }) => a == b,
            (Fail::ConnectionClosed { cause: a }, Fail::ConnectionClosed { cause: b }) => a == b,
            (Fail::ConnectionTimeout, Fail::ConnectionTimeout) => true,
            (Fail::Reactor { reason: a }, Fail::Reactor { reason: b }) => a == b,
            (Fail::Future { reason: a }, Fail::Future { reason: b }) => a == b,
            _ => false,
        }
    }
}
impl Eq for Fail {}

/// `io::Error` does not implement `Clone`/`Eq`, both of which `Fail` needs to
/// be cheaply shared between listener threads. `IoCause` captures the kind
/// and message once at the point of failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCause {
    kind: io::ErrorKind,
    message: String,
}

impl IoCause {
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }
}

impl std::fmt::Display for IoCause {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl From<io::Error> for IoCause {
    fn from(e: io::Error) -> Self {
        IoCause {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl Fail {
    /// Wraps a raw I/O error as a generic [`Fail::Io`].
    pub fn io(e: io::Error) -> Self {
        Fail::Io { cause: e.into() }
    }

    /// Wraps a raw I/O error as a connection-scoped failure (DNS failure,
    /// reset, refused-after-exhaustion).
    pub fn connection(e: io::Error) -> Self {
        Fail::Connection { cause: e.into() }
    }

    /// Wraps a raw I/O error observed after a connection had already begun
    /// handing data to its owner.
    pub fn connection_closed(e: io::Error) -> Self {
        Fail::ConnectionClosed { cause: e.into() }
    }

    /// True for errors that represent `WouldBlock`/`EAGAIN` rather than a
    /// real failure; connection code uses this to decide whether an I/O
    /// result should close the connection or simply wait for the next tick.
    pub fn would_block(e: &io::Error) -> bool {
        e.kind() == io::ErrorKind::WouldBlock
    }
}
