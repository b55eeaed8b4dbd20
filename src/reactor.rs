// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded I/O multiplexer.
//!
//! A [`Reactor`] owns one background thread running a `mio::Poll` loop.
//! Every other thread interacts with it only through [`Reactor::connect`],
//! [`Reactor::bind`], [`Reactor::schedule_timer`] and [`Reactor::cancel_timer`],
//! which register state behind a mutex and wake the loop via the
//! [`crate::sync::Unblocker`] self-pipe; the loop itself is the only code
//! that ever touches a socket's file descriptor.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::{Events, Poll, Registry, Token};
use slab::Slab;

use crate::acceptor::Acceptor;
use crate::clock::{Clock, SystemClock};
use crate::connection::Connection;
use crate::fail::Fail;
use crate::future::Future;
use crate::options::{BindOptions, ConnectOptions, ReactorOptions, Ssl};
use crate::scheduler::Scheduler;
use crate::stream::{Source, Stream};
use crate::sync::Unblocker;

const UNBLOCKER_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

/// One entry in the reactor's socket table: a `Slab` keyed by an integer
/// handle (`mio::Token` instead of a raw file descriptor) over the two
/// kinds of socket the reactor itself drives.
enum Socket {
    Connection(Arc<Connection>),
    Acceptor(Arc<Acceptor>),
}

struct Sockets {
    table: Slab<Socket>,
}

impl Sockets {
    fn new() -> Self {
        Sockets { table: Slab::new() }
    }

    fn insert(&mut self, socket: Socket) -> Token {
        Token(self.table.insert(socket) + FIRST_DYNAMIC_TOKEN)
    }

    fn get(&self, token: Token) -> Option<&Socket> {
        self.table.get(token.0.checked_sub(FIRST_DYNAMIC_TOKEN)?)
    }

    fn remove(&mut self, token: Token) -> Option<Socket> {
        let key = token.0.checked_sub(FIRST_DYNAMIC_TOKEN)?;
        if self.table.contains(key) {
            Some(self.table.remove(key))
        } else {
            None
        }
    }

    fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.table.iter().filter_map(|(_, s)| match s {
            Socket::Connection(c) => Some(c),
            Socket::Acceptor(_) => None,
        })
    }
}

/// The reactor's I/O loop. Construct with [`Reactor::new`], then
/// [`Reactor::start`] to spawn its background thread.
pub struct Reactor {
    registry: Registry,
    poll: Mutex<Option<Poll>>,
    unblocker: Arc<Unblocker>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    state: Mutex<Sockets>,
    tick_resolution: Duration,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    errors: Source<Fail>,
}

impl Reactor {
    pub fn new(options: ReactorOptions) -> Result<Arc<Reactor>, Fail> {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Same as [`Reactor::new`] but with an injectable clock, for tests that
    /// need to control connect-timeout and timer expiry deterministically.
    pub fn with_clock(options: ReactorOptions, clock: Arc<dyn Clock>) -> Result<Arc<Reactor>, Fail> {
        let poll = Poll::new().map_err(Fail::io)?;
        let registry = poll.registry().try_clone().map_err(Fail::io)?;
        let unblocker = Arc::new(Unblocker::new().map_err(Fail::io)?);
        unblocker.register(&registry, UNBLOCKER_TOKEN).map_err(Fail::io)?;
        Ok(Arc::new(Reactor {
            registry,
            poll: Mutex::new(Some(poll)),
            unblocker,
            scheduler: Arc::new(Scheduler::new()),
            clock,
            state: Mutex::new(Sockets::new()),
            tick_resolution: options.tick_resolution,
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            errors: Source::new(),
        }))
    }

    /// A stream of errors the I/O loop could not attribute to any particular
    /// connection or acceptor (e.g. a failed `poll` call).
    pub fn errors(&self) -> Stream<Fail> {
        self.errors.stream()
    }

    /// Spawns the background thread running the I/O loop. A no-op if
    /// already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let poll = match self.poll.lock().unwrap().take() {
            Some(poll) => poll,
            None => return, // already taken by a previous start()
        };
        let reactor = self.clone();
        let handle = std::thread::spawn(move || reactor.run(poll));
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Signals the loop to stop and waits for its thread to exit. Every
    /// pending timer is cancelled and every open connection is closed with
    /// [`Fail::Reactor`] as part of shutdown.
    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.unblocker.unblock();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Begins a non-blocking outbound connection. DNS resolution happens on
    /// the calling thread (see `connection::Connection::connect_outbound`);
    /// everything after that runs on the I/O thread. Returns a future that
    /// resolves once the connection (and, if requested, its TLS handshake)
    /// completes.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16, options: ConnectOptions) -> Result<Future<Arc<Connection>>, Fail> {
        let connector = match options.ssl {
            Ssl::Disabled => None,
            Ssl::Connector(c) => Some(c),
            Ssl::Default => Some(Arc::new(
                native_tls::TlsConnector::new().map_err(|e| Fail::connection(io::Error::new(io::ErrorKind::Other, e.to_string())))?,
            )),
            Ssl::Acceptor(_) => {
                return Err(Fail::Reactor {
                    reason: "connect cannot use a TlsAcceptor; pass a TlsConnector".to_string(),
                })
            }
        };
        let conn = Connection::connect_outbound(host, port, self.now(), options.timeout, connector)?;
        let established = conn.established();
        self.register_connection(conn);
        self.unblocker.unblock();
        Ok(established)
    }

    /// Binds a listening socket and returns the [`Acceptor`] immediately;
    /// accepted connections arrive on `Acceptor::accepted()`.
    pub fn bind(self: &Arc<Self>, host: &str, port: u16, options: BindOptions) -> Result<Arc<Acceptor>, Fail> {
        let backlog = options.backlog;
        let acceptor = match options.ssl {
            Ssl::Disabled | Ssl::Default => Acceptor::bind(host, port, backlog, None)?,
            Ssl::Connector(_) => {
                return Err(Fail::Reactor {
                    reason: "bind cannot use a TlsConnector; pass a TlsAcceptor".to_string(),
                })
            }
            Ssl::Acceptor(a) => Acceptor::bind(host, port, backlog, Some(a))?,
        };
        let mut state = self.state.lock().unwrap();
        let token = state.insert(Socket::Acceptor(acceptor.clone()));
        if let Err(e) = acceptor.register(&self.registry, token) {
            state.remove(token);
            drop(state);
            return Err(Fail::io(e));
        }
        drop(state);
        self.unblocker.unblock();
        Ok(acceptor)
    }

    pub fn schedule_timer(&self, duration: Duration) -> Future<Instant> {
        self.scheduler.schedule_timer(self.now(), duration)
    }

    pub fn cancel_timer(&self, timer: &Future<Instant>) {
        self.scheduler.cancel_timer(timer)
    }

    fn register_connection(&self, conn: Arc<Connection>) {
        let mut state = self.state.lock().unwrap();
        let token = state.insert(Socket::Connection(conn.clone()));
        if let Err(e) = conn.register(&self.registry, token) {
            state.remove(token);
            drop(state);
            conn.close(Some(Fail::io(e)));
        }
    }

    fn run(self: Arc<Self>, mut poll: Poll) {
        let mut events = Events::with_capacity(1024);
        while self.running.load(Ordering::SeqCst) {
            let timeout = self.next_timeout();
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("reactor poll failed: {}", e);
                self.errors.publish(Fail::io(e));
                continue;
            }
            for event in events.iter() {
                if event.token() == UNBLOCKER_TOKEN {
                    self.unblocker.drain();
                    continue;
                }
                self.dispatch(event.token(), event.is_readable(), event.is_writable());
            }
            self.sweep();
            self.scheduler.tick(self.now());
            self.prune_closed();
        }
        self.shutdown(poll);
    }

    fn next_timeout(&self) -> Duration {
        self.tick_resolution
    }

    fn dispatch(&self, token: Token, readable: bool, writable: bool) {
        let state = self.state.lock().unwrap();
        let socket = match state.get(token) {
            Some(Socket::Acceptor(a)) => Some(Socket::Acceptor(a.clone())),
            Some(Socket::Connection(c)) => Some(Socket::Connection(c.clone())),
            None => None,
        };
        drop(state);
        match socket {
            Some(Socket::Acceptor(acceptor)) => {
                if readable {
                    for conn in acceptor.accept_ready() {
                        self.register_connection(conn);
                    }
                }
            }
            Some(Socket::Connection(conn)) => {
                if conn.is_connecting() {
                    conn.connect(self.now());
                }
                if readable {
                    conn.read();
                }
                if writable {
                    conn.flush();
                }
            }
            None => debug!("event for unknown token {:?}", token),
        }
    }

    /// Every tick, in addition to event-driven dispatch: advance every
    /// connecting socket (so connect timeouts fire even absent a new
    /// readiness event) and flush every connection with pending writes (mio
    /// is edge-triggered, so a write queued onto an already-writable idle
    /// socket would otherwise never get a follow-up notification).
    fn sweep(&self) {
        let now = self.now();
        let (connecting, writable): (Vec<_>, Vec<_>) = {
            let state = self.state.lock().unwrap();
            let connecting = state.connections().filter(|c| c.is_connecting()).cloned().collect();
            let writable = state.connections().filter(|c| c.is_writable()).cloned().collect();
            (connecting, writable)
        };
        for conn in connecting {
            conn.connect(now);
        }
        for conn in writable {
            conn.flush();
        }
    }

    fn prune_closed(&self) {
        let mut state = self.state.lock().unwrap();
        let closed: Vec<Token> = state
            .table
            .iter()
            .filter(|(_, s)| match s {
                Socket::Connection(c) => c.is_closed(),
                Socket::Acceptor(a) => a.is_closed(),
            })
            .map(|(key, _)| Token(key + FIRST_DYNAMIC_TOKEN))
            .collect();
        for token in closed {
            match state.remove(token) {
                Some(Socket::Connection(conn)) => {
                    let _ = conn.deregister(&self.registry);
                }
                Some(Socket::Acceptor(acceptor)) => {
                    let _ = acceptor.deregister(&self.registry);
                }
                None => {}
            }
        }
    }

    fn shutdown(&self, _poll: Poll) {
        self.scheduler.cancel_timers();
        let mut state = self.state.lock().unwrap();
        for (_, socket) in state.table.drain() {
            match socket {
                Socket::Connection(conn) => conn.close(Some(Fail::Reactor {
                    reason: "reactor stopped".to_string(),
                })),
                Socket::Acceptor(acceptor) => acceptor.close(),
            }
        }
    }
}
