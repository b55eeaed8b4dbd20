// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Listening socket that produces [`Connection`]s.
//!
//! An [`Acceptor`] owns one listening socket and, on every readiness
//! notification, accepts as many pending connections as are queued,
//! wrapping each in a [`Connection`] already registered with the reactor.
//! TLS acceptors additionally defer notifying `on_accept` subscribers until
//! each connection's handshake completes, which the connection itself
//! drives from its first `read` (see `connection::Connection::read`).

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use log::warn;
use mio::{Registry, Token};
use native_tls::TlsAcceptor;

use crate::connection::Connection;
use crate::fail::Fail;
use crate::stream::{Source, Stream};

enum Ssl {
    Disabled,
    Enabled(Arc<TlsAcceptor>),
}

pub struct Acceptor {
    listener: Mutex<mio::net::TcpListener>,
    ssl: Ssl,
    accept_source: Source<Arc<Connection>>,
    token: Mutex<Option<Token>>,
    closed: Mutex<bool>,
}

impl Acceptor {
    /// Resolves `host:port` and binds the first address it can, matching the
    /// retry-on-`address-not-available` behavior the connect side also uses.
    pub fn bind(host: &str, port: u16, backlog: u32, ssl: Option<Arc<TlsAcceptor>>) -> Result<Arc<Acceptor>, Fail> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(Fail::connection)?.collect();
        if addrs.is_empty() {
            return Err(Fail::connection(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no addresses resolved",
            )));
        }
        let mut last_error = None;
        for addr in addrs {
            match std::net::TcpListener::bind(addr) {
                Ok(std_listener) => {
                    std_listener.set_nonblocking(true).map_err(Fail::connection)?;
                    // std's own `bind` already called `listen` with its own
                    // default backlog; re-issuing `listen` on the same fd
                    // with the caller's backlog is valid POSIX and is the
                    // only way to honor a caller-chosen backlog without a
                    // raw socket/libc bind of our own.
                    unsafe {
                        libc::listen(std_listener.as_raw_fd(), backlog as libc::c_int);
                    }
                    let listener = mio::net::TcpListener::from_std(std_listener);
                    return Ok(Arc::new(Acceptor {
                        listener: Mutex::new(listener),
                        ssl: match ssl {
                            Some(a) => Ssl::Enabled(a),
                            None => Ssl::Disabled,
                        },
                        accept_source: Source::new(),
                        token: Mutex::new(None),
                        closed: Mutex::new(false),
                    }));
                }
                Err(e) => {
                    warn!("failed to bind {}:{} ({}), trying next address", addr.ip(), addr.port(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(Fail::connection(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
        })))
    }

    pub fn accepted(&self) -> Stream<Arc<Connection>> {
        self.accept_source.stream()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.lock().unwrap().local_addr()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub(crate) fn set_token(&self, token: Token) {
        *self.token.lock().unwrap() = Some(token);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        *self.token.lock().unwrap()
    }

    pub(crate) fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.set_token(token);
        registry.register(&mut *self.listener.lock().unwrap(), token, mio::Interest::READABLE)
    }

    pub(crate) fn deregister(&self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut *self.listener.lock().unwrap())
    }

    /// Accepts every currently pending connection. Each is wrapped as a
    /// [`Connection`] and returned for the reactor to register and publish;
    /// a plain connection is returned ready to publish immediately, while a
    /// TLS connection is returned already wired to notify `accepted()` once
    /// its handshake completes on its own first `read`.
    pub(crate) fn accept_ready(self: &Arc<Self>) -> Vec<Arc<Connection>> {
        let mut out = Vec::new();
        loop {
            let accepted = self.listener.lock().unwrap().accept();
            match accepted {
                Ok((stream, peer)) => match &self.ssl {
                    Ssl::Disabled => {
                        let conn = Connection::accepted_plain(peer, stream);
                        self.accept_source.publish(conn.clone());
                        out.push(conn);
                    }
                    Ssl::Enabled(acceptor) => {
                        let conn = Connection::accepted_tls(peer, stream, acceptor.clone(), self.accept_source.clone());
                        out.push(conn);
                    }
                },
                Err(e) if Fail::would_block(&e) => break,
                Err(_) => break,
            }
        }
        out
    }

    /// Closes the listening socket. A no-op if already closed.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;
    }
}
