// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Protocol-agnostic, non-blocking connection state machine.
//!
//! A [`Connection`] owns exactly one socket and walks through
//! CONNECTING -> CONNECTED -> DRAINING -> CLOSED. Every public method here is
//! non-blocking and safe to call from any thread; the actual socket syscalls
//! only ever run on the reactor's I/O thread, driven by [`Connection::connect`],
//! [`Connection::read`] and [`Connection::flush`], which the reactor tick
//! calls for every socket it owns.
//!
//! TLS is not a wrapper around a `Connection` — it is a different
//! [`transport::Transport`] variant underneath the same state machine, so the
//! CONNECTING/CONNECTED/DRAINING/CLOSED contract, the write buffer, and the
//! data stream are shared unchanged between plain and TLS connections.

mod transport;

pub use transport::Transport;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use mio::{Registry, Token};
use native_tls::{TlsAcceptor, TlsConnector};

use crate::collections::ByteBuffer;
use crate::fail::Fail;
use crate::future::{failed, resolved, Future, Promise};
use crate::stream::{Source, Stream};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Draining,
    Closed,
}

/// What a freshly constructed connection still needs to do before data can
/// flow: resolve the remaining addresses to try (outbound), run a TLS
/// handshake, or neither (a plain inbound connection is ready immediately).
struct ConnectBookkeeping {
    remaining_addrs: Vec<SocketAddr>,
    started_at: Instant,
    timeout: Duration,
    connector: Option<(Arc<TlsConnector>, String)>,
}

pub struct Connection {
    host: String,
    port: u16,
    state: Mutex<ConnectionState>,
    transport: Mutex<Transport>,
    connect: Mutex<Option<ConnectBookkeeping>>,
    write_buffer: Mutex<ByteBuffer>,
    closed: Promise<()>,
    /// Only `Some` for outbound connections; fulfilled with this connection
    /// when CONNECTING resolves to CONNECTED, or failed if it closes before
    /// ever reaching CONNECTED. Accepted connections start CONNECTED already,
    /// so `established()` resolves them immediately without this field.
    connect_result: Mutex<Option<Promise<Arc<Connection>>>>,
    data_source: Source<Vec<u8>>,
    token: Mutex<Option<Token>>,
    /// Set only for TLS server connections: fired exactly once, the first
    /// time the deferred handshake completes, so the acceptor's accept
    /// listeners see a connection that has already finished its handshake.
    accept_notify: Mutex<Option<Source<Arc<Connection>>>>,
}

impl Connection {
    fn new(
        host: String,
        port: u16,
        state: ConnectionState,
        transport: Transport,
        connect: Option<ConnectBookkeeping>,
    ) -> Arc<Connection> {
        let (closed, _future) = Promise::new();
        Arc::new(Connection {
            host,
            port,
            state: Mutex::new(state),
            transport: Mutex::new(transport),
            connect: Mutex::new(connect),
            write_buffer: Mutex::new(ByteBuffer::new()),
            closed,
            connect_result: Mutex::new(None),
            data_source: Source::new(),
            token: Mutex::new(None),
            accept_notify: Mutex::new(None),
        })
    }

    /// Resolves `host:port` and builds an outbound connection to the first
    /// reachable address, starting in CONNECTING. Resolution happens here, on
    /// whichever thread calls this, so the reactor's per-tick `connect` never
    /// performs a blocking DNS lookup (see DESIGN.md).
    pub fn connect_outbound(
        host: &str,
        port: u16,
        now: Instant,
        timeout: Duration,
        tls: Option<Arc<TlsConnector>>,
    ) -> Result<Arc<Connection>, Fail> {
        let mut addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(Fail::connection)?
            .collect();
        if addrs.is_empty() {
            return Err(Fail::connection(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no addresses resolved",
            )));
        }
        let first = addrs.remove(0);
        let stream = transport::connect_nonblocking(first)?;
        let transport = match &tls {
            Some(connector) => Transport::tls_client(stream, connector.clone(), host.to_string()),
            None => Transport::plain(stream),
        };
        let bookkeeping = ConnectBookkeeping {
            remaining_addrs: addrs,
            started_at: now,
            timeout,
            connector: tls.map(|c| (c, host.to_string())),
        };
        let conn = Self::new(
            host.to_string(),
            port,
            ConnectionState::Connecting,
            transport,
            Some(bookkeeping),
        );
        *conn.connect_result.lock().unwrap() = Some(Promise::new().0);
        Ok(conn)
    }

    /// A future resolving to this connection once it reaches CONNECTED, or
    /// failing with the close cause if it never does. Already-connected
    /// (accepted) connections resolve immediately.
    pub fn established(self: &Arc<Self>) -> Future<Arc<Connection>> {
        let promise = self.connect_result.lock().unwrap().as_ref().map(|p| p.future());
        match promise {
            Some(future) => future,
            None => resolved(self.clone()),
        }
    }

    /// Wraps a just-accepted socket as a server connection, starting directly
    /// in CONNECTED — plain server sockets need no further handshake.
    pub fn accepted_plain(peer: SocketAddr, stream: mio::net::TcpStream) -> Arc<Connection> {
        Self::new(
            peer.ip().to_string(),
            peer.port(),
            ConnectionState::Connected,
            Transport::plain(stream),
            None,
        )
    }

    /// Wraps a just-accepted socket behind a TLS acceptor. The connection
    /// still starts CONNECTED, but its transport begins mid-handshake; the
    /// handshake itself is driven by the first `read` call, and
    /// `notify` is published to exactly once, when that handshake completes.
    pub fn accepted_tls(
        peer: SocketAddr,
        stream: mio::net::TcpStream,
        acceptor: Arc<TlsAcceptor>,
        notify: Source<Arc<Connection>>,
    ) -> Arc<Connection> {
        let conn = Self::new(
            peer.ip().to_string(),
            peer.port(),
            ConnectionState::Connected,
            Transport::tls_server(stream, acceptor),
            None,
        );
        *conn.accept_notify.lock().unwrap() = Some(notify);
        conn
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected | ConnectionState::Draining)
            && !self.write_buffer.lock().unwrap().is_empty()
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn data(&self) -> Stream<Vec<u8>> {
        self.data_source.stream()
    }

    /// A future that resolves to this connection on a clean close (cause =
    /// nil) and fails with the close's cause otherwise. Deliberately does
    /// NOT store `Arc<Connection>` inside the promise it wraps — that would
    /// create a reference cycle (this connection owning a promise whose
    /// completed value owns this connection right back) that would never be
    /// collected. Upgrading a `Weak` at resolution time breaks the cycle.
    pub fn closed(self: &Arc<Self>) -> Future<Arc<Connection>> {
        let weak = Arc::downgrade(self);
        self.closed.future().flat_map(move |_| match weak.upgrade() {
            Some(conn) => resolved(conn),
            None => failed(Fail::Reactor {
                reason: "connection dropped before its close was observed".to_string(),
            }),
        })
    }

    pub(crate) fn set_token(&self, token: Token) {
        *self.token.lock().unwrap() = Some(token);
    }

    pub(crate) fn token(&self) -> Option<Token> {
        *self.token.lock().unwrap()
    }

    pub(crate) fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.set_token(token);
        self.transport.lock().unwrap().register(registry, token)
    }

    pub(crate) fn deregister(&self, registry: &Registry) -> io::Result<()> {
        self.transport.lock().unwrap().deregister(registry)
    }

    /// Appends `bytes` to the write buffer. A no-op once DRAINING or CLOSED:
    /// further writes are silently dropped.
    pub fn write(&self, bytes: &[u8]) {
        if matches!(self.state(), ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        self.write_buffer.lock().unwrap().append(bytes);
    }

    /// Like [`Connection::write`], but `f` receives the write buffer directly
    /// so callers can append without first materializing a `Vec<u8>` (e.g. a
    /// protocol handler building a framed message in place). Also a no-op
    /// once DRAINING or CLOSED.
    pub fn write_with<F>(&self, f: F)
    where
        F: FnOnce(&mut ByteBuffer),
    {
        if matches!(self.state(), ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        f(&mut self.write_buffer.lock().unwrap());
    }

    /// Legacy single-listener callback for incoming application data,
    /// equivalent to `data().subscribe(...)` but matching the single
    /// `(outcome, connection)`-shaped listener contract used elsewhere.
    pub fn on_data<F>(&self, mut f: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.data_source.stream().subscribe(move |bytes: &Vec<u8>| f(bytes));
    }

    /// Advances a CONNECTING connection by one step: checks the connect
    /// timeout, then drives the underlying transport's connect/handshake.
    /// Idempotent and safe to call every tick; does nothing once CONNECTED.
    pub(crate) fn connect(self: &Arc<Self>, now: Instant) {
        if self.state() != ConnectionState::Connecting {
            return;
        }
        let timed_out = {
            let guard = self.connect.lock().unwrap();
            match guard.as_ref() {
                Some(bk) => now.duration_since(bk.started_at) > bk.timeout,
                None => false,
            }
        };
        if timed_out {
            self.close(Some(Fail::ConnectionTimeout));
            return;
        }
        // `advance_connect` drives both the raw TCP handshake and, for a
        // `TlsClient` transport (selected up front in `connect_outbound`),
        // the TLS handshake layered on top of it; `Ready` here always means
        // the connection is usable for application `read`/`write`.
        let progress = self.transport.lock().unwrap().advance_connect();
        match progress {
            transport::Progress::Pending => {}
            transport::Progress::Ready => {
                *self.state.lock().unwrap() = ConnectionState::Connected;
                if let Some(promise) = self.connect_result.lock().unwrap().as_ref() {
                    let _ = promise.fulfill(self.clone());
                }
            }
            transport::Progress::Failed(e) => self.retry_or_fail(e),
        }
    }

    fn retry_or_fail(self: &Arc<Self>, last_error: io::Error) {
        let next_addr = {
            let mut guard = self.connect.lock().unwrap();
            guard.as_mut().and_then(|bk| {
                if bk.remaining_addrs.is_empty() {
                    None
                } else {
                    Some(bk.remaining_addrs.remove(0))
                }
            })
        };
        match next_addr {
            Some(addr) => match transport::connect_nonblocking(addr) {
                Ok(stream) => {
                    warn!("connect to {}:{} failed ({}), retrying {}", self.host, self.port, last_error, addr);
                    let tls = self.connect.lock().unwrap().as_ref().and_then(|bk| bk.connector.clone());
                    let new_transport = match tls {
                        Some((connector, domain)) => Transport::tls_client(stream, connector, domain),
                        None => Transport::plain(stream),
                    };
                    *self.transport.lock().unwrap() = new_transport;
                }
                Err(_) => self.close(Some(Fail::connection(last_error))),
            },
            None => self.close(Some(Fail::connection(last_error))),
        }
    }

    /// Reads one chunk of available bytes and publishes it to [`Connection::data`]
    /// and any `on_data` listeners. For a TLS server connection whose
    /// handshake hasn't completed yet, this instead drives the handshake
    /// and notifies the acceptor's accept listeners exactly once, the
    /// first time it finishes.
    pub(crate) fn read(self: &Arc<Self>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        {
            let mut transport = self.transport.lock().unwrap();
            match transport.advance_accept_handshake() {
                transport::Progress::Pending => return,
                transport::Progress::Ready => {
                    drop(transport);
                    if let Some(notify) = self.accept_notify.lock().unwrap().take() {
                        notify.publish(self.clone());
                    }
                }
                transport::Progress::Failed(e) => {
                    drop(transport);
                    self.close(Some(Fail::connection(e)));
                    return;
                }
            }
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let result = self.transport.lock().unwrap().try_read(&mut buf);
            match result {
                Ok(0) => {
                    self.close(None);
                    break;
                }
                Ok(n) => {
                    self.data_source.publish(buf[..n].to_vec());
                }
                Err(e) if Fail::would_block(&e) => break,
                Err(e) => {
                    self.close(Some(Fail::connection_closed(e)));
                    break;
                }
            }
        }
    }

    /// Writes as much of the write buffer as the socket accepts, then
    /// discards the bytes actually sent. Once DRAINING and the buffer has
    /// been fully flushed, transitions to CLOSED.
    pub(crate) fn flush(self: &Arc<Self>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        loop {
            let chunk = {
                let mut buffer = self.write_buffer.lock().unwrap();
                if buffer.is_empty() {
                    break;
                }
                buffer.cheap_peek().to_vec()
            };
            if chunk.is_empty() {
                break;
            }
            let written = self.transport.lock().unwrap().try_write(&chunk);
            match written {
                Ok(0) => break,
                Ok(n) => self.write_buffer.lock().unwrap().discard(n),
                Err(e) if Fail::would_block(&e) => break,
                Err(e) => {
                    self.close(Some(Fail::connection_closed(e)));
                    return;
                }
            }
        }
        if self.state() == ConnectionState::Draining && self.write_buffer.lock().unwrap().is_empty() {
            self.close(None);
        }
    }

    /// Transitions to DRAINING: no further writes are accepted, but bytes
    /// already queued are still flushed before the connection closes. If the
    /// write buffer is already empty this closes immediately. Returns the
    /// same future as [`Connection::closed`].
    pub fn drain(self: &Arc<Self>) -> Future<Arc<Connection>> {
        let just_transitioned = {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, ConnectionState::Draining | ConnectionState::Closed) {
                false
            } else {
                *state = ConnectionState::Draining;
                true
            }
        };
        if just_transitioned {
            let _ = self.transport.lock().unwrap().shutdown_read();
            if self.write_buffer.lock().unwrap().is_empty() {
                self.close(None);
            }
        }
        self.closed()
    }

    /// Transitions to CLOSED. Idempotent: only the first call has any
    /// effect. Fulfills the closed future with this connection when `cause`
    /// is `None`, or fails it with `cause` otherwise. OS-level close errors
    /// are ignored: close never raises.
    pub fn close(self: &Arc<Self>, cause: Option<Fail>) {
        let already_closed = {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                true
            } else {
                *state = ConnectionState::Closed;
                false
            }
        };
        if already_closed {
            return;
        }
        if let Some(e) = &cause {
            warn!("closing connection {}:{} ({})", self.host, self.port, e);
        }
        {
            let mut transport = self.transport.lock().unwrap();
            let _ = match &mut *transport {
                Transport::Plain(s) => s.shutdown(std::net::Shutdown::Both),
                Transport::TlsClient(transport::TlsClientState::Ready(s)) => s.get_ref().shutdown(std::net::Shutdown::Both),
                Transport::TlsServer(transport::TlsServerState::Ready(s)) => s.get_ref().shutdown(std::net::Shutdown::Both),
                _ => Ok(()),
            };
        }
        if let Some(promise) = self.connect_result.lock().unwrap().as_ref() {
            match &cause {
                Some(e) => {
                    let _ = promise.fail(e.clone());
                }
                None => {
                    let _ = promise.fulfill(self.clone());
                }
            }
        }
        match cause {
            Some(e) => {
                let _ = self.closed.fail(e);
            }
            None => {
                let _ = self.closed.fulfill(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn loopback_pair() -> (Arc<Connection>, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_std = StdTcpStream::connect(addr).unwrap();
        let (server_std, peer) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let server = mio::net::TcpStream::from_std(server_std);
        let conn = Connection::accepted_plain(peer, server);
        (conn, client_std)
    }

    #[test]
    fn write_then_flush_delivers_bytes() {
        let (conn, mut client) = loopback_pair();
        conn.write(b"hello");
        conn.flush();
        let mut buf = [0u8; 5];
        use std::io::Read;
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_with_appends_via_the_buffer_directly() {
        let (conn, mut client) = loopback_pair();
        conn.write_with(|buf| {
            buf.append(b"built ");
            buf.append(b"in place");
        });
        conn.flush();
        let mut buf = [0u8; 14];
        use std::io::Read;
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"built in place");
    }

    #[test]
    fn write_after_drain_is_dropped() {
        let (conn, _client) = loopback_pair();
        let _ = conn.drain();
        conn.write(b"ignored");
        assert!(conn.write_buffer.lock().unwrap().is_empty());
    }

    #[test]
    fn drain_with_empty_buffer_closes_immediately() {
        let (conn, _client) = loopback_pair();
        let fut = conn.drain();
        assert!(fut.is_completed());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn drain_with_pending_writes_closes_only_after_flush() {
        let (conn, mut client) = loopback_pair();
        conn.write(b"x");
        let fut = conn.drain();
        assert!(!fut.is_completed());
        conn.flush();
        assert!(fut.is_completed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        let mut buf = [0u8; 1];
        use std::io::Read;
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn close_is_idempotent_and_completes_closed_future_once() {
        let (conn, _client) = loopback_pair();
        let fut = conn.closed();
        conn.close(None);
        conn.close(Some(Fail::Cancelled)); // second call is a no-op
        assert!(fut.value().is_ok());
    }

    #[test]
    fn close_with_cause_fails_closed_future() {
        let (conn, _client) = loopback_pair();
        let fut = conn.closed();
        conn.close(Some(Fail::ConnectionTimeout));
        assert_eq!(fut.value().unwrap_err(), Fail::ConnectionTimeout);
    }

    #[test]
    fn read_delivers_peer_bytes_to_data_stream() {
        let (conn, mut client) = loopback_pair();
        use std::io::Write;
        client.write_all(b"ping").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        conn.on_data(move |bytes| seen2.lock().unwrap().extend_from_slice(bytes));
        // give the kernel a moment to deliver the bytes to the nonblocking socket
        std::thread::sleep(Duration::from_millis(50));
        conn.read();
        assert_eq!(*seen.lock().unwrap(), b"ping");
    }

    #[test]
    fn peer_shutdown_closes_connection_on_next_read() {
        let (conn, client) = loopback_pair();
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        conn.read();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
