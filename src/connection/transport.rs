// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The raw, non-blocking socket underneath a [`super::Connection`] — either a
//! bare TCP stream or a TLS stream in some stage of its handshake.
//!
//! Kept separate from the connection state machine in `mod.rs`: the state
//! machine only needs "try to make progress on connecting" and "try to read/
//! write bytes", and this module is where the plain/TLS difference actually
//! lives.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{event::Source as MioSource, Interest, Registry, Token};
use native_tls::{HandshakeError, MidHandshakeTlsStream, TlsAcceptor, TlsConnector, TlsStream};

use crate::fail::Fail;

/// Result of attempting to advance a connect/handshake sequence one step.
pub enum Progress {
    /// Still in progress; call again on the next readiness notification.
    Pending,
    /// The transport is ready for application-level `read`/`write`.
    Ready,
    /// This attempt failed; the caller decides whether to retry another
    /// address or give up.
    Failed(io::Error),
}

pub enum Transport {
    Plain(TcpStream),
    TlsClient(TlsClientState),
    TlsServer(TlsServerState),
}

pub enum TlsClientState {
    Connecting {
        stream: TcpStream,
        connector: Arc<TlsConnector>,
        domain: String,
    },
    Handshaking(MidHandshakeTlsStream<TcpStream>),
    Ready(TlsStream<TcpStream>),
    /// Transient placeholder only ever observed mid-transition.
    Empty,
}

pub enum TlsServerState {
    /// Accepted at the TCP level; handshake hasn't started. The handshake
    /// is driven from the connection's first `read`, not from `connect`
    /// (server connections start CONNECTED).
    Pending { stream: TcpStream, acceptor: Arc<TlsAcceptor> },
    Handshaking(MidHandshakeTlsStream<TcpStream>),
    Ready(TlsStream<TcpStream>),
    Empty,
}

impl Transport {
    pub fn plain(stream: TcpStream) -> Self {
        Transport::Plain(stream)
    }

    pub fn tls_client(stream: TcpStream, connector: Arc<TlsConnector>, domain: String) -> Self {
        Transport::TlsClient(TlsClientState::Connecting { stream, connector, domain })
    }

    pub fn tls_server(stream: TcpStream, acceptor: Arc<TlsAcceptor>) -> Self {
        Transport::TlsServer(TlsServerState::Pending { stream, acceptor })
    }

    /// Drives a plain connect or TLS client handshake forward by one step.
    /// Only meaningful for `Plain` (during its connect phase, tracked by the
    /// owning connection) and `TlsClient`.
    pub fn advance_connect(&mut self) -> Progress {
        match self {
            Transport::Plain(stream) => probe_connect(stream),
            Transport::TlsClient(state) => advance_tls_client(state),
            Transport::TlsServer(_) => Progress::Ready, // server sockets are already connected
        }
    }

    /// Drives a deferred TLS server handshake forward by one step; called
    /// from the connection's first `read`.
    pub fn advance_accept_handshake(&mut self) -> Progress {
        match self {
            Transport::TlsServer(state) => advance_tls_server(state),
            _ => Progress::Ready,
        }
    }

    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::TlsClient(TlsClientState::Ready(stream)) => stream.read(buf),
            Transport::TlsServer(TlsServerState::Ready(stream)) => stream.read(buf),
            _ => Err(io::Error::new(io::ErrorKind::WouldBlock, "handshake not complete")),
        }
    }

    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::TlsClient(TlsClientState::Ready(stream)) => stream.write(buf),
            Transport::TlsServer(TlsServerState::Ready(stream)) => stream.write(buf),
            _ => Err(io::Error::new(io::ErrorKind::WouldBlock, "handshake not complete")),
        }
    }

    pub fn shutdown_read(&mut self) -> io::Result<()> {
        use std::net::Shutdown;
        match self {
            Transport::Plain(stream) => stream.shutdown(Shutdown::Read),
            Transport::TlsClient(TlsClientState::Ready(stream)) => stream.get_ref().shutdown(Shutdown::Read),
            Transport::TlsServer(TlsServerState::Ready(stream)) => stream.get_ref().shutdown(Shutdown::Read),
            _ => Ok(()),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.with_source(|source| registry.register(source, token, Interest::READABLE | Interest::WRITABLE))
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.with_source(|source| registry.reregister(source, token, Interest::READABLE | Interest::WRITABLE))
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.with_source(|source| registry.deregister(source))
    }

    fn with_source<F>(&mut self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut dyn MioSource) -> io::Result<()>,
    {
        match self {
            Transport::Plain(stream) => f(stream),
            Transport::TlsClient(TlsClientState::Connecting { stream, .. }) => f(stream),
            Transport::TlsClient(TlsClientState::Ready(stream)) => f(stream.get_mut()),
            Transport::TlsClient(TlsClientState::Handshaking(_)) | Transport::TlsClient(TlsClientState::Empty) => {
                // mid-handshake streams are briefly un-registerable; caller
                // retries registration once the handshake settles.
                Ok(())
            }
            Transport::TlsServer(TlsServerState::Pending { stream, .. }) => f(stream),
            Transport::TlsServer(TlsServerState::Ready(stream)) => f(stream.get_mut()),
            Transport::TlsServer(TlsServerState::Handshaking(_)) | Transport::TlsServer(TlsServerState::Empty) => Ok(()),
        }
    }
}

fn advance_tls_client(state: &mut TlsClientState) -> Progress {
    match std::mem::replace(state, TlsClientState::Empty) {
        TlsClientState::Connecting { stream, connector, domain } => {
            match probe_connect(&stream) {
                Progress::Ready => {}
                Progress::Pending => {
                    *state = TlsClientState::Connecting { stream, connector, domain };
                    return Progress::Pending;
                }
                Progress::Failed(e) => return Progress::Failed(e),
            }
            match connector.connect(&domain, stream) {
                Ok(tls) => {
                    *state = TlsClientState::Ready(tls);
                    Progress::Ready
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    *state = TlsClientState::Handshaking(mid);
                    Progress::Pending
                }
                Err(HandshakeError::Failure(e)) => Progress::Failed(tls_io_error(e)),
            }
        }
        TlsClientState::Handshaking(mid) => match mid.handshake() {
            Ok(tls) => {
                *state = TlsClientState::Ready(tls);
                Progress::Ready
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                *state = TlsClientState::Handshaking(mid);
                Progress::Pending
            }
            Err(HandshakeError::Failure(e)) => Progress::Failed(tls_io_error(e)),
        },
        ready @ TlsClientState::Ready(_) => {
            *state = ready;
            Progress::Ready
        }
        TlsClientState::Empty => Progress::Failed(io::Error::new(io::ErrorKind::Other, "transport in transit")),
    }
}

fn advance_tls_server(state: &mut TlsServerState) -> Progress {
    match std::mem::replace(state, TlsServerState::Empty) {
        TlsServerState::Pending { stream, acceptor } => match acceptor.accept(stream) {
            Ok(tls) => {
                *state = TlsServerState::Ready(tls);
                Progress::Ready
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                *state = TlsServerState::Handshaking(mid);
                Progress::Pending
            }
            Err(HandshakeError::Failure(e)) => Progress::Failed(tls_io_error(e)),
        },
        TlsServerState::Handshaking(mid) => match mid.handshake() {
            Ok(tls) => {
                *state = TlsServerState::Ready(tls);
                Progress::Ready
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                *state = TlsServerState::Handshaking(mid);
                Progress::Pending
            }
            Err(HandshakeError::Failure(e)) => Progress::Failed(tls_io_error(e)),
        },
        ready @ TlsServerState::Ready(_) => {
            *state = ready;
            Progress::Ready
        }
        TlsServerState::Empty => Progress::Failed(io::Error::new(io::ErrorKind::Other, "transport in transit")),
    }
}

fn tls_io_error(e: native_tls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// `SO_ERROR` alone can't distinguish "connected" from "still connecting":
/// a non-blocking connect in progress also reports `take_error() == Ok(None)`.
/// `peer_addr()` only succeeds once the three-way handshake has actually
/// completed, so it's the confirmation used here on top of `take_error`'s
/// failure check, rather than declaring the socket ready on `SO_ERROR` alone.
fn probe_connect(stream: &TcpStream) -> Progress {
    match stream.take_error() {
        Ok(Some(e)) => return Progress::Failed(e),
        Err(e) => return Progress::Failed(e),
        Ok(None) => {}
    }
    if stream.peer_addr().is_ok() {
        Progress::Ready
    } else {
        Progress::Pending
    }
}

pub fn connect_nonblocking(addr: SocketAddr) -> Result<TcpStream, Fail> {
    TcpStream::connect(addr).map_err(Fail::connection)
}
