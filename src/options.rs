// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Configuration surfaces exposed by the reactor's embedded API.

use std::sync::Arc;
use std::time::Duration;

use native_tls::{TlsAcceptor, TlsConnector};

/// How a `connect`/`bind` call should use TLS.
#[derive(Clone)]
pub enum Ssl {
    /// Plain, unencrypted connection.
    Disabled,
    /// Wrap the connection with a caller-supplied TLS client connector.
    Connector(Arc<TlsConnector>),
    /// Wrap the connection with a caller-supplied TLS server acceptor.
    Acceptor(Arc<TlsAcceptor>),
    /// Create a default connector/acceptor on demand. Only meaningful for
    /// `connect`, which can build a default `TlsConnector`; `bind` requires
    /// an explicit `Acceptor` since it needs a certificate/key to serve.
    Default,
}

impl Default for Ssl {
    fn default() -> Self {
        Ssl::Disabled
    }
}

/// Options accepted by `Reactor::connect`.
#[derive(Clone)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub ssl: Ssl,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            timeout: Duration::from_secs(5),
            ssl: Ssl::Disabled,
        }
    }
}

impl ConnectOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ssl(mut self, ssl: Ssl) -> Self {
        self.ssl = ssl;
        self
    }
}

/// Options accepted by `Reactor::bind`.
#[derive(Clone)]
pub struct BindOptions {
    pub backlog: u32,
    pub ssl: Ssl,
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions {
            backlog: 5,
            ssl: Ssl::Disabled,
        }
    }
}

impl BindOptions {
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_ssl(mut self, ssl: Ssl) -> Self {
        self.ssl = ssl;
        self
    }
}

/// Options accepted by `Reactor::new`: an injectable clock and the tick
/// (selector poll) resolution.
#[derive(Clone)]
pub struct ReactorOptions {
    pub tick_resolution: Duration,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        ReactorOptions {
            tick_resolution: Duration::from_secs(1),
        }
    }
}

impl ReactorOptions {
    pub fn with_tick_resolution(mut self, tick_resolution: Duration) -> Self {
        self.tick_resolution = tick_resolution;
        self
    }
}
