// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TLS upgrade end-to-end scenario: a server
//! bound with a `TlsAcceptor`, a client connecting with a `TlsConnector`, and
//! a plain client observing the handshake it never completes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use native_tls::{Identity, TlsAcceptor, TlsConnector};

use tidepool::{BindOptions, ConnectOptions, Connection, Reactor, ReactorOptions, Ssl};

const IDENTITY_PKCS12: &[u8] = include_bytes!("fixtures/test_identity.p12");
const IDENTITY_PASSWORD: &str = "tidepool-test";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_reactor() -> Arc<Reactor> {
    let reactor = Reactor::new(ReactorOptions::default().with_tick_resolution(Duration::from_millis(10))).unwrap();
    reactor.start();
    reactor
}

fn server_acceptor() -> Arc<TlsAcceptor> {
    let identity = Identity::from_pkcs12(IDENTITY_PKCS12, IDENTITY_PASSWORD).expect("valid test identity");
    Arc::new(TlsAcceptor::new(identity).expect("tls acceptor"))
}

fn client_connector() -> Arc<TlsConnector> {
    // The fixture is self-signed for "localhost"; tests talk to 127.0.0.1
    // over loopback, which never matches that name, so certificate
    // verification is disabled the same way a caller would for a
    // self-hosted dev certificate.
    Arc::new(
        TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .expect("tls connector"),
    )
}

#[test]
fn tls_client_and_server_exchange_data_after_handshake() {
    init_logging();
    let reactor = start_reactor();

    let acceptor = reactor
        .bind("127.0.0.1", 0, BindOptions::default().with_ssl(Ssl::Acceptor(server_acceptor())))
        .unwrap();
    let addr = acceptor.local_addr().unwrap();
    acceptor.accepted().subscribe(|conn: &Arc<Connection>| {
        let conn = conn.clone();
        conn.on_data(move |bytes| {
            let mut reversed = bytes.to_vec();
            reversed.reverse();
            conn.write(&reversed);
        });
    });

    let client = reactor
        .connect(
            &addr.ip().to_string(),
            addr.port(),
            ConnectOptions::default().with_ssl(Ssl::Connector(client_connector())),
        )
        .unwrap()
        .value()
        .expect("tls handshake should succeed");

    client.write(b"tidepool");
    let received = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = crossbeam_channel::unbounded();
    let received2 = received.clone();
    client.on_data(move |bytes| {
        received2.lock().unwrap().extend_from_slice(bytes);
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(2)).expect("expected a reply over TLS");
    assert_eq!(*received.lock().unwrap(), b"loopedit");

    reactor.stop();
}

#[test]
fn plain_client_against_tls_port_never_completes_handshake() {
    init_logging();
    let reactor = start_reactor();

    let acceptor = reactor
        .bind("127.0.0.1", 0, BindOptions::default().with_ssl(Ssl::Acceptor(server_acceptor())))
        .unwrap();
    let addr = acceptor.local_addr().unwrap();
    let accepted_count = Arc::new(Mutex::new(0usize));
    let accepted_count2 = accepted_count.clone();
    acceptor.accepted().subscribe(move |_conn: &Arc<Connection>| {
        *accepted_count2.lock().unwrap() += 1;
    });

    let client = reactor
        .connect(&addr.ip().to_string(), addr.port(), ConnectOptions::default())
        .unwrap()
        .value()
        .expect("plain TCP connect itself still succeeds");
    client.write(b"not a tls client hello");

    std::thread::sleep(Duration::from_millis(300));
    // The server's handshake never completes against a non-TLS peer, so the
    // acceptor's `accepted()` stream — which TLS connections only publish to
    // once their handshake finishes — never fires.
    assert_eq!(*accepted_count.lock().unwrap(), 0);

    reactor.stop();
}
