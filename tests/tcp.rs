// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end plain-TCP scenarios driving a real [`Reactor`] over loopback
//! sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidepool::{BindOptions, ConnectOptions, Connection, Reactor, ReactorOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_reactor() -> Arc<Reactor> {
    let reactor = Reactor::new(ReactorOptions::default().with_tick_resolution(Duration::from_millis(10))).unwrap();
    reactor.start();
    reactor
}

#[test]
fn echo_server_reflects_client_bytes() {
    init_logging();
    let reactor = start_reactor();

    let acceptor = reactor.bind("127.0.0.1", 0, BindOptions::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();
    acceptor.accepted().subscribe(|conn: &Arc<Connection>| {
        let conn = conn.clone();
        conn.on_data(move |bytes| conn.write(bytes));
    });

    let client = reactor
        .connect(&addr.ip().to_string(), addr.port(), ConnectOptions::default())
        .unwrap()
        .value()
        .expect("client should connect");
    client.write(b"HELLO");

    let received = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = crossbeam_channel::unbounded();
    let received2 = received.clone();
    client.on_data(move |bytes| {
        received2.lock().unwrap().extend_from_slice(bytes);
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(2)).expect("expected an echo");
    assert_eq!(*received.lock().unwrap(), b"HELLO");

    reactor.stop();
}

#[test]
fn drain_flushes_pending_bytes_before_closing() {
    init_logging();
    let reactor = start_reactor();

    let acceptor = reactor.bind("127.0.0.1", 0, BindOptions::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();
    let server_seen = Arc::new(Mutex::new(Vec::new()));
    let server_seen2 = server_seen.clone();
    let server_closed = Arc::new(Mutex::new(false));
    let server_closed2 = server_closed.clone();
    acceptor.accepted().subscribe(move |conn: &Arc<Connection>| {
        let seen = server_seen2.clone();
        conn.on_data(move |bytes| seen.lock().unwrap().extend_from_slice(bytes));
        let closed_flag = server_closed2.clone();
        let conn2 = conn.clone();
        conn.closed().on_complete(move |_, _| {
            *closed_flag.lock().unwrap() = true;
            let _ = conn2.state();
        });
    });

    let client = reactor
        .connect(&addr.ip().to_string(), addr.port(), ConnectOptions::default())
        .unwrap()
        .value()
        .expect("client should connect");
    client.write(b"long message body");
    let drained = client.drain();
    drained.value().expect("draining connection should close cleanly");
    assert_eq!(client.state(), tidepool::ConnectionState::Closed);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(*server_seen.lock().unwrap(), b"long message body");

    reactor.stop();
}

#[test]
fn multiple_clients_are_independent() {
    init_logging();
    let reactor = start_reactor();

    let acceptor = reactor.bind("127.0.0.1", 0, BindOptions::default()).unwrap();
    let addr = acceptor.local_addr().unwrap();
    acceptor.accepted().subscribe(|conn: &Arc<Connection>| {
        let conn = conn.clone();
        conn.on_data(move |bytes| conn.write(bytes));
    });

    let mut clients = Vec::new();
    for tag in [b'A', b'B', b'C'] {
        let client = reactor
            .connect(&addr.ip().to_string(), addr.port(), ConnectOptions::default())
            .unwrap()
            .value()
            .unwrap();
        client.write(&[tag, tag, tag]);
        clients.push((tag, client));
    }

    std::thread::sleep(Duration::from_millis(200));
    for (tag, client) in &clients {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        client.on_data(move |bytes| seen2.lock().unwrap().extend_from_slice(bytes));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), vec![*tag, *tag, *tag]);
    }

    reactor.stop();
}
