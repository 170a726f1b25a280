//! Integration tests for warpnet-host.
//!
//! Servers and clients talk over an in-process loopback network, each test
//! with its own network and its own engine init counter.

use std::{
    net::UdpSocket,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use warpnet_core::{
    config::{PollerConfig, SessionConfig},
    engine_state::EngineInitState,
    error::ErrorKind,
};
use warpnet_host::{
    ClientSession, EventKind, LoopbackEngine, LoopbackNetwork, PeerHandle, PollerHandle, ServerSession,
};

fn init_state() -> &'static EngineInitState {
    Box::leak(Box::new(EngineInitState::new()))
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn start_server(
    network: &LoopbackNetwork,
    port: u16,
    state: &'static EngineInitState,
) -> ServerSession<LoopbackEngine> {
    let server = ServerSession::with_init_state(
        LoopbackEngine::new(network),
        SessionConfig::server("127.0.0.1", port),
        state,
    )
    .with_port_probe(|_: &str, _: u16| true);
    server.start().unwrap();
    server
}

fn connect_client(
    network: &LoopbackNetwork,
    port: u16,
    state: &'static EngineInitState,
) -> ClientSession<LoopbackEngine> {
    let client = ClientSession::with_init_state(
        LoopbackEngine::new(network),
        SessionConfig::client("127.0.0.1", port),
        state,
    );
    client.connect(Duration::from_secs(2)).unwrap();
    client
}

fn track_connects(server: &ServerSession<LoopbackEngine>) -> Arc<Mutex<Vec<PeerHandle>>> {
    let peers = Arc::new(Mutex::new(Vec::new()));
    let sink = peers.clone();
    server.events().on_connect(move |peer| sink.lock().unwrap().push(peer));
    peers
}

fn track_errors(events: &warpnet_host::EventBus) -> Arc<Mutex<Vec<ErrorKind>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    events.on_error(move |err| sink.lock().unwrap().push(err.clone()));
    errors
}

fn shutdown(server: &ServerSession<LoopbackEngine>, handle: PollerHandle) {
    server.stop();
    handle.join().unwrap();
    server.shutdown();
}

#[test]
fn test_reliable_sends_arrive_in_order() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7000, state);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    server.events().on_receive(move |_, channel, payload| {
        sink.lock().unwrap().push((channel, payload.to_vec()));
    });
    let handle = server.serve_in_background().unwrap();

    let client = connect_client(&network, 7000, state);
    assert!(client.is_connected());
    for payload in [b"A", b"B", b"C"] {
        assert!(client.send(0, payload, true) >= 0);
    }

    assert!(wait_until(|| received.lock().unwrap().len() == 3));
    assert_eq!(
        received.lock().unwrap().as_slice(),
        &[(0, b"A".to_vec()), (0, b"B".to_vec()), (0, b"C".to_vec())]
    );

    client.stop();
    client.wait().unwrap();
    shutdown(&server, handle);
}

#[test]
fn test_connect_times_out_against_unreachable_address() {
    let network = LoopbackNetwork::new();
    let client = ClientSession::with_init_state(
        LoopbackEngine::new(&network),
        SessionConfig::client("127.0.0.1", 7001),
        init_state(),
    );
    let errors = track_errors(client.events());

    let started = Instant::now();
    let result = client.connect(Duration::from_millis(50));
    let elapsed = started.elapsed();

    assert_eq!(result, Err(ErrorKind::ConnectTimeout(Duration::from_millis(50))));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    assert_eq!(client.events().subscriber_count(EventKind::Connect), 0);
    assert_eq!(client.server_peer(), None);
    assert_eq!(client.session().peer_count(), 0);
    assert_eq!(errors.lock().unwrap().as_slice(), &[ErrorKind::ConnectTimeout(Duration::from_millis(50))]);

    client.wait().unwrap();
    assert!(!client.poller_control().is_running());
}

#[test]
fn test_server_appearing_after_timeout_has_no_effect() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let client = ClientSession::with_init_state(
        LoopbackEngine::new(&network),
        SessionConfig::client("127.0.0.1", 7010),
        state,
    );
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    client.events().on_connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(client.connect(Duration::from_millis(30)).is_err());
    client.wait().unwrap();

    // A server bound afterwards never hears from the abandoned attempt.
    let server = start_server(&network, 7010, state);
    let handle = server.serve_in_background().unwrap();
    thread::sleep(Duration::from_millis(50));
    for _ in 0..5 {
        assert_eq!(client.session().service(Duration::from_millis(5)), Ok(None));
    }

    assert_eq!(connects.load(Ordering::SeqCst), 0);
    assert_eq!(client.session().peer_count(), 0);
    assert!(server.session().connected_peers().is_empty());
    shutdown(&server, handle);
}

#[test]
fn test_idle_poller_does_not_delay_sends() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let lazy = PollerConfig::new(Duration::from_millis(2), Duration::from_millis(200));
    let server = start_server(&network, 7011, state).with_poller_config(lazy);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    server.events().on_receive(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let handle = server.serve_in_background().unwrap();

    let client = ClientSession::with_init_state(
        LoopbackEngine::new(&network),
        SessionConfig::client("127.0.0.1", 7011),
        state,
    )
    .with_poller_config(lazy);
    client.connect(Duration::from_secs(2)).unwrap();
    // Let both loops back off to their longest wait.
    thread::sleep(Duration::from_millis(500));

    let mut worst = Duration::ZERO;
    for _ in 0..10 {
        let started = Instant::now();
        assert!(client.send(0, b"tick", true) >= 0);
        worst = worst.max(started.elapsed());
        thread::sleep(Duration::from_millis(15));
    }

    assert!(worst < Duration::from_millis(50), "send blocked for {:?}", worst);
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 10));
    client.stop();
    client.wait().unwrap();
    shutdown(&server, handle);
}

#[test]
fn test_send_after_disconnect_is_rejected() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7002, state);
    let peers = track_connects(&server);
    let errors = track_errors(server.events());
    let handle = server.serve_in_background().unwrap();

    let clients: Vec<_> = (0..3).map(|_| connect_client(&network, 7002, state)).collect();
    assert!(wait_until(|| peers.lock().unwrap().len() == 3));
    let connected = peers.lock().unwrap().clone();

    let session = server.session();
    session.disconnect(connected[0], 1).unwrap();
    session.disconnect_now(connected[1], 2).unwrap();
    session.disconnect_later(connected[2], 3).unwrap();

    for peer in &connected {
        assert!(session.peer(*peer).is_none());
        assert!(session.send(*peer, 0, b"late", true) < 0);
    }
    let not_connected = errors
        .lock()
        .unwrap()
        .iter()
        .filter(|err| **err == ErrorKind::NotConnected)
        .count();
    assert_eq!(not_connected, 3);

    // Every client learns that the server let it go.
    for client in &clients {
        assert!(wait_until(|| client.server_peer().is_none()));
        assert!(client.send(0, b"x", true) < 0);
        client.stop();
        client.wait().unwrap();
    }
    shutdown(&server, handle);
}

#[test]
fn test_broadcast_isolates_failed_peer() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7003, state);
    let received = Arc::new(AtomicUsize::new(0));
    let handle = server.serve_in_background().unwrap();

    let clients: Vec<_> = (0..3).map(|_| connect_client(&network, 7003, state)).collect();
    for client in &clients {
        let counter = received.clone();
        client.events().on_receive(move |_, _, payload| {
            assert_eq!(payload, b"state");
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(|| server.session().connected_peers().len() == 3));

    // The first client vanishes without telling the server.
    clients[0].stop();
    clients[0].wait().unwrap();
    clients[0].session().destroy();

    let report = server.broadcast(1, b"state", true);
    assert_eq!(report.attempted, 3);
    assert_eq!(report.failed.len(), 1);
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 2));

    for client in &clients[1..] {
        client.stop();
        client.wait().unwrap();
    }
    shutdown(&server, handle);
}

#[test]
fn test_port_in_use_is_reported_before_binding() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = ServerSession::with_init_state(
        LoopbackEngine::new(&network),
        SessionConfig::server("127.0.0.1", 7004),
        state,
    )
    .with_port_probe(|_: &str, port: u16| port != 7004);
    let errors = track_errors(server.events());

    let expected = ErrorKind::PortInUse { address: "127.0.0.1".into(), port: 7004 };
    assert_eq!(server.start(), Err(expected.clone()));
    assert_eq!(network.host_count(), 0);
    assert_eq!(state.count(), 0);
    assert_eq!(errors.lock().unwrap().as_slice(), &[expected]);
}

#[test]
fn test_udp_probe_detects_bound_socket() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    let network = LoopbackNetwork::new();

    let result = ServerSession::with_init_state(
        LoopbackEngine::new(&network),
        SessionConfig::server("127.0.0.1", port),
        init_state(),
    )
    .start();

    assert_eq!(result, Err(ErrorKind::PortInUse { address: "127.0.0.1".into(), port }));
    assert_eq!(network.host_count(), 0);
}

#[test]
fn test_ready_is_published_once() {
    let network = LoopbackNetwork::new();
    let server = start_server(&network, 7005, init_state());
    let readies = Arc::new(AtomicUsize::new(0));
    let counter = readies.clone();
    server.events().on_ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(readies.load(Ordering::SeqCst), 0);

    let handle = server.serve_in_background().unwrap();
    assert!(wait_until(|| readies.load(Ordering::SeqCst) == 1));
    server.stop();
    handle.join().unwrap();

    // Restarting the loop does not announce readiness again.
    let handle = server.serve_in_background().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(readies.load(Ordering::SeqCst), 1);
    shutdown(&server, handle);
}

#[test]
fn test_zero_timeout_connect_serves_until_stopped() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7006, state);
    let handle = server.serve_in_background().unwrap();

    let client = ClientSession::with_init_state(
        LoopbackEngine::new(&network),
        SessionConfig::client("127.0.0.1", 7006),
        state,
    );
    let control = client.poller_control();
    client.events().on_connect(move |_| control.stop());

    let runner = client.clone();
    let serving = thread::spawn(move || runner.connect(Duration::ZERO));
    assert_eq!(serving.join().unwrap(), Ok(()));
    assert!(client.is_connected());

    shutdown(&server, handle);
}

#[test]
fn test_panicking_subscriber_does_not_stop_serving() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7007, state);
    let received = Arc::new(AtomicUsize::new(0));
    server.events().on_receive(|_, _, payload| {
        if payload == b"boom" {
            panic!("subscriber failure");
        }
    });
    let counter = received.clone();
    server.events().on_receive(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let handle = server.serve_in_background().unwrap();

    let client = connect_client(&network, 7007, state);
    client.send(0, b"boom", true);
    client.send(0, b"fine", true);

    assert!(wait_until(|| received.load(Ordering::SeqCst) == 2));
    assert!(server.is_serving());
    assert_eq!(server.events().panic_count(), 1);

    client.stop();
    client.wait().unwrap();
    shutdown(&server, handle);
}

#[test]
fn test_late_disconnect_is_counted_as_stale() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7008, state);
    let handle = server.serve_in_background().unwrap();
    let client = connect_client(&network, 7008, state);
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    client.events().on_disconnect(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    client.disconnect(0).unwrap();
    assert_eq!(client.server_peer(), None);
    assert!(wait_until(|| client.session().stale_event_count() == 1));
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert!(wait_until(|| server.session().connected_peers().is_empty()));

    client.stop();
    client.wait().unwrap();
    shutdown(&server, handle);
}

#[test]
fn test_sessions_share_engine_initialization() {
    let network = LoopbackNetwork::new();
    let state = init_state();
    let server = start_server(&network, 7009, state);
    let handle = server.serve_in_background().unwrap();
    let client = connect_client(&network, 7009, state);
    assert_eq!(state.count(), 2);

    client.stop();
    client.wait().unwrap();
    client.session().deinitialize();
    assert_eq!(state.count(), 1);

    shutdown(&server, handle);
    assert_eq!(state.count(), 0);
    assert_eq!(network.host_count(), 0);
}
