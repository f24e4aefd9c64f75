//! Lifecycle integration tests: inactivity teardown, stop/join bounds,
//! session replacement, and restartability.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxy_server::{HostHooks, ProxyServer};
use proxy_tests::{bind_ephemeral, build_wire, init_logging, recv_datagram, test_config};
use tokio::time::Instant;

const RECV_WAIT: Duration = Duration::from_secs(2);

/// With no client traffic past the idle window, the listener loop
/// exits on its own: disconnect fires, sockets close, and the server
/// reports not-running, and can then be started again.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inactivity_tears_down_and_allows_restart() -> anyhow::Result<()> {
    init_logging();

    let (upstream, upstream_addr) = bind_ephemeral().await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hooks = HostHooks {
        on_disconnect: Some(Arc::new({
            let disconnects = disconnects.clone();
            move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..Default::default()
    };

    let mut conf = test_config(upstream_addr);
    conf.idle_timeout_ms = 300;
    let server = ProxyServer::new(conf, hooks);
    let mitm = server.start().await?;

    let (client, _) = bind_ephemeral().await;
    client
        .send_to(&build_wire(*b"ABC", b"hello"), mitm.server_addr)
        .await?;
    recv_datagram(&upstream, RECV_WAIT)
        .await
        .expect("session not established");
    assert!(server.is_connected());

    // Now stay silent and wait for the idle exit.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.is_running() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!server.is_running(), "idle session should tear the run down");
    assert!(!server.is_connected());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // The server is reusable after a self-initiated exit.
    let mitm2 = server.start().await?;
    assert!(mitm2.server_addr.ip().is_loopback());
    assert!(server.is_running());
    server.stop().await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);

    Ok(())
}

/// `stop` joins both loops well within the deadline bound and leaves
/// the server reusable.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_joins_all_loops_quickly() -> anyhow::Result<()> {
    init_logging();

    let (upstream, upstream_addr) = bind_ephemeral().await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hooks = HostHooks {
        on_disconnect: Some(Arc::new({
            let disconnects = disconnects.clone();
            move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        })),
        ..Default::default()
    };
    let server = ProxyServer::new(test_config(upstream_addr), hooks);
    let mitm = server.start().await?;

    // Bring up a full session so both loops are live.
    let (client, _) = bind_ephemeral().await;
    client
        .send_to(&build_wire(*b"ABC", b"hello"), mitm.server_addr)
        .await?;
    recv_datagram(&upstream, RECV_WAIT)
        .await
        .expect("session not established");

    let started = Instant::now();
    server.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        started.elapsed()
    );
    assert!(!server.is_running());
    assert!(!server.is_connected());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // Idempotent.
    server.stop().await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // Injection is a no-op once stopped.
    let api = server.script_api();
    api.inject_recv(b"late".to_vec());
    assert!(recv_datagram(&client, Duration::from_millis(300)).await.is_none());

    Ok(())
}

/// A datagram from a new source address tears down the existing session
/// and binds a fresh one; traffic from the new client keeps flowing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_client_address_replaces_session() -> anyhow::Result<()> {
    init_logging();

    let (upstream, upstream_addr) = bind_ephemeral().await;
    let connects: Arc<Mutex<Vec<SocketAddr>>> = Arc::new(Mutex::new(Vec::new()));
    let hooks = HostHooks {
        on_connect: Some(Arc::new({
            let connects = connects.clone();
            move |addr| connects.lock().unwrap().push(addr)
        })),
        ..Default::default()
    };
    let server = ProxyServer::new(test_config(upstream_addr), hooks);
    let mitm = server.start().await?;

    let (client_a, addr_a) = bind_ephemeral().await;
    client_a
        .send_to(&build_wire(*b"ABC", b"first"), mitm.server_addr)
        .await?;
    let (got, from_a) = recv_datagram(&upstream, RECV_WAIT)
        .await
        .expect("first client's datagram should arrive");
    assert_eq!(got, build_wire(*b"ABC", b"first"));

    let (client_b, addr_b) = bind_ephemeral().await;
    client_b
        .send_to(&build_wire(*b"DEF", b"second"), mitm.server_addr)
        .await?;
    let (got, from_b) = recv_datagram(&upstream, RECV_WAIT)
        .await
        .expect("second client's datagram should arrive");
    assert_eq!(got, build_wire(*b"DEF", b"second"));

    // One session at a time: the old upstream socket was closed, so the
    // second datagram arrives from a fresh local port.
    assert_ne!(from_a, from_b);
    assert!(server.is_connected());
    {
        let connects = connects.lock().unwrap();
        assert_eq!(connects.as_slice(), &[addr_a, addr_b]);
    }

    server.stop().await;
    Ok(())
}
