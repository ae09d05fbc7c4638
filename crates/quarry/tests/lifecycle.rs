//! Connection lifecycle: close semantics, dial failures, reconnection.

use std::time::{Duration, Instant};

use quarry::{handler_fn, AccessMode, Config, ConnectionEvent, Error, Timeout, Transport};

fn unique_channel(tag: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "l{}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed),
        tag
    )
}

const DIAL: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_close_fails_outstanding_invocations() {
    let transport = Transport::new(unique_channel("pending"), Config::default()).unwrap();
    let (acceptor, _servers) = transport
        .bind(handler_fn(|x: i64| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(x)
        }))
        .unwrap();
    let mut accepted = acceptor.on_accepted();

    let client = transport.connect(DIAL).await.unwrap();
    let server = accepted.recv().await.unwrap();

    const K: usize = 8;
    let mut calls = Vec::new();
    for i in 0..K as i64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.invoke::<i64, i64>(i, Timeout::Never).await
        }));
    }

    // Wait for all K to reach the handler.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.inflight() < K {
        assert!(Instant::now() < deadline, "handlers never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    server.close().await;

    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(Error::ComponentClosed)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_with_a_single_notification() {
    let transport = Transport::new(unique_channel("idem"), Config::default()).unwrap();
    let (_acceptor, _servers) = transport
        .bind(handler_fn(|x: i64| async move { Ok(x) }))
        .unwrap();

    let client = transport.connect(DIAL).await.unwrap();
    let mut closed = client.on_closed();

    client.close();
    client.close();
    client.closed().await;

    assert_eq!(closed.recv().await, Some(()));
    assert!(closed.try_recv().is_err(), "second Closed notification");
    assert!(matches!(
        client.invoke::<i64, i64>(1, Timeout::Default).await,
        Err(Error::ComponentClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_is_idempotent() {
    let transport = Transport::new(unique_channel("srvidem"), Config::default()).unwrap();
    let (acceptor, _servers) = transport
        .bind(handler_fn(|x: i64| async move { Ok(x) }))
        .unwrap();
    let mut accepted = acceptor.on_accepted();

    let _client = transport.connect(DIAL).await.unwrap();
    let server = accepted.recv().await.unwrap();
    let mut closed = server.on_closed();

    server.close().await;
    server.close().await;

    assert_eq!(closed.recv().await, Some(()));
    assert!(closed.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_times_out_without_listener() {
    let transport = Transport::new(unique_channel("notimeo"), Config::default()).unwrap();
    let start = Instant::now();
    let outcome = transport.connect(Duration::from_millis(100)).await;
    assert!(matches!(outcome, Err(Error::ConnectTimeout)));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_refused_after_acceptor_shutdown() {
    let transport = Transport::new(unique_channel("refused"), Config::default()).unwrap();
    let (acceptor, _servers) = transport
        .bind(handler_fn(|x: i64| async move { Ok(x) }))
        .unwrap();

    acceptor.shut_down();
    assert!(matches!(
        transport.connect(Duration::from_millis(500)).await,
        Err(Error::ConnectRefused)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accessor_reconnects_after_server_close() {
    let config = Config {
        reconnect_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let transport = Transport::new(unique_channel("reconn"), config).unwrap();
    let (_acceptor, servers) = transport
        .bind(handler_fn(|x: i64| async move { Ok(x) }))
        .unwrap();

    let accessor = transport.client_accessor(AccessMode::Blocking);
    let first = accessor.client().await.unwrap();
    assert_eq!(first.invoke::<i64, i64>(1, Timeout::Default).await.unwrap(), 1);
    let mut events = accessor.on_event();

    // Kill the server side; the accessor must notice and redial the
    // still-listening acceptor.
    let server = loop {
        if let Some(server) = servers.snapshot().pop() {
            break server;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    server.close().await;

    let mut saw_disconnect = false;
    let deadline = Duration::from_secs(5);
    loop {
        match tokio::time::timeout(deadline, events.recv()).await {
            Ok(Some(ConnectionEvent::Disconnected)) => saw_disconnect = true,
            Ok(Some(ConnectionEvent::Connected)) => break,
            Ok(Some(ConnectionEvent::Error(_))) => {}
            other => panic!("event stream ended: {other:?}"),
        }
    }
    assert!(saw_disconnect, "Connected fired without a Disconnected first");

    let second = accessor.client().await.unwrap();
    assert_eq!(second.invoke::<i64, i64>(2, Timeout::Default).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonblocking_accessor_fails_fast() {
    let transport = Transport::new(unique_channel("fastfail"), Config::default()).unwrap();
    let accessor = transport.client_accessor(AccessMode::NonBlocking);
    assert!(matches!(accessor.client().await, Err(Error::NotConnected)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn servers_accessor_tracks_the_live_set() {
    let transport = Transport::new(unique_channel("set"), Config::default()).unwrap();
    let (_acceptor, servers) = transport
        .bind(handler_fn(|x: i64| async move { Ok(x) }))
        .unwrap();

    let a = transport.connect(DIAL).await.unwrap();
    let b = transport.connect(DIAL).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while servers.len() < 2 {
        assert!(Instant::now() < deadline, "accepted set never reached 2");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    a.close();
    while servers.len() > 1 {
        assert!(Instant::now() < deadline, "closed server never left the set");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(b.invoke::<i64, i64>(9, Timeout::Default).await.unwrap(), 9);
}
