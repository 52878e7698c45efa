//! TunnelBroker end to end: sharing, reference counting, local sockets and
//! teardown, with the simulated relay echoing every byte

use iap_auth::testing::TestCredentials;
use iap_proto::{ConnectionLimitClass, RejectCode, RelayPolicy};
use iap_relay::{ReconnectConfig, RelayError, RelayOptions};
use iap_transport::testing::{destination, eventually, SimulatedProxy};
use iap_transport::MemoryConnector;
use iap_tunnel::{BrokerEvent, TunnelBroker, TunnelError, TunnelFingerprint, TunnelSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn fast_options() -> RelayOptions {
    RelayOptions::default()
        .with_connect_timeout(Duration::from_secs(5))
        .with_keep_alive(None)
        .with_reconnect(ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: Some(5),
        })
}

fn settings() -> TunnelSettings {
    TunnelSettings::default().with_relay(fast_options())
}

fn broker(proxy: &SimulatedProxy, settings: TunnelSettings) -> TunnelBroker {
    TunnelBroker::new(
        Arc::new(proxy.connector()),
        TestCredentials::new("token"),
        settings,
    )
}

async fn echo(socket: &mut TcpStream, message: &[u8]) {
    socket.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut buf))
        .await
        .expect("no echo through the tunnel")
        .unwrap();
    assert_eq!(buf, message);
}

async fn port_is_closed(addr: SocketAddr) -> bool {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_concurrent_requests_share_one_tunnel() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .get_or_create(
                        destination("instance-1", 3389),
                        RelayPolicy::default(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    let first = handles[0].tunnel().clone();
    assert!(handles.iter().all(|h| Arc::ptr_eq(h.tunnel(), &first)));
    assert_eq!(first.ref_count(), 16);
    assert_eq!(proxy.connects().len(), 1);
    assert_eq!(broker.tunnels().len(), 1);

    for handle in handles {
        broker.release(handle).await;
    }
    assert!(first.is_closed());
}

#[tokio::test]
async fn test_torn_down_only_after_last_release() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());
    let mut events = broker.subscribe();

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(
            broker
                .get_or_create(
                    destination("instance-1", 22),
                    RelayPolicy::default(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap(),
        );
    }
    let tunnel = handles[0].tunnel().clone();
    assert!(matches!(events.recv().await.unwrap(), BrokerEvent::TunnelOpened(_)));

    broker.release(handles.pop().unwrap()).await;
    broker.release(handles.pop().unwrap()).await;
    assert!(!tunnel.is_closed());
    assert_eq!(tunnel.ref_count(), 1);
    assert_eq!(broker.tunnels()[0].ref_count, 1);

    broker.release(handles.pop().unwrap()).await;
    assert!(tunnel.is_closed());
    assert!(broker.tunnels().is_empty());

    match events.recv().await.unwrap() {
        BrokerEvent::TunnelClosed { id, .. } => assert_eq!(id, tunnel.id()),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(eventually(|| proxy.closes().len() == 1).await);
}

#[tokio::test]
async fn test_two_requests_share_a_port_and_releasing_both_drops_it() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        broker.get_or_create(destination("instance-1", 3389), RelayPolicy::default(), &cancel),
        broker.get_or_create(destination("instance-1", 3389), RelayPolicy::default(), &cancel),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let endpoint = a.local_endpoint();
    assert_eq!(endpoint, b.local_endpoint());
    assert!(endpoint.ip().is_loopback());

    let mut socket = TcpStream::connect(endpoint).await.unwrap();
    echo(&mut socket, b"mstsc says hello").await;
    drop(socket);

    broker.release(a).await;
    let mut socket = TcpStream::connect(endpoint).await.unwrap();
    echo(&mut socket, b"still here").await;
    drop(socket);

    broker.release(b).await;
    assert!(port_is_closed(endpoint).await);
    assert_eq!(proxy.connects().len(), 1);
}

#[tokio::test]
async fn test_half_closed_socket_still_gets_the_reply() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());

    let handle = broker
        .get_or_create(
            destination("instance-1", 22),
            RelayPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut socket = TcpStream::connect(handle.local_endpoint()).await.unwrap();
    let request = vec![42u8; 100_000];
    socket.write_all(&request).await.unwrap();
    socket.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut reply))
        .await
        .expect("reply never finished")
        .unwrap();
    assert_eq!(reply, request);

    assert!(eventually(|| handle.tunnel().active_connections() == 0).await);
    broker.release(handle).await;
}

#[tokio::test]
async fn test_policies_do_not_share_tunnels() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());
    let cancel = CancellationToken::new();

    let interactive = broker
        .get_or_create(destination("instance-1", 22), RelayPolicy::default(), &cancel)
        .await
        .unwrap();
    let bulk = broker
        .get_or_create(
            destination("instance-1", 22),
            RelayPolicy::default().with_connection_limit_class(ConnectionLimitClass::Bulk),
            &cancel,
        )
        .await
        .unwrap();

    assert_ne!(interactive.local_endpoint(), bulk.local_endpoint());
    assert_eq!(broker.tunnels().len(), 2);
    assert_eq!(proxy.connects().len(), 2);
    assert_eq!(
        proxy.connects()[1].policy.connection_limit_class,
        ConnectionLimitClass::Bulk
    );

    let fingerprint = TunnelFingerprint::new(destination("instance-1", 22), RelayPolicy::default());
    assert_eq!(broker.local_endpoint(&fingerprint), Some(interactive.local_endpoint()));
}

#[tokio::test]
async fn test_connection_limit_refuses_extra_sockets() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings().with_max_local_connections(1));

    let handle = broker
        .get_or_create(
            destination("instance-1", 3389),
            RelayPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let endpoint = handle.local_endpoint();

    let mut first = TcpStream::connect(endpoint).await.unwrap();
    echo(&mut first, b"first").await;

    let mut second = TcpStream::connect(endpoint).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("refused socket was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(eventually(|| handle.tunnel().refused_connections() == 1).await);
    assert_eq!(handle.tunnel().active_connections(), 1);

    echo(&mut first, b"unaffected").await;
}

#[tokio::test]
async fn test_grace_period_keeps_tunnel_warm() {
    let proxy = SimulatedProxy::start();
    let broker = broker(
        &proxy,
        settings().with_idle_grace_period(Duration::from_millis(300)),
    );
    let cancel = CancellationToken::new();

    let handle = broker
        .get_or_create(destination("instance-1", 22), RelayPolicy::default(), &cancel)
        .await
        .unwrap();
    let tunnel = handle.tunnel().clone();
    broker.release(handle).await;

    // Picked up again inside the grace period
    let handle = broker
        .get_or_create(destination("instance-1", 22), RelayPolicy::default(), &cancel)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(handle.tunnel(), &tunnel));
    assert_eq!(proxy.connects().len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!tunnel.is_closed());

    broker.release(handle).await;
    assert!(!tunnel.is_closed());

    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .expect("idle tunnel was never torn down");
    assert!(eventually(|| broker.tunnels().is_empty()).await);
}

#[tokio::test]
async fn test_dropped_handle_releases_the_tunnel() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());

    let handle = broker
        .get_or_create(
            destination("instance-1", 22),
            RelayPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let tunnel = handle.tunnel().clone();
    drop(handle);

    tokio::time::timeout(Duration::from_secs(5), tunnel.closed())
        .await
        .expect("dropped handle did not release the tunnel");
}

#[tokio::test]
async fn test_failed_creation_is_shared_with_waiters() {
    let proxy = SimulatedProxy::start();
    proxy.reject_next([RejectCode::Forbidden]);
    let broker = broker(&proxy, settings());

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .get_or_create(
                        destination("instance-1", 3389),
                        RelayPolicy::default(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Relay(RelayError::Denied {
                credential_expired: false,
                ..
            })
        ));
    }
    assert_eq!(proxy.connects().len(), 1);

    // A later request tries again
    let handle = broker
        .get_or_create(
            destination("instance-1", 3389),
            RelayPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
    assert!(handle.is_ok());
    assert_eq!(proxy.connects().len(), 2);
}

#[tokio::test]
async fn test_cancelled_creation_leaves_nothing_registered() {
    // Nobody answers the handshake
    let (connector, _acceptor) = MemoryConnector::pair();
    let broker = TunnelBroker::new(Arc::new(connector), TestCredentials::new("token"), settings());
    let cancel = CancellationToken::new();

    let canceller = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });

    let err = broker
        .get_or_create(destination("instance-1", 3389), RelayPolicy::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, TunnelError::Relay(RelayError::Cancelled));
    canceller.await.unwrap();

    assert!(broker.tunnels().is_empty());
    let fingerprint = TunnelFingerprint::new(destination("instance-1", 3389), RelayPolicy::default());
    assert!(broker.local_endpoint(&fingerprint).is_none());
}

#[tokio::test]
async fn test_failed_tunnel_is_replaced() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());
    let cancel = CancellationToken::new();

    let stale = broker
        .get_or_create(destination("instance-1", 22), RelayPolicy::default(), &cancel)
        .await
        .unwrap();

    proxy.forget_sessions();
    proxy.drop_links();
    assert!(eventually(|| !stale.is_healthy()).await);

    let fresh = broker
        .get_or_create(destination("instance-1", 22), RelayPolicy::default(), &cancel)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(fresh.tunnel(), stale.tunnel()));
    assert!(stale.tunnel().is_closed());
    assert_eq!(proxy.connects().len(), 2);

    // Releasing the evicted tunnel's handle leaves the new one alone
    broker.release(stale).await;
    assert!(fresh.is_healthy());
    assert_eq!(broker.tunnels().len(), 1);
}

#[tokio::test]
async fn test_expired_grant_is_reauthorized_once() {
    let proxy = SimulatedProxy::start();
    proxy.expire_token("first");
    let credentials = TestCredentials::rotating("first", &["second"]);
    let broker = TunnelBroker::new(Arc::new(proxy.connector()), credentials.clone(), settings());

    let handle = broker
        .get_or_create(
            destination("instance-1", 3389),
            RelayPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(handle.is_healthy());
    assert_eq!(credentials.reauthorizations(), 1);
    assert_eq!(proxy.connects().len(), 2);
}

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let proxy = SimulatedProxy::start();
    let broker = broker(&proxy, settings());
    let cancel = CancellationToken::new();

    let rdp = broker
        .get_or_create(destination("instance-1", 3389), RelayPolicy::default(), &cancel)
        .await
        .unwrap();
    let ssh = broker
        .get_or_create(destination("instance-2", 22), RelayPolicy::default(), &cancel)
        .await
        .unwrap();

    broker.shutdown().await;

    assert!(rdp.tunnel().is_closed());
    assert!(ssh.tunnel().is_closed());
    assert!(broker.tunnels().is_empty());
    assert_eq!(
        broker
            .get_or_create(destination("instance-1", 3389), RelayPolicy::default(), &cancel)
            .await
            .unwrap_err(),
        TunnelError::ShutDown
    );
}
