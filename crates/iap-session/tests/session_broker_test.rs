//! SessionBroker on top of a real TunnelBroker and the simulated relay

use iap_auth::async_trait;
use iap_auth::testing::TestCredentials;
use iap_relay::{ReconnectConfig, RelayOptions};
use iap_session::{
    Credential, CredentialIssuer, IssueError, RdpCredential, Secret, SessionBroker, SessionContext,
    SessionEndReason, SessionError, SessionEvent, SessionProtocol, SshCredential,
};
use iap_transport::testing::{eventually, instance, SimulatedProxy};
use iap_tunnel::{DefaultPolicyProvider, TunnelBroker, TunnelError, TunnelSettings};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
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

/// Issues a credential per call, or the next scripted outcome
#[derive(Default)]
struct FakeIssuer {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Credential, IssueError>>>,
}

impl FakeIssuer {
    fn scripted(outcomes: Vec<Result<Credential, IssueError>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(outcomes.into()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialIssuer for FakeIssuer {
    async fn issue(&self, context: &SessionContext) -> Result<Credential, IssueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            return outcome;
        }

        let username = context.username.clone().unwrap_or_else(|| "tester".to_string());
        Ok(match context.protocol {
            SessionProtocol::Rdp => Credential::Rdp(RdpCredential {
                username,
                password: Secret::new("generated-password"),
                domain: None,
            }),
            SessionProtocol::Ssh => Credential::Ssh(SshCredential {
                username,
                public_key: "ssh-ed25519 AAAA tester".to_string(),
                private_key: Secret::new("private"),
                expires_at: None,
            }),
        })
    }
}

struct Harness {
    proxy: SimulatedProxy,
    issuer: Arc<FakeIssuer>,
    credentials: Arc<TestCredentials>,
    broker: SessionBroker,
}

fn harness_with(issuer: Arc<FakeIssuer>, credentials: Arc<TestCredentials>) -> Harness {
    let proxy = SimulatedProxy::start();
    let tunnels = TunnelBroker::new(
        Arc::new(proxy.connector()),
        credentials.clone(),
        TunnelSettings::default().with_relay(fast_options()),
    );
    let broker = SessionBroker::new(
        tunnels,
        Arc::new(DefaultPolicyProvider::default()),
        issuer.clone(),
    );
    Harness {
        proxy,
        issuer,
        credentials,
        broker,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(FakeIssuer::default()), TestCredentials::new("token"))
}

fn rdp(name: &str) -> SessionContext {
    SessionContext::new(instance(name), SessionProtocol::Rdp)
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no session event")
        .unwrap()
}

#[tokio::test]
async fn test_try_activate_returns_existing_session() {
    let h = harness();
    let mut events = h.broker.subscribe();

    let session = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Created(_)));

    let activated = h.broker.try_activate(&instance("instance-1")).unwrap();
    assert!(Arc::ptr_eq(&activated, &session));
    match next_event(&mut events).await {
        SessionEvent::Activated(info) => assert_eq!(info.id, session.id()),
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(h.proxy.connects().len(), 1);
    assert_eq!(h.issuer.calls(), 1);
    assert!(h.broker.try_activate(&instance("instance-2")).is_none());
}

#[tokio::test]
async fn test_create_for_live_session_activates_it() {
    let h = harness();
    let cancel = CancellationToken::new();

    let first = h.broker.create_session(rdp("instance-1"), &cancel).await.unwrap();
    let second = h.broker.create_session(rdp("instance-1"), &cancel).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.broker.sessions().len(), 1);
    assert_eq!(h.issuer.calls(), 1);
    assert_eq!(h.proxy.connects().len(), 1);
}

#[tokio::test]
async fn test_ssh_session_uses_port_22() {
    let h = harness();

    let context = SessionContext::new(instance("instance-1"), SessionProtocol::Ssh)
        .with_username("alice");
    let session = h
        .broker
        .create_session(context, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.proxy.connects()[0].destination.port, 22);
    assert!(session.local_endpoint().ip().is_loopback());
    assert_eq!(session.credential().username(), "alice");
    assert!(matches!(session.credential(), Credential::Ssh(_)));
}

#[tokio::test]
async fn test_issuance_failure_releases_the_tunnel() {
    let h = harness_with(
        FakeIssuer::scripted(vec![Err(IssueError::Denied("not an admin".into()))]),
        TestCredentials::new("token"),
    );

    let err = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SessionError::Credential(IssueError::Denied("not an admin".into()))
    );

    assert!(h.broker.sessions().is_empty());
    assert!(h.broker.tunnels().tunnels().is_empty());
    assert!(eventually(|| h.proxy.closes().len() == 1).await);

    // The instance is free for another attempt
    let session = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(session.is_active());
}

#[tokio::test]
async fn test_expired_issuer_grant_is_reauthorized_once() {
    let h = harness_with(
        FakeIssuer::scripted(vec![Err(IssueError::Unauthorized("token expired".into()))]),
        TestCredentials::rotating("token", &["token-2"]),
    );

    let session = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.is_active());
    assert_eq!(h.credentials.reauthorizations(), 1);
    assert_eq!(h.issuer.calls(), 2);
}

#[tokio::test]
async fn test_declined_reauthorization_fails_and_releases() {
    let h = harness_with(
        FakeIssuer::scripted(vec![Err(IssueError::Unauthorized("token expired".into()))]),
        TestCredentials::new("token"),
    );

    let err = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::ReauthDeclined);
    assert_eq!(h.issuer.calls(), 1);
    assert!(h.broker.tunnels().tunnels().is_empty());
}

#[tokio::test]
async fn test_end_session_releases_the_tunnel() {
    let h = harness();
    let mut events = h.broker.subscribe();

    let session = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap();
    next_event(&mut events).await;

    assert!(
        h.broker
            .end_session(&instance("instance-1"), SessionEndReason::ClosedByUser)
            .await
    );

    match next_event(&mut events).await {
        SessionEvent::Ended { id, reason, .. } => {
            assert_eq!(id, session.id());
            assert_eq!(reason, SessionEndReason::ClosedByUser);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!session.is_active());
    assert!(session.tunnel().is_closed());
    assert!(h.broker.sessions().is_empty());
    assert!(h.broker.try_activate(&instance("instance-1")).is_none());
}

#[tokio::test]
async fn test_session_close_ends_it() {
    let h = harness();

    let session = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap();
    session.close().await;

    assert!(h.broker.sessions().is_empty());
    assert!(session.tunnel().is_closed());
}

#[tokio::test]
async fn test_relay_failure_ends_the_session() {
    let h = harness();
    let mut events = h.broker.subscribe();

    let session = h
        .broker
        .create_session(rdp("instance-1"), &CancellationToken::new())
        .await
        .unwrap();
    next_event(&mut events).await;

    h.proxy.forget_sessions();
    h.proxy.drop_links();

    tokio::time::timeout(Duration::from_secs(5), session.ended())
        .await
        .expect("session outlived its relay");

    match next_event(&mut events).await {
        SessionEvent::Ended { reason, .. } => {
            assert!(matches!(reason, SessionEndReason::TunnelFailed(_)))
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.broker.sessions().is_empty());
    assert!(eventually(|| h.broker.tunnels().tunnels().is_empty()).await);
}

#[tokio::test]
async fn test_shutdown_ends_every_session() {
    let h = harness();
    let cancel = CancellationToken::new();

    let one = h.broker.create_session(rdp("instance-1"), &cancel).await.unwrap();
    let two = h
        .broker
        .create_session(
            SessionContext::new(instance("instance-2"), SessionProtocol::Ssh),
            &cancel,
        )
        .await
        .unwrap();

    h.broker.shutdown().await;

    assert!(!one.is_active());
    assert!(!two.is_active());
    assert!(h.broker.sessions().is_empty());
    assert!(h.broker.tunnels().tunnels().is_empty());
    assert_eq!(
        h.broker.create_session(rdp("instance-1"), &cancel).await.unwrap_err(),
        SessionError::Tunnel(TunnelError::ShutDown)
    );
}
