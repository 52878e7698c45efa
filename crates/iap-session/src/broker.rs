//! At most one interactive session per instance
//!
//! A session is a tunnel reference plus the credential the RDP or SSH client
//! logs in with. Asking for a session to an instance that already has one
//! brings the existing session forward instead of opening a second tunnel.

use crate::error::SessionError;
use crate::issuer::{Credential, CredentialIssuer, IssueError};
use crate::session::{Session, SessionContext, SessionEndReason, SessionInfo};
use iap_tunnel::{InstanceLocator, PolicyProvider, TunnelBroker, TunnelError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Session lifecycle notifications
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created(SessionInfo),
    /// An existing session was asked for again and should come to the front
    Activated(SessionInfo),
    Ended {
        id: Uuid,
        instance: InstanceLocator,
        reason: SessionEndReason,
    },
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<InstanceLocator, Arc<Session>>,
    connecting: HashSet<InstanceLocator>,
}

struct BrokerInner {
    tunnels: TunnelBroker,
    policies: Arc<dyn PolicyProvider>,
    issuer: Arc<dyn CredentialIssuer>,
    registry: Mutex<Registry>,
    shut_down: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

/// Creates, activates and ends sessions
#[derive(Clone)]
pub struct SessionBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("SessionBroker")
            .field("sessions", &registry.sessions.len())
            .field("connecting", &registry.connecting.len())
            .finish()
    }
}

impl SessionBroker {
    pub fn new(
        tunnels: TunnelBroker,
        policies: Arc<dyn PolicyProvider>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                tunnels,
                policies,
                issuer,
                registry: Mutex::new(Registry::default()),
                shut_down: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn tunnels(&self) -> &TunnelBroker {
        &self.inner.tunnels
    }

    /// Bring an existing session forward, if the instance has one
    pub fn try_activate(&self, instance: &InstanceLocator) -> Option<Arc<Session>> {
        let session = self.inner.live_session(instance)?;
        debug!(session_id = %session.id(), "Activating session to {}", instance);
        self.inner.emit(SessionEvent::Activated(session.info()));
        Some(session)
    }

    /// Open a tunnel and issue a credential for a new session
    ///
    /// Returns the live session instead when the instance already has one.
    pub async fn create_session(
        &self,
        context: SessionContext,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>, SessionError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::Tunnel(TunnelError::ShutDown));
        }

        let instance = context.instance.clone();
        if let Some(session) = inner.begin_connecting(&instance)? {
            debug!(session_id = %session.id(), "Session to {} already open", instance);
            inner.emit(SessionEvent::Activated(session.info()));
            return Ok(session);
        }
        let _connecting = ConnectingGuard {
            inner,
            instance: &instance,
        };

        info!("Connecting {} session to {}", context.protocol, instance);

        let destination = context.destination();
        let policy = inner.policies.relay_policy(&destination);
        let handle = inner
            .tunnels
            .get_or_create(destination, policy, cancel)
            .await?;

        let credential = match inner.issue(&context, cancel).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Could not issue credential for {}: {}", instance, e);
                inner.tunnels.release(handle).await;
                return Err(e.into());
            }
        };

        if inner.shut_down.load(Ordering::SeqCst) {
            inner.tunnels.release(handle).await;
            return Err(SessionError::Tunnel(TunnelError::ShutDown));
        }

        let session = Arc::new(Session::new(context, credential, handle));
        inner
            .registry()
            .sessions
            .insert(instance.clone(), session.clone());

        tokio::spawn(monitor(self.inner.clone(), session.clone()));

        info!(
            session_id = %session.id(),
            local_endpoint = %session.local_endpoint(),
            "{} session to {} ready",
            session.protocol(),
            instance
        );
        inner.emit(SessionEvent::Created(session.info()));

        Ok(session)
    }

    /// End the instance's session, returning whether there was one
    pub async fn end_session(&self, instance: &InstanceLocator, reason: SessionEndReason) -> bool {
        let session = self
            .inner
            .registry()
            .sessions
            .get(instance)
            .cloned();

        match session {
            Some(session) => {
                session.request_end(reason);
                session.ended().await;
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .registry()
            .sessions
            .values()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// End every session
    ///
    /// The tunnel broker is left running; it may be shared with other users.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let sessions = self.sessions();
        info!("Ending {} session(s)", sessions.len());

        for session in &sessions {
            session.request_end(SessionEndReason::Shutdown);
        }
        for session in &sessions {
            session.ended().await;
        }
    }
}

impl BrokerInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_session(&self, instance: &InstanceLocator) -> Option<Arc<Session>> {
        self.registry()
            .sessions
            .get(instance)
            .filter(|session| session.is_active())
            .cloned()
    }

    /// Claim the instance for a new session, or hand back its live session
    fn begin_connecting(
        &self,
        instance: &InstanceLocator,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let mut guard = self.registry();
        let registry = &mut *guard;

        if let Some(session) = registry
            .sessions
            .get(instance)
            .filter(|session| session.is_active())
        {
            return Ok(Some(session.clone()));
        }
        if !registry.connecting.insert(instance.clone()) {
            return Err(SessionError::AlreadyConnecting(instance.clone()));
        }
        Ok(None)
    }

    async fn issue(
        &self,
        context: &SessionContext,
        cancel: &CancellationToken,
    ) -> Result<Credential, IssueError> {
        let issuer = self.issuer.as_ref();
        self.tunnels
            .retry_policy()
            .run(cancel, || issuer.issue(context))
            .await
    }

    async fn finish(&self, session: &Arc<Session>, reason: SessionEndReason) {
        session.request_end(reason.clone());
        {
            let mut registry = self.registry();
            let is_current = registry
                .sessions
                .get(session.instance())
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if is_current {
                registry.sessions.remove(session.instance());
            }
        }

        if let Some(handle) = session.take_handle() {
            self.tunnels.release(handle).await;
        }
        session.mark_ended();

        info!(session_id = %session.id(), "Session to {} ended: {}", session.instance(), reason);
        self.emit(SessionEvent::Ended {
            id: session.id(),
            instance: session.instance().clone(),
            reason,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Frees the instance for another create attempt, including when the create
/// future is dropped
struct ConnectingGuard<'a> {
    inner: &'a BrokerInner,
    instance: &'a InstanceLocator,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .registry()
            .connecting
            .remove(self.instance);
    }
}

/// Ends the session when asked to or when its relay goes down
async fn monitor(inner: Arc<BrokerInner>, session: Arc<Session>) {
    let relay = session.tunnel().relay().clone();
    let mut state = relay.watch_state();

    let reason = tokio::select! {
        biased;
        reason = session.end_requested() => reason,
        _ = state.wait_for(|state| state.is_terminal()) => {
            let reason = relay
                .failure()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "relay closed".to_string());
            warn!(session_id = %session.id(), "Tunnel for session to {} went down: {}", session.instance(), reason);
            SessionEndReason::TunnelFailed(reason)
        }
    };

    inner.finish(&session, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::MockCredentialIssuer;
    use crate::session::SessionProtocol;
    use iap_auth::StaticCredentialSource;
    use iap_transport::memory::MemoryConnector;
    use iap_tunnel::{DefaultPolicyProvider, TunnelSettings};
    use std::time::Duration;

    fn context() -> SessionContext {
        SessionContext::new(InstanceLocator::new("proj", "zone-a", "vm-1"), SessionProtocol::Rdp)
    }

    fn tunnels(connector: MemoryConnector) -> TunnelBroker {
        TunnelBroker::new(
            Arc::new(connector),
            Arc::new(StaticCredentialSource::new("token")),
            TunnelSettings::default(),
        )
    }

    fn untouched_issuer() -> Arc<MockCredentialIssuer> {
        let mut issuer = MockCredentialIssuer::new();
        issuer.expect_issue().times(0);
        Arc::new(issuer)
    }

    #[tokio::test]
    async fn test_concurrent_create_for_same_instance_is_refused() {
        // The acceptor never answers, so the first create stays in its handshake
        let (connector, _acceptor) = MemoryConnector::pair();
        let broker = SessionBroker::new(
            tunnels(connector),
            Arc::new(DefaultPolicyProvider::default()),
            untouched_issuer(),
        );

        let cancel = CancellationToken::new();
        let first = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.create_session(context(), &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = broker
            .create_session(context(), &CancellationToken::new())
            .await;
        assert!(matches!(second, Err(SessionError::AlreadyConnecting(_))));

        cancel.cancel();
        let first = first.await.unwrap();
        assert_eq!(first.unwrap_err(), SessionError::Cancelled);

        assert!(broker.sessions().is_empty());
        assert!(broker.tunnels().tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_create_after_shutdown_fails() {
        let (connector, _acceptor) = MemoryConnector::pair();
        let broker = SessionBroker::new(
            tunnels(connector),
            Arc::new(DefaultPolicyProvider::default()),
            untouched_issuer(),
        );

        broker.shutdown().await;

        let result = broker
            .create_session(context(), &CancellationToken::new())
            .await;
        assert_eq!(result.unwrap_err(), SessionError::Tunnel(TunnelError::ShutDown));
    }

    #[tokio::test]
    async fn test_unknown_instance_has_nothing_to_activate_or_end() {
        let (connector, _acceptor) = MemoryConnector::pair();
        let broker = SessionBroker::new(
            tunnels(connector),
            Arc::new(DefaultPolicyProvider::default()),
            untouched_issuer(),
        );
        let instance = context().instance;

        assert!(broker.try_activate(&instance).is_none());
        assert!(!broker.end_session(&instance, SessionEndReason::ClosedByUser).await);
    }

    #[tokio::test]
    async fn test_poisoned_registry_does_not_take_the_broker_down() {
        let (connector, _acceptor) = MemoryConnector::pair();
        let broker = SessionBroker::new(
            tunnels(connector),
            Arc::new(DefaultPolicyProvider::default()),
            untouched_issuer(),
        );

        let inner = broker.inner.clone();
        let panicked = std::thread::spawn(move || {
            let _registry = inner.registry.lock();
            panic!("panic while holding the registry");
        })
        .join();
        assert!(panicked.is_err());
        assert!(broker.inner.registry.is_poisoned());

        let instance = context().instance;
        assert!(broker.sessions().is_empty());
        assert!(broker.try_activate(&instance).is_none());
        assert!(!broker.end_session(&instance, SessionEndReason::ClosedByUser).await);
    }
}
