//! Keyed, reference-counted tunnel cache
//!
//! Each fingerprint owns a slot. Creating a tunnel happens while holding the
//! slot's lock, so concurrent requests for the same fingerprint queue behind
//! one attempt and reuse its outcome, whether that is a tunnel or an error.
//! Teardown also holds the slot lock, so a tunnel is never handed out while it
//! is being torn down.

use crate::config::TunnelSettings;
use crate::destination::{RelayPolicy, TunnelDestination, TunnelFingerprint};
use crate::error::TunnelError;
use crate::tunnel::{Tunnel, TunnelHandle, TunnelInfo};
use iap_auth::{CredentialSource, ReauthRetryPolicy};
use iap_relay::{RelayConnection, RelayError};
use iap_transport::ChannelConnector;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Tunnel lifecycle notifications
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    TunnelOpened(TunnelInfo),
    TunnelClosed {
        id: Uuid,
        fingerprint: TunnelFingerprint,
    },
}

#[derive(Default)]
struct Slot {
    /// Creation attempts started in this slot
    attempts: AtomicU64,
    state: tokio::sync::Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    tunnel: Option<Arc<Tunnel>>,
    last_failure: Option<TunnelError>,
}

struct BrokerInner {
    connector: Arc<dyn ChannelConnector>,
    retry: ReauthRetryPolicy,
    settings: TunnelSettings,
    slots: Mutex<HashMap<TunnelFingerprint, Arc<Slot>>>,
    shut_down: AtomicBool,
    stop: CancellationToken,
    events: broadcast::Sender<BrokerEvent>,
    reaper: mpsc::UnboundedSender<Arc<Tunnel>>,
}

/// Hands out shared tunnels, at most one per fingerprint
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct TunnelBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for TunnelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelBroker")
            .field("connector", &self.inner.connector.name())
            .field("tunnels", &self.inner.slots().len())
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl TunnelBroker {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        credentials: Arc<dyn CredentialSource>,
        settings: TunnelSettings,
    ) -> Self {
        let retry = ReauthRetryPolicy::new(credentials).with_reauth_timeout(settings.reauth_timeout);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (reaper, reaper_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(BrokerInner {
            connector,
            retry,
            settings,
            slots: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            stop: CancellationToken::new(),
            events,
            reaper,
        });

        tokio::spawn(reap(Arc::downgrade(&inner), reaper_rx));

        Self { inner }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.inner.settings
    }

    /// Policy used around relay establishment, shared with callers that issue
    /// other credential-bearing requests
    pub fn retry_policy(&self) -> &ReauthRetryPolicy {
        &self.inner.retry
    }

    /// Reference to the tunnel for `(destination, policy)`, creating it if needed
    pub async fn get_or_create(
        &self,
        destination: TunnelDestination,
        policy: RelayPolicy,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(TunnelError::ShutDown);
        }

        let fingerprint = TunnelFingerprint::new(destination, policy);
        let slot = inner.slot(&fingerprint);

        let acquired = self.acquire(&slot, &fingerprint, cancel).await;
        if acquired.is_err() {
            inner.prune(&fingerprint, &slot);
        }
        acquired
    }

    /// Reuse or create the tunnel in `slot`, queueing behind other attempts
    async fn acquire(
        &self,
        slot: &Arc<Slot>,
        fingerprint: &TunnelFingerprint,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, TunnelError> {
        let inner = &self.inner;
        let observed = slot.attempts.load(Ordering::SeqCst);

        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled.into()),
            _ = inner.stop.cancelled() => return Err(TunnelError::ShutDown),
            state = slot.state.lock() => state,
        };

        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(TunnelError::ShutDown);
        }

        if let Some(tunnel) = &state.tunnel {
            if tunnel.is_healthy() {
                debug!(tunnel_id = %tunnel.id(), "Reusing tunnel for {}", fingerprint);
                return Ok(tunnel.acquire());
            }
        }

        if let Some(stale) = state.tunnel.take() {
            warn!(tunnel_id = %stale.id(), "Evicting unhealthy tunnel for {}", fingerprint);
            stale.teardown().await;
            inner.emit_closed(&stale);
        }

        // An attempt ran while we were queued: share its failure
        if slot.attempts.load(Ordering::SeqCst) != observed {
            if let Some(err) = &state.last_failure {
                if !err.is_cancelled() {
                    debug!("Sharing failed attempt for {}: {}", fingerprint, err);
                    return Err(err.clone());
                }
            }
        }

        slot.attempts.fetch_add(1, Ordering::SeqCst);

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled.into()),
            _ = inner.stop.cancelled() => Err(TunnelError::ShutDown),
            created = inner.create(fingerprint, cancel) => created,
        };

        match created {
            Ok(tunnel) => {
                if inner.shut_down.load(Ordering::SeqCst) {
                    tunnel.teardown().await;
                    return Err(TunnelError::ShutDown);
                }

                let handle = tunnel.acquire();
                state.tunnel = Some(tunnel.clone());
                state.last_failure = None;
                inner.emit(BrokerEvent::TunnelOpened(tunnel.info()));
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to create tunnel for {}: {}", fingerprint, e);
                state.last_failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Give back a handle
    ///
    /// The last release tears the tunnel down, right away or after the idle
    /// grace period.
    pub async fn release(&self, handle: TunnelHandle) {
        let tunnel = handle.take();
        if tunnel.decrement() > 0 {
            return;
        }

        if self.inner.settings.idle_grace_period.is_zero() {
            self.inner.retire(tunnel).await;
        } else {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.retire(tunnel).await });
        }
    }

    /// Snapshots of the tunnels not currently being created or torn down
    pub fn tunnels(&self) -> Vec<TunnelInfo> {
        let slots: Vec<Arc<Slot>> = self.inner.slots().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| {
                let state = slot.state.try_lock().ok()?;
                state.tunnel.as_ref().map(|tunnel| tunnel.info())
            })
            .collect()
    }

    /// Local endpoint of the live tunnel for a fingerprint, if any
    pub fn local_endpoint(&self, fingerprint: &TunnelFingerprint) -> Option<SocketAddr> {
        let slot = self.inner.slots().get(fingerprint).cloned()?;
        let state = slot.state.try_lock().ok()?;
        state.tunnel.as_ref().map(|tunnel| tunnel.local_endpoint())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Tear down every tunnel regardless of references
    ///
    /// Later `get_or_create` calls fail with [`TunnelError::ShutDown`].
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shut_down.store(true, Ordering::SeqCst);
        inner.stop.cancel();

        let slots: Vec<Arc<Slot>> = inner.slots().drain().map(|(_, slot)| slot).collect();
        info!("Shutting down tunnel broker ({} slot(s))", slots.len());

        for slot in slots {
            let mut state = slot.state.lock().await;
            if let Some(tunnel) = state.tunnel.take() {
                tunnel.teardown().await;
                inner.emit_closed(&tunnel);
            }
        }
    }
}

impl BrokerInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<TunnelFingerprint, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, fingerprint: &TunnelFingerprint) -> Arc<Slot> {
        self.slots()
            .entry(fingerprint.clone())
            .or_default()
            .clone()
    }

    async fn create(
        &self,
        fingerprint: &TunnelFingerprint,
        cancel: &CancellationToken,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let settings = &self.settings;
        let credentials = self.retry.credentials().clone();

        let relay = self
            .retry
            .run(cancel, || {
                RelayConnection::connect(
                    self.connector.clone(),
                    fingerprint.destination.clone(),
                    fingerprint.policy.clone(),
                    credentials.clone(),
                    settings.relay.clone(),
                    cancel,
                )
            })
            .await?;

        Tunnel::open(
            fingerprint.clone(),
            relay,
            SocketAddr::new(settings.bind_address, 0),
            settings.max_local_connections,
            settings.drain_timeout,
            self.reaper.clone(),
        )
        .await
    }

    /// Tear down a tunnel whose last reference went away, unless it was
    /// re-acquired or replaced in the meantime
    async fn retire(self: &Arc<Self>, tunnel: Arc<Tunnel>) {
        let grace = self.settings.idle_grace_period;
        if !grace.is_zero() {
            debug!(tunnel_id = %tunnel.id(), "Keeping idle tunnel for {:?}", grace);
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                // shutdown() tears everything down itself
                _ = self.stop.cancelled() => return,
            }
        }

        let fingerprint = tunnel.fingerprint().clone();
        let Some(slot) = self.slots().get(&fingerprint).cloned() else {
            return;
        };

        let mut state = slot.state.lock().await;
        let is_current = state
            .tunnel
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &tunnel));
        if !is_current || tunnel.ref_count() > 0 {
            debug!(tunnel_id = %tunnel.id(), "Tunnel back in use, keeping it");
            return;
        }

        state.tunnel = None;
        tunnel.teardown().await;
        self.emit_closed(&tunnel);
        drop(state);

        self.prune(&fingerprint, &slot);
    }

    /// Forget an empty slot nobody else is holding
    fn prune(&self, fingerprint: &TunnelFingerprint, slot: &Arc<Slot>) {
        let mut slots = self.slots();
        // The map and the caller
        if Arc::strong_count(slot) == 2 {
            if let Ok(state) = slot.state.try_lock() {
                if state.tunnel.is_none() {
                    slots.remove(fingerprint);
                }
            }
        }
    }

    fn emit(&self, event: BrokerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_closed(&self, tunnel: &Tunnel) {
        self.emit(BrokerEvent::TunnelClosed {
            id: tunnel.id(),
            fingerprint: tunnel.fingerprint().clone(),
        });
    }
}

/// Retires tunnels whose last handle was dropped
async fn reap(inner: Weak<BrokerInner>, mut rx: mpsc::UnboundedReceiver<Arc<Tunnel>>) {
    while let Some(tunnel) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::spawn(async move { inner.retire(tunnel).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iap_auth::testing::TestCredentials;
    use iap_proto::RejectCode;
    use iap_transport::testing::{destination, SimulatedProxy};
    use iap_transport::MemoryConnector;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failed_creations_leave_no_slots_behind() {
        let proxy = SimulatedProxy::start();
        proxy.reject_next([RejectCode::Forbidden, RejectCode::Forbidden, RejectCode::Forbidden]);
        let broker = TunnelBroker::new(
            Arc::new(proxy.connector()),
            TestCredentials::new("token"),
            TunnelSettings::default(),
        );

        for name in ["vm-1", "vm-2", "vm-3"] {
            let created = broker
                .get_or_create(destination(name, 22), RelayPolicy::default(), &CancellationToken::new())
                .await;
            assert!(created.is_err());
        }

        assert!(broker.inner.slots().is_empty());
        assert_eq!(proxy.connects().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_creation_leaves_no_slot_behind() {
        // Nobody answers the handshake
        let (connector, _acceptor) = MemoryConnector::pair();
        let broker = TunnelBroker::new(
            Arc::new(connector),
            TestCredentials::new("token"),
            TunnelSettings::default(),
        );
        let cancel = CancellationToken::new();

        let canceller = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        });

        let created = broker
            .get_or_create(destination("vm-1", 3389), RelayPolicy::default(), &cancel)
            .await;
        assert!(matches!(created, Err(TunnelError::Relay(RelayError::Cancelled))));
        canceller.await.unwrap();

        assert!(broker.inner.slots().is_empty());
    }

    #[tokio::test]
    async fn test_poisoned_slot_map_does_not_take_the_broker_down() {
        let proxy = SimulatedProxy::start();
        let broker = TunnelBroker::new(
            Arc::new(proxy.connector()),
            TestCredentials::new("token"),
            TunnelSettings::default(),
        );

        let inner = broker.inner.clone();
        let panicked = std::thread::spawn(move || {
            let _slots = inner.slots.lock();
            panic!("panic while holding the slot map");
        })
        .join();
        assert!(panicked.is_err());

        let handle = broker
            .get_or_create(destination("vm-1", 22), RelayPolicy::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(broker.tunnels().len(), 1);
        broker.release(handle).await;
        assert!(broker.tunnels().is_empty());
    }
}
