//! A relay connection exposed as a local port

use crate::destination::TunnelFingerprint;
use crate::listener::{ActivityClock, LocalListener};
use crate::mux::StreamMux;
use chrono::{DateTime, Utc};
use iap_relay::{ConnectionState, RelayConnection, RelayStats};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Serializable snapshot of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub fingerprint: TunnelFingerprint,
    pub local_endpoint: SocketAddr,
    pub ref_count: usize,
    pub state: ConnectionState,
    pub active_connections: usize,
    pub refused_connections: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub relay: RelayStats,
}

/// Local listener + relay connection, shared by reference count
#[derive(Debug)]
pub struct Tunnel {
    id: Uuid,
    fingerprint: TunnelFingerprint,
    relay: Arc<RelayConnection>,
    mux: Arc<StreamMux>,
    listener: LocalListener,
    ref_count: AtomicUsize,
    created_at: DateTime<Utc>,
    activity: Arc<ActivityClock>,
    drain_timeout: Duration,
    tearing_down: AtomicBool,
    closed: CancellationToken,
    /// Receives this tunnel when its last handle is dropped
    reaper: mpsc::UnboundedSender<Arc<Tunnel>>,
}

impl Tunnel {
    /// Bind a local listener in front of an established relay connection
    ///
    /// Starts with no references; call [`acquire`](Self::acquire).
    pub async fn open(
        fingerprint: TunnelFingerprint,
        relay: RelayConnection,
        bind_address: SocketAddr,
        max_local_connections: usize,
        drain_timeout: Duration,
        reaper: mpsc::UnboundedSender<Arc<Tunnel>>,
    ) -> Result<Arc<Self>, crate::TunnelError> {
        let relay = Arc::new(relay);
        let mux = StreamMux::new(relay.clone());
        let activity = Arc::new(ActivityClock::new());

        let listener = match LocalListener::bind(
            bind_address,
            mux.clone(),
            max_local_connections,
            activity.clone(),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                mux.shutdown();
                relay.close().await;
                return Err(e);
            }
        };

        let tunnel = Arc::new(Self {
            id: Uuid::new_v4(),
            fingerprint,
            relay,
            mux,
            listener,
            ref_count: AtomicUsize::new(0),
            created_at: Utc::now(),
            activity,
            drain_timeout,
            tearing_down: AtomicBool::new(false),
            closed: CancellationToken::new(),
            reaper,
        });

        info!(
            tunnel_id = %tunnel.id,
            local_endpoint = %tunnel.local_endpoint(),
            "Tunnel open for {}",
            tunnel.fingerprint
        );

        Ok(tunnel)
    }

    /// Take a reference
    pub fn acquire(self: &Arc<Self>) -> TunnelHandle {
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(tunnel_id = %self.id, ref_count = count, "Tunnel acquired");
        TunnelHandle {
            tunnel: self.clone(),
            counted: true,
        }
    }

    /// Drop a reference, returning how many remain
    pub(crate) fn decrement(&self) -> usize {
        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(tunnel_id = %self.id, ref_count = remaining, "Tunnel released");
        remaining
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn fingerprint(&self) -> &TunnelFingerprint {
        &self.fingerprint
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> &Arc<RelayConnection> {
        &self.relay
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.last()
    }

    pub fn active_connections(&self) -> usize {
        self.listener.active_connections()
    }

    /// Local connections turned away at the connection limit
    pub fn refused_connections(&self) -> u64 {
        self.listener.refused_connections()
    }

    /// Relay usable and not being torn down
    pub fn is_healthy(&self) -> bool {
        !self.tearing_down.load(Ordering::SeqCst) && !self.relay.state().is_terminal()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once teardown has finished
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id,
            fingerprint: self.fingerprint.clone(),
            local_endpoint: self.local_endpoint(),
            ref_count: self.ref_count(),
            state: self.relay.state(),
            active_connections: self.active_connections(),
            refused_connections: self.refused_connections(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            relay: self.relay.stats(),
        }
    }

    /// Close the listener, drain local connections, then close the relay
    ///
    /// Only the first call does the work; later calls wait for it.
    pub async fn teardown(&self) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            self.closed().await;
            return;
        }

        info!(tunnel_id = %self.id, "Tearing down tunnel for {}", self.fingerprint);

        self.listener.close().await;
        self.listener.drain(self.drain_timeout).await;
        self.mux.shutdown();
        self.relay.close().await;
        self.closed.cancel();

        info!(tunnel_id = %self.id, "Tunnel closed");
    }
}

/// One counted reference to a tunnel
///
/// Dropping the handle releases the reference. When the last reference goes
/// away the tunnel is handed to its broker for teardown.
#[derive(Debug)]
pub struct TunnelHandle {
    tunnel: Arc<Tunnel>,
    counted: bool,
}

impl TunnelHandle {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.tunnel.local_endpoint()
    }

    pub fn fingerprint(&self) -> &TunnelFingerprint {
        self.tunnel.fingerprint()
    }

    pub fn is_healthy(&self) -> bool {
        self.tunnel.is_healthy()
    }

    /// Give up the reference without the drop-time notification
    pub(crate) fn take(mut self) -> Arc<Tunnel> {
        self.counted = false;
        self.tunnel.clone()
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if self.counted && self.tunnel.decrement() == 0 {
            // Fails only when the broker is gone; dropping the tunnel then stops it
            let _ = self.tunnel.reaper.send(self.tunnel.clone());
        }
    }
}
