//! Interactive RDP and SSH sessions

use crate::issuer::Credential;
use chrono::{DateTime, Utc};
use iap_tunnel::{InstanceLocator, Tunnel, TunnelDestination, TunnelHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionProtocol {
    Rdp,
    Ssh,
}

impl SessionProtocol {
    pub fn default_port(&self) -> u16 {
        match self {
            SessionProtocol::Rdp => 3389,
            SessionProtocol::Ssh => 22,
        }
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionProtocol::Rdp => write!(f, "RDP"),
            SessionProtocol::Ssh => write!(f, "SSH"),
        }
    }
}

/// What to connect to and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub instance: InstanceLocator,
    pub protocol: SessionProtocol,
    /// Remote port, when the service does not listen on the protocol default
    pub port: Option<u16>,
    /// Preferred user name for the issued credential
    pub username: Option<String>,
}

impl SessionContext {
    pub fn new(instance: InstanceLocator, protocol: SessionProtocol) -> Self {
        Self {
            instance,
            protocol,
            port: None,
            username: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn destination(&self) -> TunnelDestination {
        TunnelDestination::new(self.instance.clone(), self.port())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEndReason {
    ClosedByUser,
    TunnelFailed(String),
    Shutdown,
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEndReason::ClosedByUser => write!(f, "closed by user"),
            SessionEndReason::TunnelFailed(reason) => write!(f, "tunnel failed: {}", reason),
            SessionEndReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub instance: InstanceLocator,
    pub protocol: SessionProtocol,
    pub local_endpoint: SocketAddr,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// One interactive session, holding a reference to its tunnel
///
/// Sessions are created and ended through [`SessionBroker`](crate::SessionBroker).
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    context: SessionContext,
    credential: Credential,
    tunnel: Arc<Tunnel>,
    handle: Mutex<Option<TunnelHandle>>,
    created_at: DateTime<Utc>,
    end_requested: CancellationToken,
    end_reason: Mutex<Option<SessionEndReason>>,
    ended: CancellationToken,
}

impl Session {
    pub(crate) fn new(context: SessionContext, credential: Credential, handle: TunnelHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            credential,
            tunnel: handle.tunnel().clone(),
            handle: Mutex::new(Some(handle)),
            created_at: Utc::now(),
            end_requested: CancellationToken::new(),
            end_reason: Mutex::new(None),
            ended: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn instance(&self) -> &InstanceLocator {
        &self.context.instance
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.context.protocol
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Where the RDP or SSH client should connect
    pub fn local_endpoint(&self) -> SocketAddr {
        self.tunnel.local_endpoint()
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_active(&self) -> bool {
        !self.end_requested.is_cancelled() && !self.ended.is_cancelled()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            instance: self.context.instance.clone(),
            protocol: self.context.protocol,
            local_endpoint: self.local_endpoint(),
            username: self.credential.username().to_string(),
            created_at: self.created_at,
        }
    }

    /// End the session and wait until its tunnel reference is released
    pub async fn close(&self) {
        self.request_end(SessionEndReason::ClosedByUser);
        self.ended().await;
    }

    /// Resolves once the session has ended
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }

    /// First reason wins
    pub(crate) fn request_end(&self, reason: SessionEndReason) {
        let mut end_reason = self
            .end_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if end_reason.is_none() {
            *end_reason = Some(reason);
        }
        self.end_requested.cancel();
    }

    pub(crate) async fn end_requested(&self) -> SessionEndReason {
        self.end_requested.cancelled().await;
        self.end_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(SessionEndReason::ClosedByUser)
    }

    pub(crate) fn take_handle(&self) -> Option<TunnelHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.cancel();
    }
}
