//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Main relay protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    // Session establishment
    Connect {
        auth_token: String,
        destination: TunnelDestination,
        policy: RelayPolicy,
        /// Bytes the client is willing to buffer before acknowledging
        receive_window: u32,
        user_agent: String,
    },
    Connected {
        session_id: String,
        /// Bytes the relay is willing to buffer before acknowledging
        receive_window: u32,
    },
    Reconnect {
        auth_token: String,
        session_id: String,
        /// Total payload bytes the client has consumed so far
        received: u64,
    },
    Reconnected {
        /// Total payload bytes the relay has consumed so far
        received: u64,
    },
    Rejected {
        code: RejectCode,
        reason: String,
    },

    // Payload and flow control
    Data {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Ack {
        received: u64,
    },

    // Keep-alive
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    Close {
        reason: String,
    },
}

impl RelayMessage {
    /// Short name used in logs and protocol violation reports
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Connect { .. } => "Connect",
            RelayMessage::Connected { .. } => "Connected",
            RelayMessage::Reconnect { .. } => "Reconnect",
            RelayMessage::Reconnected { .. } => "Reconnected",
            RelayMessage::Rejected { .. } => "Rejected",
            RelayMessage::Data { .. } => "Data",
            RelayMessage::Ack { .. } => "Ack",
            RelayMessage::Ping { .. } => "Ping",
            RelayMessage::Pong { .. } => "Pong",
            RelayMessage::Close { .. } => "Close",
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Why the relay refused a Connect or Reconnect
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectCode {
    /// The bearer token is invalid or has expired
    Unauthorized,
    /// The caller is authenticated but the access policy denies the destination
    Forbidden,
    /// Transient backend problem, the request may be retried
    Unavailable,
    /// The session id presented for resumption is expired or unknown
    SessionUnknown,
}

/// Identifies a virtual machine instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceLocator {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.name
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid instance locator '{0}', expected projects/<project>/zones/<zone>/instances/<name>")]
pub struct ParseLocatorError(String);

impl FromStr for InstanceLocator {
    type Err = ParseLocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["projects", project, "zones", zone, "instances", name]
                if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(*project, *zone, *name))
            }
            _ => Err(ParseLocatorError(s.to_string())),
        }
    }
}

/// A TCP port on a specific instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TunnelDestination {
    pub instance: InstanceLocator,
    pub port: u16,
}

impl TunnelDestination {
    pub fn new(instance: InstanceLocator, port: u16) -> Self {
        Self { instance, port }
    }
}

impl fmt::Display for TunnelDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.port)
    }
}

/// Access policy presented to the relay during the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RelayPolicy {
    /// Relay audience requested for the bearer token
    pub audience: String,
    /// Scope the token must carry
    pub scope: Option<String>,
    /// Connection-limit class, tunnels in different classes are never shared
    pub connection_limit_class: ConnectionLimitClass,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            audience: "https://tunnel.cloudproxy.app".to_string(),
            scope: None,
            connection_limit_class: ConnectionLimitClass::Interactive,
        }
    }
}

impl RelayPolicy {
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_connection_limit_class(mut self, class: ConnectionLimitClass) -> Self {
        self.connection_limit_class = class;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionLimitClass {
    /// A single interactive client (RDP window, SSH terminal)
    Interactive,
    /// Tools that open many parallel connections (file transfer, port scans)
    Bulk,
}

impl ConnectionLimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionLimitClass::Interactive => "interactive",
            ConnectionLimitClass::Bulk => "bulk",
        }
    }
}
