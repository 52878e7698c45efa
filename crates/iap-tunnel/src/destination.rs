//! Destinations, policies and the tunnel cache key

pub use iap_proto::{ConnectionLimitClass, InstanceLocator, RelayPolicy, TunnelDestination};

use serde::{Deserialize, Serialize};
use std::fmt;

/// "This destination under this policy"
///
/// Two requests with equal fingerprints share one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelFingerprint {
    pub destination: TunnelDestination,
    pub policy: RelayPolicy,
}

impl TunnelFingerprint {
    pub fn new(destination: TunnelDestination, policy: RelayPolicy) -> Self {
        Self {
            destination,
            policy,
        }
    }
}

impl fmt::Display for TunnelFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} {}]",
            self.destination,
            self.policy.audience,
            self.policy.connection_limit_class.as_str()
        )
    }
}

/// Chooses the access policy presented for a destination
pub trait PolicyProvider: Send + Sync {
    fn relay_policy(&self, destination: &TunnelDestination) -> RelayPolicy;
}

/// Same policy for every destination
#[derive(Debug, Clone, Default)]
pub struct DefaultPolicyProvider {
    policy: RelayPolicy,
}

impl DefaultPolicyProvider {
    pub fn new(policy: RelayPolicy) -> Self {
        Self { policy }
    }
}

impl PolicyProvider for DefaultPolicyProvider {
    fn relay_policy(&self, _destination: &TunnelDestination) -> RelayPolicy {
        self.policy.clone()
    }
}
