//! Local tunnels over relay connections
//!
//! A [`Tunnel`] exposes one relay destination as a loopback TCP port. The
//! [`TunnelBroker`] hands out reference-counted [`TunnelHandle`]s and makes
//! sure that callers asking for the same destination under the same policy
//! share one tunnel.
//!
//! # Example
//!
//! ```ignore
//! let broker = TunnelBroker::new(connector, credentials, TunnelSettings::default());
//! let destination = TunnelDestination::new(InstanceLocator::new("proj", "zone", "vm-1"), 3389);
//!
//! let handle = broker
//!     .get_or_create(destination, RelayPolicy::default(), &CancellationToken::new())
//!     .await?;
//! println!("RDP client can connect to {}", handle.local_endpoint());
//!
//! broker.release(handle).await;
//! ```

pub mod broker;
pub mod config;
pub mod destination;
pub mod error;
pub mod listener;
pub mod mux;
pub mod tunnel;

pub use broker::{BrokerEvent, TunnelBroker};
pub use config::{SettingsProvider, TunnelSettings};
pub use destination::{
    DefaultPolicyProvider, InstanceLocator, PolicyProvider, RelayPolicy, TunnelDestination,
    TunnelFingerprint,
};
pub use error::TunnelError;
pub use listener::LocalListener;
pub use mux::{MuxStream, StreamMux};
pub use tunnel::{Tunnel, TunnelHandle, TunnelInfo};
