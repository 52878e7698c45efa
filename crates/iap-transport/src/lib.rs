//! Transport abstraction layer for relay channels
//!
//! A relay connection talks to the proxy over a *channel*: a duplex, ordered,
//! message-oriented pipe that carries [`RelayMessage`]s. Channels are opened by
//! a [`ChannelConnector`], so the relay logic does not depend on the concrete
//! transport (WebSocket in production, in-memory pipes in-process).
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        RelayConnection       │  wire protocol, resumption, flow control
//! └──────────────────────────────┘
//!                │ ChannelConnector::connect
//!                ↓
//! ┌──────────────┬───────────────┐
//! │  WebSocket   │   in-memory   │  one channel per physical connection
//! └──────────────┴───────────────┘
//! ```

pub mod framed;
pub mod memory;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use framed::FramedChannel;
pub use memory::{MemoryAcceptor, MemoryConnector};

use async_trait::async_trait;
use iap_proto::{CodecError, RelayMessage, TunnelDestination};
use std::fmt::Debug;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A duplex message channel to the relay
///
/// `recv_message` must be cancel-safe: dropping the future before it completes
/// must not lose a message. The relay driver polls it inside `tokio::select!`.
#[async_trait]
pub trait RelayChannel: Send + Debug {
    /// Send a relay message
    async fn send_message(&mut self, message: RelayMessage) -> TransportResult<()>;

    /// Receive a relay message
    ///
    /// Returns `None` if the channel was closed by the remote peer.
    async fn recv_message(&mut self) -> TransportResult<Option<RelayMessage>>;

    /// Close the channel, flushing anything buffered
    async fn close(&mut self) -> TransportResult<()>;

    /// Identifier for logging and correlation
    fn channel_id(&self) -> &str;
}

/// Boxed channel returned by connectors
pub type BoxedChannel = Box<dyn RelayChannel>;

/// What a connector needs to know to open a physical channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub destination: TunnelDestination,
    pub user_agent: String,
}

impl ChannelRequest {
    pub fn new(destination: TunnelDestination) -> Self {
        Self {
            destination,
            user_agent: default_user_agent(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// `iap-tunnel/<version>`
pub fn default_user_agent() -> String {
    format!("iap-tunnel/{}", env!("CARGO_PKG_VERSION"))
}

/// Client-side: opens channels to the relay
#[async_trait]
pub trait ChannelConnector: Send + Sync + Debug {
    /// Open a new channel for the given destination
    async fn connect(&self, request: &ChannelRequest) -> TransportResult<BoxedChannel>;

    /// Human-readable transport name (e.g. "WebSocket")
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use iap_proto::InstanceLocator;

    #[test]
    fn test_channel_request_defaults() {
        let destination = TunnelDestination::new(InstanceLocator::new("p", "z", "vm"), 22);
        let request = ChannelRequest::new(destination.clone());

        assert_eq!(request.destination, destination);
        assert!(request.user_agent.starts_with("iap-tunnel/"));

        let request = request.with_user_agent("custom/1.0");
        assert_eq!(request.user_agent, "custom/1.0");
    }
}
