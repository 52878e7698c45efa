//! In-process transport
//!
//! [`MemoryConnector`] hands each new channel's far end to a
//! [`MemoryAcceptor`], which lets a relay implementation run inside the same
//! process (embedded relays, tests, local tooling).

use crate::framed::FramedChannel;
use crate::{BoxedChannel, ChannelConnector, ChannelRequest, TransportError, TransportResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Buffer size of each in-memory pipe direction
const PIPE_CAPACITY: usize = 64 * 1024;

/// Server end of an in-memory channel
pub type MemoryChannel = FramedChannel<DuplexStream>;

/// A channel opened by a connector, as seen by the acceptor
#[derive(Debug)]
pub struct IncomingChannel {
    pub request: ChannelRequest,
    pub channel: MemoryChannel,
}

/// Client side of the in-process transport
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming_tx: mpsc::Sender<IncomingChannel>,
    connects: Arc<AtomicU64>,
}

/// Server side of the in-process transport
#[derive(Debug)]
pub struct MemoryAcceptor {
    incoming_rx: Mutex<mpsc::Receiver<IncomingChannel>>,
}

impl MemoryConnector {
    /// Create a connected connector/acceptor pair
    pub fn pair() -> (MemoryConnector, MemoryAcceptor) {
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        (
            MemoryConnector {
                incoming_tx,
                connects: Arc::new(AtomicU64::new(0)),
            },
            MemoryAcceptor {
                incoming_rx: Mutex::new(incoming_rx),
            },
        )
    }

    /// Number of channels this connector (and its clones) has opened
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl MemoryAcceptor {
    /// Wait for the next channel
    ///
    /// Returns `None` once every connector has been dropped.
    pub async fn accept(&self) -> Option<IncomingChannel> {
        self.incoming_rx.lock().await.recv().await
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(&self, request: &ChannelRequest) -> TransportResult<BoxedChannel> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);

        let incoming = IncomingChannel {
            request: request.clone(),
            channel: FramedChannel::with_id(server_io, format!("mem-server-{}", n)),
        };

        self.incoming_tx.send(incoming).await.map_err(|_| {
            TransportError::ConnectionError("in-memory acceptor is gone".to_string())
        })?;

        debug!("Opened in-memory channel {} to {}", n, request.destination);

        Ok(Box::new(FramedChannel::with_id(
            client_io,
            format!("mem-client-{}", n),
        )))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayChannel;
    use iap_proto::{InstanceLocator, RelayMessage, TunnelDestination};

    fn request() -> ChannelRequest {
        ChannelRequest::new(TunnelDestination::new(
            InstanceLocator::new("p", "z", "vm"),
            3389,
        ))
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let (connector, acceptor) = MemoryConnector::pair();

        let mut client = connector.connect(&request()).await.unwrap();
        let mut incoming = acceptor.accept().await.unwrap();

        assert_eq!(incoming.request, request());
        assert_eq!(connector.connect_count(), 1);

        client
            .send_message(RelayMessage::Ping { timestamp: 5 })
            .await
            .unwrap();
        assert_eq!(
            incoming.channel.recv_message().await.unwrap(),
            Some(RelayMessage::Ping { timestamp: 5 })
        );
    }

    #[tokio::test]
    async fn test_connect_fails_without_acceptor() {
        let (connector, acceptor) = MemoryConnector::pair();
        drop(acceptor);

        let result = connector.connect(&request()).await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }
}
