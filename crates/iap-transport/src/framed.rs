//! Relay channel over any byte stream, framed with [`RelayCodec`]

use crate::{RelayChannel, TransportError, TransportResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use iap_proto::{RelayCodec, RelayMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::trace;

/// A [`RelayChannel`] that frames messages onto an `AsyncRead + AsyncWrite`
pub struct FramedChannel<T> {
    channel_id: String,
    framed: Framed<T, RelayCodec>,
    closed: bool,
}

impl<T> std::fmt::Debug for FramedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("channel_id", &self.channel_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T> FramedChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(io: T) -> Self {
        Self::with_id(io, format!("framed-{}", uuid::Uuid::new_v4()))
    }

    pub fn with_id(io: T, channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            framed: Framed::new(io, RelayCodec::new()),
            closed: false,
        }
    }
}

#[async_trait]
impl<T> RelayChannel for FramedChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send_message(&mut self, message: RelayMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        trace!("[{}] send {}", self.channel_id, message.kind());
        self.framed.send(message).await?;
        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<RelayMessage>> {
        if self.closed {
            return Ok(None);
        }
        match self.framed.next().await {
            Some(Ok(message)) => {
                trace!("[{}] recv {}", self.channel_id, message.kind());
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // SinkExt::close flushes and shuts down the write half
        self.framed.close().await?;
        Ok(())
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}
