//! WebSocket channel connector

use crate::config::{ensure_crypto_provider, WebSocketConfig};
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use iap_proto::{RelayCodec, RelayMessage};
use iap_transport::{
    BoxedChannel, ChannelConnector, ChannelRequest, RelayChannel, TransportError,
    TransportResult,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as TungsteniteConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for establishing relay channels
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> TransportResult<Self> {
        config.validate()?;
        ensure_crypto_provider();

        debug!("WebSocket connector created for {}", config.endpoint);

        Ok(Self { config })
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, request: &ChannelRequest) -> TransportResult<BoxedChannel> {
        let url = self.config.connect_url(&request.destination)?;

        let mut upgrade = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        let headers = upgrade.headers_mut();
        headers.insert(
            "User-Agent",
            HeaderValue::from_str(&request.user_agent).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid user agent: {}", e))
            })?,
        );
        if let Some(origin) = &self.config.origin {
            headers.insert(
                "Origin",
                HeaderValue::from_str(origin).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid origin: {}", e))
                })?,
            );
        }

        let mut ws_config = TungsteniteConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);

        debug!("Connecting to relay: {}", url);

        let (ws_stream, _response) =
            tokio_tungstenite::connect_async_with_config(upgrade, Some(ws_config), false)
                .await
                .map_err(|e| {
                    TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
                })?;

        let channel_id = format!("ws-{}", uuid::Uuid::new_v4());
        info!(
            "[{}] WebSocket channel established to {} for {}",
            channel_id, self.config.endpoint, request.destination
        );

        Ok(Box::new(WebSocketChannel::new(ws_stream, channel_id)))
    }

    fn name(&self) -> &str {
        "WebSocket"
    }
}

/// One relay channel carried by a WebSocket connection
pub struct WebSocketChannel {
    channel_id: String,
    stream: WsStream,
    closed: bool,
}

impl std::fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("channel_id", &self.channel_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl WebSocketChannel {
    fn new(stream: WsStream, channel_id: String) -> Self {
        Self {
            channel_id,
            stream,
            closed: false,
        }
    }
}

/// Decode exactly one relay message from one WebSocket message
fn decode_single(data: &[u8]) -> TransportResult<RelayMessage> {
    let mut buf = BytesMut::from(data);
    let msg = RelayCodec::decode_message(&mut buf)?.ok_or_else(|| {
        TransportError::ProtocolError("Truncated relay frame in WebSocket message".to_string())
    })?;

    if !buf.is_empty() {
        return Err(TransportError::ProtocolError(format!(
            "{} trailing bytes after relay frame",
            buf.len()
        )));
    }

    Ok(msg)
}

#[async_trait]
impl RelayChannel for WebSocketChannel {
    async fn send_message(&mut self, message: RelayMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }

        let encoded = RelayCodec::encode_message(&message)?;
        trace!(
            "[{}] send {} ({} bytes)",
            self.channel_id,
            message.kind(),
            encoded.len()
        );

        self.stream
            .send(Message::Binary(encoded.to_vec()))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("WebSocket send error: {}", e)))
    }

    async fn recv_message(&mut self) -> TransportResult<Option<RelayMessage>> {
        if self.closed {
            return Ok(None);
        }

        while let Some(result) = self.stream.next().await {
            match result {
                Ok(Message::Binary(data)) => return decode_single(&data).map(Some),
                Ok(Message::Close(frame)) => {
                    debug!("[{}] WebSocket closed by relay: {:?}", self.channel_id, frame);
                    return Ok(None);
                }
                // tungstenite answers pings itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Text(text)) => {
                    warn!("[{}] Unexpected text message: {}", self.channel_id, text);
                    return Err(TransportError::ProtocolError(
                        "Relay sent a text message".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(TransportError::ConnectionError(format!(
                        "WebSocket receive error: {}",
                        e
                    )))
                }
            }
        }

        Ok(None)
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.stream.close(None).await {
            debug!("[{}] Error closing WebSocket: {}", self.channel_id, e);
        }
        Ok(())
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}
