//! WebSocket transport configuration

use iap_proto::TunnelDestination;
use iap_transport::{TransportError, TransportResult};
use std::sync::Once;
use url::Url;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Relay endpoint (e.g., "wss://tunnel.cloudproxy.app")
    pub endpoint: String,

    /// WebSocket path (e.g., "/v4/connect")
    pub path: String,

    /// Maximum message size
    pub max_message_size: usize,

    /// Value of the Origin header sent with the upgrade request
    pub origin: Option<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://tunnel.cloudproxy.app".to_string(),
            path: "/v4/connect".to_string(),
            max_message_size: 16 * 1024 * 1024, // 16MB
            origin: Some("bot:iap-tunneler".to_string()),
        }
    }
}

impl WebSocketConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> TransportResult<()> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            TransportError::ConfigurationError(format!(
                "Invalid relay endpoint '{}': {}",
                self.endpoint, e
            ))
        })?;

        if url.scheme() != "wss" && url.scheme() != "ws" {
            return Err(TransportError::ConfigurationError(format!(
                "Relay endpoint must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }

        if !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(
                "WebSocket path must start with '/'".to_string(),
            ));
        }

        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "max_message_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the upgrade URL for one destination
    pub fn connect_url(&self, destination: &TunnelDestination) -> TransportResult<Url> {
        let mut url = Url::parse(&self.endpoint)
            .and_then(|base| base.join(&self.path))
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("project", &destination.instance.project)
            .append_pair("zone", &destination.instance.zone)
            .append_pair("instance", &destination.instance.name)
            .append_pair("port", &destination.port.to_string());

        Ok(url)
    }
}

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
