//! WebSocket transport implementation using tokio-tungstenite
//!
//! Relay channels run over `wss://`, which passes through corporate proxies
//! and firewalls that block anything but HTTPS. Each relay message travels as
//! one binary WebSocket message holding a [`iap_proto::RelayCodec`] frame.

pub mod config;
pub mod connector;

pub use config::WebSocketConfig;
pub use connector::{WebSocketChannel, WebSocketConnector};
