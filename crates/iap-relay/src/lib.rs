//! Resumable relay connection
//!
//! A [`RelayConnection`] is one logical, ordered, reliable byte stream to a
//! destination behind the proxy. Physical channels may drop; the connection
//! resumes the proxy session, retransmits whatever the proxy has not
//! acknowledged and carries on. If the proxy refuses the resumption the
//! connection fails rather than silently losing bytes.

pub mod config;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod window;

pub use config::RelayOptions;
pub use connection::{ConnectionState, RelayConnection, RelayStats};
pub use error::RelayError;
pub use reconnect::{Backoff, BackoffError, ReconnectConfig};
pub use window::{SendWindow, WindowError};
