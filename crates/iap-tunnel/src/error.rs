use iap_relay::RelayError;
use thiserror::Error;

/// Tunnel errors
///
/// `Clone` so that concurrent callers waiting on the same creation attempt all
/// receive its outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Failed to bind local listener: {0}")]
    Bind(String),

    #[error("Tunnel broker has been shut down")]
    ShutDown,
}

impl TunnelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Relay(RelayError::Cancelled))
    }
}
