use crate::issuer::IssueError;
use iap_auth::ReauthAbort;
use iap_relay::RelayError;
use iap_tunnel::{InstanceLocator, TunnelError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Tunnel error: {0}")]
    Tunnel(TunnelError),

    #[error("Credential error: {0}")]
    Credential(IssueError),

    #[error("Already connecting to {0}")]
    AlreadyConnecting(InstanceLocator),

    #[error("Session creation cancelled")]
    Cancelled,

    #[error("Timed out")]
    Timeout,

    #[error("Re-authorization declined")]
    ReauthDeclined,
}

impl From<TunnelError> for SessionError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Relay(RelayError::Cancelled) => SessionError::Cancelled,
            TunnelError::Relay(RelayError::Timeout) => SessionError::Timeout,
            other => SessionError::Tunnel(other),
        }
    }
}

impl From<IssueError> for SessionError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Aborted(ReauthAbort::Cancelled) => SessionError::Cancelled,
            IssueError::Aborted(ReauthAbort::Timeout) => SessionError::Timeout,
            IssueError::Aborted(ReauthAbort::Declined | ReauthAbort::Failed(_)) => {
                SessionError::ReauthDeclined
            }
            other => SessionError::Credential(other),
        }
    }
}
