use iap_auth::{AuthorizationFailure, CredentialError, ReauthAbort};
use iap_proto::RejectCode;
use iap_transport::TransportError;
use thiserror::Error;

/// Relay connection errors
///
/// `Clone` so that the outcome of one connection attempt can be handed to
/// every caller that waited on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay denied access: {reason}")]
    Denied {
        reason: String,
        /// The grant was rejected because it expired or is no longer valid
        credential_expired: bool,
    },

    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    #[error("Relay refused to resume the session: {0}")]
    ResumptionRejected(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Connection closed")]
    Closed,
}

impl RelayError {
    /// Map a relay rejection to an error
    pub fn from_rejection(code: RejectCode, reason: String) -> Self {
        match code {
            RejectCode::Unauthorized => RelayError::Denied {
                reason,
                credential_expired: true,
            },
            RejectCode::Forbidden => RelayError::Denied {
                reason,
                credential_expired: false,
            },
            RejectCode::Unavailable => RelayError::Unavailable(reason),
            RejectCode::SessionUnknown => RelayError::ResumptionRejected(reason),
        }
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Unavailable(_))
    }
}

impl AuthorizationFailure for RelayError {
    fn is_authorization_expired(&self) -> bool {
        matches!(
            self,
            RelayError::Denied {
                credential_expired: true,
                ..
            }
        )
    }
}

impl From<ReauthAbort> for RelayError {
    fn from(abort: ReauthAbort) -> Self {
        match abort {
            ReauthAbort::Cancelled => RelayError::Cancelled,
            ReauthAbort::Timeout => RelayError::Timeout,
            ReauthAbort::Declined | ReauthAbort::Failed(_) => RelayError::Denied {
                reason: abort.to_string(),
                credential_expired: true,
            },
        }
    }
}

impl From<CredentialError> for RelayError {
    fn from(err: CredentialError) -> Self {
        let credential_expired = !matches!(err, CredentialError::ReauthorizationFailed(_));
        RelayError::Denied {
            reason: err.to_string(),
            credential_expired,
        }
    }
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConfigurationError(msg) => {
                RelayError::Unavailable(format!("misconfigured transport: {}", msg))
            }
            other => RelayError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_counts_as_expired() {
        let err = RelayError::from_rejection(RejectCode::Unauthorized, "token expired".into());
        assert!(err.is_authorization_expired());

        let err = RelayError::from_rejection(RejectCode::Forbidden, "policy".into());
        assert!(!err.is_authorization_expired());
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(RelayError::from_rejection(RejectCode::Unavailable, "busy".into()).is_transient());
        assert!(!RelayError::from_rejection(RejectCode::SessionUnknown, "gone".into()).is_transient());
        assert!(!RelayError::Timeout.is_transient());
    }

    #[test]
    fn test_missing_credential_triggers_reauthorization() {
        let err: RelayError = CredentialError::Unavailable("signed out".into()).into();
        assert!(err.is_authorization_expired());
    }
}
