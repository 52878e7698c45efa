//! Bearer credentials and the source that supplies them

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Short-lived bearer token presented to the relay
///
/// The token value never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token value, for putting on the wire
    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

/// Credential source errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("No credential available: {0}")]
    Unavailable(String),

    #[error("Credential expired")]
    Expired,

    #[error("Re-authorization failed: {0}")]
    ReauthorizationFailed(String),
}

/// Supplies bearer tokens and drives interactive re-authorization
///
/// Implemented by the surrounding application: the token usually comes from an
/// OAuth session, and `reauthorize` shows a sign-in prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current bearer token
    async fn access_token(&self) -> Result<BearerToken, CredentialError>;

    /// Ask the user to sign in again
    ///
    /// Returns `Ok(true)` if the user approved and a fresh token is now
    /// available, `Ok(false)` if the user declined. May wait indefinitely for
    /// user input; callers bound it with a timeout and a cancellation token.
    async fn reauthorize(&self) -> Result<bool, CredentialError>;
}

/// A fixed token that cannot be renewed
#[derive(Debug, Clone)]
pub struct StaticCredentialSource {
    token: BearerToken,
}

impl StaticCredentialSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: BearerToken::new(token),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn access_token(&self) -> Result<BearerToken, CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Unavailable("empty token".to_string()));
        }
        Ok(self.token.clone())
    }

    async fn reauthorize(&self) -> Result<bool, CredentialError> {
        tracing::warn!("Static credential cannot be renewed, declining re-authorization");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_redacted_in_debug() {
        let token = BearerToken::new("ya29.secret-value");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("secret-value"));
        assert_eq!(token.secret(), "ya29.secret-value");
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticCredentialSource::new("abc");
        assert_eq!(source.access_token().await.unwrap().secret(), "abc");
        assert!(!source.reauthorize().await.unwrap());
    }

    #[tokio::test]
    async fn test_static_source_empty_token() {
        let source = StaticCredentialSource::new("");
        assert!(matches!(
            source.access_token().await,
            Err(CredentialError::Unavailable(_))
        ));
    }
}
