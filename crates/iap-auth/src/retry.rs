//! Re-authorize-and-retry policy
//!
//! An operation that presents a bearer token may fail because the grant has
//! expired. [`ReauthRetryPolicy::run`] catches exactly that failure, asks the
//! [`CredentialSource`] to re-authorize once, and retries the operation once.
//! Every other outcome is passed through untouched.

use crate::credential::CredentialSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can say whether they were caused by an expired credential
pub trait AuthorizationFailure {
    fn is_authorization_expired(&self) -> bool;
}

/// Why a re-authorization did not lead to a retry
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReauthAbort {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Re-authorization timed out")]
    Timeout,

    #[error("Re-authorization declined")]
    Declined,

    #[error("Re-authorization failed: {0}")]
    Failed(String),
}

/// Runs operations with at most one re-authorization and one retry
#[derive(Clone)]
pub struct ReauthRetryPolicy {
    credentials: Arc<dyn CredentialSource>,
    reauth_timeout: Duration,
}

impl std::fmt::Debug for ReauthRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReauthRetryPolicy")
            .field("reauth_timeout", &self.reauth_timeout)
            .finish()
    }
}

impl ReauthRetryPolicy {
    /// Default bound on how long the user has to complete a sign-in prompt
    pub const DEFAULT_REAUTH_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            credentials,
            reauth_timeout: Self::DEFAULT_REAUTH_TIMEOUT,
        }
    }

    pub fn with_reauth_timeout(mut self, timeout: Duration) -> Self {
        self.reauth_timeout = timeout;
        self
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialSource> {
        &self.credentials
    }

    /// Run `operation`, re-authorizing and retrying once if it fails with an
    /// expired credential
    ///
    /// The operation is a factory so that the retry gets a fresh future (and
    /// with it a fresh token). A second expiry is returned to the caller as is.
    /// Cancellation drops whatever is in flight and yields
    /// [`ReauthAbort::Cancelled`].
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AuthorizationFailure + From<ReauthAbort> + std::fmt::Display,
    {
        let error = match Self::attempt(cancel, operation()).await? {
            Ok(value) => return Ok(value),
            Err(e) if e.is_authorization_expired() => e,
            Err(e) => return Err(e),
        };

        warn!("Authorization expired ({}), requesting re-authorization", error);
        self.reauthorize(cancel).await?;

        info!("Re-authorized, retrying operation");
        match Self::attempt(cancel, operation()).await? {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("Retry after re-authorization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn attempt<T, E, Fut>(
        cancel: &CancellationToken,
        fut: Fut,
    ) -> Result<Result<T, E>, ReauthAbort>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReauthAbort::Cancelled),
            result = fut => Ok(result),
        }
    }

    async fn reauthorize(&self, cancel: &CancellationToken) -> Result<(), ReauthAbort> {
        let prompt = tokio::time::timeout(self.reauth_timeout, self.credentials.reauthorize());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReauthAbort::Cancelled),
            outcome = prompt => outcome,
        };

        match outcome {
            Err(_) => {
                warn!(
                    "Re-authorization not completed within {:?}",
                    self.reauth_timeout
                );
                Err(ReauthAbort::Timeout)
            }
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                info!("User declined re-authorization");
                Err(ReauthAbort::Declined)
            }
            Ok(Err(e)) => Err(ReauthAbort::Failed(e.to_string())),
        }
    }
}
