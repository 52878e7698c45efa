//! Credentials and re-authorization for relay access
//!
//! Bearer tokens are short-lived. Everything that presents one (opening a
//! relay connection, issuing a Windows logon, authorizing an SSH key) runs
//! through [`ReauthRetryPolicy`], which turns an "expired grant" failure into
//! one interactive re-authorization followed by one retry.

pub mod credential;
pub mod retry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use credential::{BearerToken, CredentialError, CredentialSource, StaticCredentialSource};
pub use retry::{AuthorizationFailure, ReauthAbort, ReauthRetryPolicy};

// Re-export useful types
pub use async_trait::async_trait;
