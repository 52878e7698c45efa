//! Interactive sessions on top of shared tunnels
//!
//! [`SessionBroker`] keeps at most one RDP or SSH session per instance. A new
//! session takes a tunnel reference from the [`TunnelBroker`](iap_tunnel::TunnelBroker)
//! and a short-lived credential from the [`CredentialIssuer`]; ending the
//! session gives the tunnel reference back.

pub mod broker;
pub mod error;
pub mod issuer;
pub mod session;

pub use broker::{SessionBroker, SessionEvent};
pub use error::SessionError;
pub use issuer::{Credential, CredentialIssuer, IssueError, RdpCredential, Secret, SshCredential};
pub use session::{Session, SessionContext, SessionEndReason, SessionInfo, SessionProtocol};
