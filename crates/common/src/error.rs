//! Common error types shared across crates.

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::{protocol::MessageSecurityMode, StatusCode};

/// Top-level endpoint error type.
///
/// Every variant except [`EndpointError::Connection`] is fatal during the
/// configuration phase. Variants map to OPC UA status codes:
/// - [`EndpointError::Io`] → `BadInternalError`
/// - [`EndpointError::InvalidCredential`] → `BadCertificateInvalid`
/// - [`EndpointError::UnsupportedPolicy`] → `BadSecurityPolicyRejected`
/// - [`EndpointError::UnsupportedMode`] → `BadSecurityModeRejected`
/// - [`EndpointError::Conflict`] → `BadEntryExists`
/// - [`EndpointError::Bind`] → `BadResourceUnavailable`
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A credential file could not be opened or read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Certificate or key is empty, malformed, or the two do not match.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The requested security policy URI is not implemented.
    #[error("unsupported security policy: {0}")]
    UnsupportedPolicy(String),

    /// The policy lacks the sign/encrypt capability the mode requires.
    #[error("security mode {mode} is not supported by policy {policy}")]
    UnsupportedMode {
        mode: MessageSecurityMode,
        policy: String,
    },

    /// An endpoint is already registered.
    #[error("endpoint conflict: {0}")]
    Conflict(String),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A single connection failed. Never fatal to the server.
    #[error("connection error ({status}): {reason}")]
    Connection { status: StatusCode, reason: String },

    /// A configuration value is malformed (e.g. an unparseable endpoint URL).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation is not allowed in the server's current lifecycle state.
    #[error("operation not allowed: {0}")]
    InvalidState(String),

    /// The listening socket failed after startup.
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
}

impl EndpointError {
    /// Returns the OPC UA status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EndpointError::Io { .. } => StatusCode::BAD_INTERNAL_ERROR,
            EndpointError::InvalidCredential(_) => StatusCode::BAD_CERTIFICATE_INVALID,
            EndpointError::UnsupportedPolicy(_) => StatusCode::BAD_SECURITY_POLICY_REJECTED,
            EndpointError::UnsupportedMode { .. } => StatusCode::BAD_SECURITY_MODE_REJECTED,
            EndpointError::Conflict(_) => StatusCode::BAD_ENTRY_EXISTS,
            EndpointError::Bind { .. } => StatusCode::BAD_RESOURCE_UNAVAILABLE,
            EndpointError::Connection { status, .. } => *status,
            EndpointError::InvalidConfiguration(_) => StatusCode::BAD_CONFIGURATION_ERROR,
            EndpointError::InvalidState(_) => StatusCode::BAD_INVALID_STATE,
            EndpointError::Listener(_) => StatusCode::BAD_COMMUNICATION_ERROR,
        }
    }

    /// Returns `true` if the error ends the process rather than one connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EndpointError::Connection { .. })
    }
}
