//! `Basic256Sha256` security policy primitives.
//!
//! This module is free of socket and protocol-framing concerns. It provides
//! the asymmetric operations keyed by the server's long-term key pair
//! ([`SecurityPolicyInstance`]) and the per-channel symmetric operations
//! ([`SessionKeys`]) used by the secure-channel layer.
//!
//! # Algorithms
//!
//! | purpose               | algorithm                          |
//! |-----------------------|------------------------------------|
//! | asymmetric signature  | RSA PKCS#1 v1.5, SHA-256           |
//! | asymmetric encryption | RSA-OAEP, SHA-1                    |
//! | symmetric signature   | HMAC-SHA-256                       |
//! | symmetric encryption  | AES-256-CBC                        |
//! | key derivation        | P_SHA256                           |

pub mod policy;
pub mod session;

use common::EndpointError;
use thiserror::Error;

pub use policy::{Certificate, SecurityPolicyInstance};
pub use session::SessionKeys;

/// Length of every nonce exchanged under this policy.
pub const NONCE_LEN: usize = 32;

/// Errors produced by the policy layer.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unsupported security policy: {0}")]
    UnsupportedPolicy(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("certificate public key does not match the private key")]
    KeyMismatch,

    #[error("key length {bits} bits is outside the 2048..=4096 range")]
    KeyLength { bits: usize },

    #[error("nonce must be {NONCE_LEN} bytes, got {0}")]
    NonceLength(usize),

    #[error("plaintext of {len} bytes exceeds limit of {max}")]
    PlaintextTooLarge { len: usize, max: usize },

    #[error("ciphertext length {len} is not a multiple of the {block}-byte block")]
    CiphertextLength { len: usize, block: usize },

    #[error("buffer length {0} is not a multiple of the cipher block size")]
    BlockAlignment(usize),

    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("symmetric cipher operation failed")]
    Cipher,
}

impl From<PolicyError> for EndpointError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::UnsupportedPolicy(uri) => EndpointError::UnsupportedPolicy(uri),
            other => EndpointError::InvalidCredential(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::StatusCode;

    #[test]
    fn policy_errors_map_to_endpoint_errors() {
        let e: EndpointError = PolicyError::UnsupportedPolicy("urn:x".into()).into();
        assert_eq!(e.status_code(), StatusCode::BAD_SECURITY_POLICY_REJECTED);
        let e: EndpointError = PolicyError::KeyLength { bits: 1024 }.into();
        assert_eq!(e.status_code(), StatusCode::BAD_CERTIFICATE_INVALID);
        assert!(e.to_string().contains("1024"));
    }
}
