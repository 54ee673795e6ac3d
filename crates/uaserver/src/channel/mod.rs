//! Secure channel state and chunk protection.
//!
//! A [`SecureChannel`] lives inside one connection task and owns that
//! channel's [`SessionKeys`]; nothing here is shared between connections.

pub mod chunk;

use std::time::{Duration, Instant};

use common::{
    protocol::{codec::date_time_now, services::ChannelSecurityToken, CodecError},
    MessageSecurityMode, StatusCode,
};
use thiserror::Error;

use crate::crypto::{PolicyError, SessionKeys};

pub use chunk::{open_asymmetric, open_symmetric, peek_symmetric, seal_asymmetric, seal_symmetric, OpenedChunk, SymmetricSecurity};

/// Shortest token lifetime granted, in milliseconds.
pub const MIN_TOKEN_LIFETIME_MS: u32 = 10_000;

/// Longest token lifetime granted, in milliseconds. Also used when the client
/// asks for 0.
pub const MAX_TOKEN_LIFETIME_MS: u32 = 3_600_000;

/// Sequence numbers wrap once they pass `u32::MAX - SEQUENCE_WRAP_WINDOW`.
const SEQUENCE_WRAP_WINDOW: u32 = 1024;

/// Errors raised while protecting or opening chunks.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("malformed chunk: {0}")]
    Codec(#[from] CodecError),

    #[error("security policy {0} rejected")]
    PolicyRejected(String),

    #[error("certificate rejected: {0}")]
    CertificateInvalid(String),

    #[error("security checks failed: {0}")]
    SecurityChecksFailed(&'static str),

    #[error("secure channel {0} is unknown")]
    ChannelUnknown(u32),

    #[error("security token {0} is unknown or expired")]
    TokenUnknown(u32),

    #[error("sequence number {received} received, expected {expected}")]
    SequenceNumber { received: u32, expected: u32 },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ChannelError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChannelError::Codec(_) => StatusCode::BAD_DECODING_ERROR,
            ChannelError::PolicyRejected(_) => StatusCode::BAD_SECURITY_POLICY_REJECTED,
            ChannelError::CertificateInvalid(_) => StatusCode::BAD_CERTIFICATE_INVALID,
            ChannelError::SecurityChecksFailed(_) | ChannelError::Policy(_) => {
                StatusCode::BAD_SECURITY_CHECKS_FAILED
            }
            ChannelError::ChannelUnknown(_) => StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN,
            ChannelError::TokenUnknown(_) => StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
            ChannelError::SequenceNumber { .. } => StatusCode::BAD_SEQUENCE_NUMBER_INVALID,
        }
    }
}

/// A security token and the keys derived for it.
#[derive(Debug)]
struct Token {
    id: u32,
    created_at: i64,
    issued: Instant,
    lifetime: Duration,
    keys: SessionKeys,
}

impl Token {
    /// Tokens stay usable for a quarter of their lifetime past expiry, giving
    /// the client time to renew.
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.issued) > self.lifetime + self.lifetime / 4
    }
}

/// Server side of one secure channel.
#[derive(Debug)]
pub struct SecureChannel {
    id: u32,
    security_mode: MessageSecurityMode,
    current: Option<Token>,
    previous: Option<Token>,
    next_token_id: u32,
    send_sequence: u32,
    last_received: Option<u32>,
}

impl SecureChannel {
    pub fn new(id: u32, security_mode: MessageSecurityMode) -> Self {
        Self {
            id,
            security_mode,
            current: None,
            previous: None,
            next_token_id: 1,
            send_sequence: 1,
            last_received: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }

    /// `true` once a token has been issued.
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Install new keys under a new token id. The token they replace stays
    /// usable until it expires, for chunks the client sent before it saw the
    /// renewal.
    pub fn issue_token(&mut self, keys: SessionKeys, requested_lifetime_ms: u32) -> ChannelSecurityToken {
        let lifetime_ms = match requested_lifetime_ms {
            0 => MAX_TOKEN_LIFETIME_MS,
            ms => ms.clamp(MIN_TOKEN_LIFETIME_MS, MAX_TOKEN_LIFETIME_MS),
        };
        let token = Token {
            id: self.next_token_id,
            created_at: date_time_now(),
            issued: Instant::now(),
            lifetime: Duration::from_millis(u64::from(lifetime_ms)),
            keys,
        };
        self.next_token_id = self.next_token_id.wrapping_add(1).max(1);

        let issued = ChannelSecurityToken {
            channel_id: self.id,
            token_id: token.id,
            created_at: token.created_at,
            revised_lifetime: lifetime_ms,
        };
        self.previous = self.current.replace(token);
        issued
    }

    /// Protection for chunks carrying `token_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::TokenUnknown`] if the token is neither the
    /// current nor the previous one, or has expired.
    pub fn security(&self, token_id: u32) -> Result<SymmetricSecurity<'_>, ChannelError> {
        let now = Instant::now();
        let token = [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|t| t.id == token_id && !t.is_expired(now))
            .ok_or(ChannelError::TokenUnknown(token_id))?;
        Ok(SymmetricSecurity {
            channel_id: self.id,
            token_id: token.id,
            mode: self.security_mode,
            keys: &token.keys,
        })
    }

    /// Sequence number for the next chunk sent.
    pub fn next_send_sequence(&mut self) -> u32 {
        let n = self.send_sequence;
        self.send_sequence = if n >= u32::MAX - SEQUENCE_WRAP_WINDOW { 1 } else { n + 1 };
        n
    }

    /// Check that `received` follows the previous chunk's sequence number.
    /// The first chunk may start anywhere.
    pub fn check_received_sequence(&mut self, received: u32) -> Result<(), ChannelError> {
        if let Some(last) = self.last_received {
            let expected = last.wrapping_add(1);
            let wrapped = last >= u32::MAX - SEQUENCE_WRAP_WINDOW && received < SEQUENCE_WRAP_WINDOW;
            if received != expected && !wrapped {
                return Err(ChannelError::SequenceNumber { received, expected });
            }
        }
        self.last_received = Some(received);
        Ok(())
    }
}
