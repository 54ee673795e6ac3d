//! OPC UA TCP wire types.
//!
//! Only the transport layer (`HEL`/`ACK`/`ERR` and the 8-byte message header),
//! the secure-conversation headers, and the few service messages a secure
//! channel needs (`OpenSecureChannel`, `ServiceFault`) are modelled here. The
//! general OPC UA type system is not.
//!
//! All integers are little-endian, as in OPC UA Binary.

pub mod codec;
pub mod secure;
pub mod services;
pub mod transport;

use std::{fmt, str::FromStr};

use serde::Deserialize;
use thiserror::Error;

pub use codec::NodeId;
pub use secure::{AsymmetricSecurityHeader, SequenceHeader};
pub use transport::{Acknowledge, ChunkType, ErrorMessage, Hello, MessageHeader, MessageType};

/// Security policy URI for `Basic256Sha256`.
pub const BASIC256SHA256_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";

/// Security policy URI for `None`.
pub const NONE_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

/// Level of protection required for messages on a secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum MessageSecurityMode {
    None = 1,
    Sign = 2,
    SignAndEncrypt = 3,
}

impl MessageSecurityMode {
    /// Decode the OPC UA enumeration value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Sign),
            3 => Some(Self::SignAndEncrypt),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn requires_signing(self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn requires_encryption(self) -> bool {
        matches!(self, Self::SignAndEncrypt)
    }
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        })
    }
}

impl FromStr for MessageSecurityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalised.as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(format!("unknown message security mode: {s}")),
        }
    }
}

impl TryFrom<String> for MessageSecurityMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Errors produced while decoding wire data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of message: {needed} more bytes required")]
    Truncated { needed: usize },

    #[error("unknown message type {0:?}")]
    UnknownMessageType([u8; 3]),

    #[error("invalid chunk type {0:#04x}")]
    InvalidChunkType(u8),

    #[error("message size {0} is smaller than the message header")]
    InvalidMessageSize(u32),

    #[error("{field} length {len} exceeds limit of {max}")]
    LengthExceeded {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid length prefix {0}")]
    InvalidLength(i32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unsupported node id encoding {0:#04x}")]
    NodeIdEncoding(u8),

    #[error("unexpected type id {found:?}, expected {expected}")]
    UnexpectedTypeId { expected: u32, found: NodeId },

    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u32 },
}
