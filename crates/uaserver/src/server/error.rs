//! Errors that end a single connection.

use std::io;

use common::{
    protocol::{CodecError, MessageType},
    EndpointError, MessageSecurityMode, StatusCode,
};
use thiserror::Error;

use crate::channel::ChannelError;

/// Why a connection was closed by the server. Each variant maps to the status
/// code sent in the `ERR` message.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{0} message not expected in this state")]
    UnexpectedMessage(MessageType),

    #[error("chunk of {size} bytes exceeds the {limit}-byte receive buffer")]
    ChunkTooLarge { size: u32, limit: u32 },

    #[error("message exceeds the {0} limit")]
    MessageTooLarge(&'static str),

    #[error("response of {size} bytes exceeds the peer's {limit}-byte limit")]
    ResponseTooLarge { size: usize, limit: u32 },

    #[error("OpenSecureChannel must fit in a single chunk")]
    ChunkedOpen,

    #[error("chunk for request {found} arrived while request {expected} is incomplete")]
    InterleavedChunks { expected: u32, found: u32 },

    #[error("endpoint url {0:?} is not served here")]
    EndpointUrl(String),

    #[error("peer buffer size {0} is below the minimum")]
    BufferTooSmall(u32),

    #[error("security mode {requested} does not match endpoint mode {endpoint}")]
    SecurityModeRejected {
        requested: MessageSecurityMode,
        endpoint: MessageSecurityMode,
    },

    #[error("client nonce of {0} bytes rejected")]
    NonceInvalid(usize),

    #[error("{0}")]
    RequestTypeInvalid(&'static str),

    #[error("server is shutting down")]
    ServerHalted,
}

impl ConnectionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectionError::Io(_) => StatusCode::BAD_COMMUNICATION_ERROR,
            ConnectionError::Codec(
                CodecError::UnknownMessageType(_) | CodecError::InvalidChunkType(_),
            ) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            ConnectionError::Codec(_) | ConnectionError::InterleavedChunks { .. } => {
                StatusCode::BAD_DECODING_ERROR
            }
            ConnectionError::Channel(e) => e.status_code(),
            ConnectionError::UnexpectedMessage(_) => StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            ConnectionError::ChunkTooLarge { .. } | ConnectionError::MessageTooLarge(_) => {
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE
            }
            ConnectionError::ResponseTooLarge { .. } | ConnectionError::ChunkedOpen => {
                StatusCode::BAD_ENCODING_LIMITS_EXCEEDED
            }
            ConnectionError::EndpointUrl(_) => StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
            ConnectionError::BufferTooSmall(_) => StatusCode::BAD_COMMUNICATION_ERROR,
            ConnectionError::SecurityModeRejected { .. } => StatusCode::BAD_SECURITY_MODE_REJECTED,
            ConnectionError::NonceInvalid(_) => StatusCode::BAD_NONCE_INVALID,
            ConnectionError::RequestTypeInvalid(_) => StatusCode::BAD_REQUEST_TYPE_INVALID,
            ConnectionError::ServerHalted => StatusCode::BAD_SERVER_HALTED,
        }
    }
}

impl From<ConnectionError> for EndpointError {
    fn from(e: ConnectionError) -> Self {
        EndpointError::Connection {
            status: e.status_code(),
            reason: e.to_string(),
        }
    }
}
