//! OPC UA TCP transport: the message header and the `HEL`/`ACK`/`ERR` messages.

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::codec::{read_string, read_u32, write_string};
use super::CodecError;
use crate::StatusCode;

/// Length of the header in front of every message chunk.
pub const HEADER_LEN: usize = 8;

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 0;

/// Smallest receive/send buffer either side may announce.
pub const MIN_BUFFER_SIZE: u32 = 8192;

/// Maximum endpoint URL length accepted in `HEL`.
pub const MAX_ENDPOINT_URL_LEN: usize = 4096;

/// Maximum reason length accepted in `ERR`.
pub const MAX_ERROR_REASON_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    OpenSecureChannel,
    Message,
    CloseSecureChannel,
}

impl MessageType {
    pub fn tag(self) -> &'static [u8; 3] {
        match self {
            MessageType::Hello => b"HEL",
            MessageType::Acknowledge => b"ACK",
            MessageType::Error => b"ERR",
            MessageType::OpenSecureChannel => b"OPN",
            MessageType::Message => b"MSG",
            MessageType::CloseSecureChannel => b"CLO",
        }
    }

    pub fn from_tag(tag: [u8; 3]) -> Result<Self, CodecError> {
        match &tag {
            b"HEL" => Ok(MessageType::Hello),
            b"ACK" => Ok(MessageType::Acknowledge),
            b"ERR" => Ok(MessageType::Error),
            b"OPN" => Ok(MessageType::OpenSecureChannel),
            b"MSG" => Ok(MessageType::Message),
            b"CLO" => Ok(MessageType::CloseSecureChannel),
            _ => Err(CodecError::UnknownMessageType(tag)),
        }
    }

    /// `true` for the message types carried inside a secure channel.
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            MessageType::OpenSecureChannel | MessageType::Message | MessageType::CloseSecureChannel
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tags are ASCII.
        f.write_str(std::str::from_utf8(self.tag()).unwrap_or("???"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Last (or only) chunk of a message.
    Final,
    /// More chunks follow.
    Intermediate,
    /// The sender abandoned the message.
    Abort,
}

impl ChunkType {
    pub fn as_byte(self) -> u8 {
        match self {
            ChunkType::Final => b'F',
            ChunkType::Intermediate => b'C',
            ChunkType::Abort => b'A',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            b'F' => Ok(ChunkType::Final),
            b'C' => Ok(ChunkType::Intermediate),
            b'A' => Ok(ChunkType::Abort),
            other => Err(CodecError::InvalidChunkType(other)),
        }
    }
}

/// The 8-byte header in front of every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    /// Total chunk length, header included.
    pub message_size: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType, chunk_type: ChunkType, message_size: u32) -> Self {
        Self {
            message_type,
            chunk_type,
            message_size,
        }
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for a short buffer, an unknown message type, an
    /// invalid chunk type, or a size smaller than the header itself.
    pub fn decode(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN - src.len(),
            });
        }
        let message_type = MessageType::from_tag([src[0], src[1], src[2]])?;
        let chunk_type = ChunkType::from_byte(src[3])?;
        let message_size = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        if (message_size as usize) < HEADER_LEN {
            return Err(CodecError::InvalidMessageSize(message_size));
        }
        Ok(Self {
            message_type,
            chunk_type,
            message_size,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.message_type.tag());
        dst.put_u8(self.chunk_type.as_byte());
        dst.put_u32_le(self.message_size);
    }

    /// Length of the chunk after the header.
    pub fn body_len(&self) -> usize {
        self.message_size as usize - HEADER_LEN
    }
}

/// Build a complete final chunk around `body`.
pub fn frame(message_type: MessageType, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    MessageHeader::new(
        message_type,
        ChunkType::Final,
        (HEADER_LEN + body.len()) as u32,
    )
    .encode(&mut buf);
    buf.put_slice(body);
    buf
}

/// `HEL`: the first message a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    /// 0 means no limit.
    pub max_message_size: u32,
    /// 0 means no limit.
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

impl Hello {
    /// Decode the body (everything after the header).
    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let src = &mut body;
        Ok(Self {
            protocol_version: read_u32(src)?,
            receive_buffer_size: read_u32(src)?,
            send_buffer_size: read_u32(src)?,
            max_message_size: read_u32(src)?,
            max_chunk_count: read_u32(src)?,
            endpoint_url: read_string(src, "endpoint url", MAX_ENDPOINT_URL_LEN)?
                .unwrap_or_default(),
        })
    }

    /// Encode as a complete message.
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(24 + self.endpoint_url.len());
        body.put_u32_le(self.protocol_version);
        body.put_u32_le(self.receive_buffer_size);
        body.put_u32_le(self.send_buffer_size);
        body.put_u32_le(self.max_message_size);
        body.put_u32_le(self.max_chunk_count);
        write_string(&mut body, Some(&self.endpoint_url));
        frame(MessageType::Hello, &body)
    }
}

/// `ACK`: the server's answer to `HEL` carrying the negotiated limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl Acknowledge {
    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let src = &mut body;
        Ok(Self {
            protocol_version: read_u32(src)?,
            receive_buffer_size: read_u32(src)?,
            send_buffer_size: read_u32(src)?,
            max_message_size: read_u32(src)?,
            max_chunk_count: read_u32(src)?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(20);
        body.put_u32_le(self.protocol_version);
        body.put_u32_le(self.receive_buffer_size);
        body.put_u32_le(self.send_buffer_size);
        body.put_u32_le(self.max_message_size);
        body.put_u32_le(self.max_chunk_count);
        frame(MessageType::Acknowledge, &body)
    }
}

/// `ERR`: sent right before the server closes a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error: StatusCode,
    pub reason: String,
}

impl ErrorMessage {
    pub fn new(error: StatusCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_ERROR_REASON_LEN {
            let mut cut = MAX_ERROR_REASON_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self { error, reason }
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let src = &mut body;
        Ok(Self {
            error: StatusCode(read_u32(src)?),
            reason: read_string(src, "error reason", MAX_ERROR_REASON_LEN)?.unwrap_or_default(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(8 + self.reason.len());
        body.put_u32_le(self.error.0);
        write_string(&mut body, Some(&self.reason));
        frame(MessageType::Error, &body)
    }
}
