//! The service messages a secure channel needs on its own: request/response
//! headers, `OpenSecureChannel`, and `ServiceFault`.

use bytes::BufMut;

use super::codec::{
    read_byte_string, read_i64, read_node_id, read_string, read_u32, skip_diagnostic_info,
    skip_extension_object, skip_string_array, write_byte_string, write_empty_extension_object,
    write_node_id, write_string, NodeId, MAX_STRING_LEN,
};
use super::{CodecError, MessageSecurityMode};
use crate::StatusCode;

/// Binary encoding ids (namespace 0) of the messages handled here.
pub mod type_ids {
    pub const SERVICE_FAULT: u32 = 397;
    pub const OPEN_SECURE_CHANNEL_REQUEST: u32 = 446;
    pub const OPEN_SECURE_CHANNEL_RESPONSE: u32 = 449;
    pub const CLOSE_SECURE_CHANNEL_REQUEST: u32 = 452;
}

/// Upper bound for a client nonce.
pub const MAX_NONCE_LEN: usize = 128;

fn expect_type_id(src: &mut &[u8], expected: u32) -> Result<(), CodecError> {
    let found = read_node_id(src)?;
    if found.as_ns0_numeric() != Some(expected) {
        return Err(CodecError::UnexpectedTypeId { expected, found });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub authentication_token: NodeId,
    pub timestamp: i64,
    pub request_handle: u32,
    pub return_diagnostics: u32,
    pub audit_entry_id: Option<String>,
    pub timeout_hint: u32,
}

impl RequestHeader {
    pub fn new(request_handle: u32, timestamp: i64) -> Self {
        Self {
            authentication_token: NodeId::NULL,
            timestamp,
            request_handle,
            return_diagnostics: 0,
            audit_entry_id: None,
            timeout_hint: 0,
        }
    }

    pub fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        let header = Self {
            authentication_token: read_node_id(src)?,
            timestamp: read_i64(src)?,
            request_handle: read_u32(src)?,
            return_diagnostics: read_u32(src)?,
            audit_entry_id: read_string(src, "audit entry id", MAX_STRING_LEN)?,
            timeout_hint: read_u32(src)?,
        };
        skip_extension_object(src)?;
        Ok(header)
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        write_node_id(dst, &self.authentication_token);
        dst.put_i64_le(self.timestamp);
        dst.put_u32_le(self.request_handle);
        dst.put_u32_le(self.return_diagnostics);
        write_string(dst, self.audit_entry_id.as_deref());
        dst.put_u32_le(self.timeout_hint);
        write_empty_extension_object(dst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub timestamp: i64,
    pub request_handle: u32,
    pub service_result: StatusCode,
}

impl ResponseHeader {
    pub fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        let header = Self {
            timestamp: read_i64(src)?,
            request_handle: read_u32(src)?,
            service_result: StatusCode(read_u32(src)?),
        };
        skip_diagnostic_info(src)?;
        skip_string_array(src)?;
        skip_extension_object(src)?;
        Ok(header)
    }

    /// Encode with empty diagnostics, a null string table and no additional header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_i64_le(self.timestamp);
        dst.put_u32_le(self.request_handle);
        dst.put_u32_le(self.service_result.0);
        dst.put_u8(0x00);
        dst.put_i32_le(-1);
        write_empty_extension_object(dst);
    }
}

/// Read the type id and request header in front of any service request.
pub fn peek_request(mut body: &[u8]) -> Result<(NodeId, RequestHeader), CodecError> {
    let src = &mut body;
    let type_id = read_node_id(src)?;
    let header = RequestHeader::decode(src)?;
    Ok((type_id, header))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityTokenRequestType {
    Issue = 0,
    Renew = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSecureChannelRequest {
    pub request_header: RequestHeader,
    pub client_protocol_version: u32,
    pub request_type: SecurityTokenRequestType,
    pub security_mode: MessageSecurityMode,
    pub client_nonce: Vec<u8>,
    /// Milliseconds.
    pub requested_lifetime: u32,
}

impl OpenSecureChannelRequest {
    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let src = &mut body;
        expect_type_id(src, type_ids::OPEN_SECURE_CHANNEL_REQUEST)?;
        let request_header = RequestHeader::decode(src)?;
        let client_protocol_version = read_u32(src)?;
        let request_type = match read_u32(src)? {
            0 => SecurityTokenRequestType::Issue,
            1 => SecurityTokenRequestType::Renew,
            value => {
                return Err(CodecError::InvalidValue {
                    field: "request type",
                    value,
                })
            }
        };
        let mode = read_u32(src)?;
        let security_mode = MessageSecurityMode::from_u32(mode).ok_or(CodecError::InvalidValue {
            field: "security mode",
            value: mode,
        })?;
        let client_nonce = read_byte_string(src, "client nonce", MAX_NONCE_LEN)?.unwrap_or_default();
        let requested_lifetime = read_u32(src)?;
        Ok(Self {
            request_header,
            client_protocol_version,
            request_type,
            security_mode,
            client_nonce,
            requested_lifetime,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        write_node_id(dst, &NodeId::numeric(type_ids::OPEN_SECURE_CHANNEL_REQUEST));
        self.request_header.encode(dst);
        dst.put_u32_le(self.client_protocol_version);
        dst.put_u32_le(self.request_type as u32);
        dst.put_u32_le(self.security_mode.as_u32());
        write_byte_string(dst, Some(&self.client_nonce));
        dst.put_u32_le(self.requested_lifetime);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: i64,
    /// Milliseconds.
    pub revised_lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSecureChannelResponse {
    pub response_header: ResponseHeader,
    pub server_protocol_version: u32,
    pub security_token: ChannelSecurityToken,
    pub server_nonce: Vec<u8>,
}

impl OpenSecureChannelResponse {
    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let src = &mut body;
        expect_type_id(src, type_ids::OPEN_SECURE_CHANNEL_RESPONSE)?;
        Ok(Self {
            response_header: ResponseHeader::decode(src)?,
            server_protocol_version: read_u32(src)?,
            security_token: ChannelSecurityToken {
                channel_id: read_u32(src)?,
                token_id: read_u32(src)?,
                created_at: read_i64(src)?,
                revised_lifetime: read_u32(src)?,
            },
            server_nonce: read_byte_string(src, "server nonce", MAX_NONCE_LEN)?.unwrap_or_default(),
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        write_node_id(dst, &NodeId::numeric(type_ids::OPEN_SECURE_CHANNEL_RESPONSE));
        self.response_header.encode(dst);
        dst.put_u32_le(self.server_protocol_version);
        dst.put_u32_le(self.security_token.channel_id);
        dst.put_u32_le(self.security_token.token_id);
        dst.put_i64_le(self.security_token.created_at);
        dst.put_u32_le(self.security_token.revised_lifetime);
        write_byte_string(dst, Some(&self.server_nonce));
    }
}

/// Response sent for any request the server does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceFault {
    pub response_header: ResponseHeader,
}

impl ServiceFault {
    pub fn decode(mut body: &[u8]) -> Result<Self, CodecError> {
        let src = &mut body;
        expect_type_id(src, type_ids::SERVICE_FAULT)?;
        Ok(Self {
            response_header: ResponseHeader::decode(src)?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        write_node_id(dst, &NodeId::numeric(type_ids::SERVICE_FAULT));
        self.response_header.encode(dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn request(nonce: Vec<u8>) -> OpenSecureChannelRequest {
        OpenSecureChannelRequest {
            request_header: RequestHeader::new(7, 0),
            client_protocol_version: 0,
            request_type: SecurityTokenRequestType::Issue,
            security_mode: MessageSecurityMode::SignAndEncrypt,
            client_nonce: nonce,
            requested_lifetime: 600_000,
        }
    }

    #[test]
    fn open_request_decodes_what_a_client_sends() {
        let mut buf = BytesMut::new();
        request(vec![0xAB; 32]).encode(&mut buf);
        let decoded = OpenSecureChannelRequest::decode(&buf).unwrap();
        assert_eq!(decoded.request_header.request_handle, 7);
        assert_eq!(decoded.client_nonce.len(), 32);
        assert_eq!(decoded.security_mode, MessageSecurityMode::SignAndEncrypt);
    }

    #[test]
    fn open_request_rejects_unknown_mode() {
        let mut buf = BytesMut::new();
        request(Vec::new()).encode(&mut buf);
        // With an empty nonce the mode is followed by the nonce length and the lifetime.
        let mode_offset = buf.len() - 4 - 4 - 4;
        buf[mode_offset..mode_offset + 4].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            OpenSecureChannelRequest::decode(&buf),
            Err(CodecError::InvalidValue {
                field: "security mode",
                value: 9
            })
        );
    }

    #[test]
    fn open_request_rejects_wrong_type_id() {
        let mut buf = BytesMut::new();
        ServiceFault {
            response_header: ResponseHeader {
                timestamp: 0,
                request_handle: 1,
                service_result: StatusCode::GOOD,
            },
        }
        .encode(&mut buf);
        assert!(matches!(
            OpenSecureChannelRequest::decode(&buf),
            Err(CodecError::UnexpectedTypeId { expected: 446, .. })
        ));
    }

    #[test]
    fn peek_request_reads_handle() {
        let mut buf = BytesMut::new();
        write_node_id(&mut buf, &NodeId::numeric(631)); // ReadRequest
        RequestHeader::new(99, 0).encode(&mut buf);
        let (type_id, header) = peek_request(&buf).unwrap();
        assert_eq!(type_id.as_ns0_numeric(), Some(631));
        assert_eq!(header.request_handle, 99);
    }

    #[test]
    fn service_fault_carries_result() {
        let mut buf = BytesMut::new();
        ServiceFault {
            response_header: ResponseHeader {
                timestamp: 1,
                request_handle: 3,
                service_result: StatusCode::BAD_SERVICE_UNSUPPORTED,
            },
        }
        .encode(&mut buf);
        let fault = ServiceFault::decode(&buf).unwrap();
        assert_eq!(fault.response_header.request_handle, 3);
        assert_eq!(
            fault.response_header.service_result,
            StatusCode::BAD_SERVICE_UNSUPPORTED
        );
    }
}
