//! Secure-conversation headers that follow the message header in `OPN`, `MSG`
//! and `CLO` chunks.

use bytes::BufMut;

use super::codec::{read_byte_string, read_string, read_u32, write_byte_string, write_string};
use super::CodecError;

/// Length of the sequence header.
pub const SEQUENCE_HEADER_LEN: usize = 8;

/// Upper bound for a sender certificate (or chain) in the asymmetric header.
pub const MAX_CERTIFICATE_LEN: usize = 32_768;

/// Maximum length of a security policy URI.
pub const MAX_POLICY_URI_LEN: usize = 255;

/// Sequence header at the start of every (decrypted) chunk body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            sequence_number: read_u32(src)?,
            request_id: read_u32(src)?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.sequence_number);
        dst.put_u32_le(self.request_id);
    }
}

/// Security header of an `OPN` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,
    /// DER certificate of the sender; `None` under the `None` policy.
    pub sender_certificate: Option<Vec<u8>>,
    /// SHA-1 thumbprint of the receiver's certificate.
    pub receiver_thumbprint: Option<Vec<u8>>,
}

impl AsymmetricSecurityHeader {
    pub fn decode(src: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            security_policy_uri: read_string(src, "security policy uri", MAX_POLICY_URI_LEN)?
                .unwrap_or_default(),
            sender_certificate: read_byte_string(src, "sender certificate", MAX_CERTIFICATE_LEN)?,
            receiver_thumbprint: read_byte_string(src, "receiver thumbprint", 20)?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        write_string(dst, Some(&self.security_policy_uri));
        write_byte_string(dst, self.sender_certificate.as_deref());
        write_byte_string(dst, self.receiver_thumbprint.as_deref());
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        12 + self.security_policy_uri.len()
            + self.sender_certificate.as_ref().map_or(0, Vec::len)
            + self.receiver_thumbprint.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn asymmetric_header_length_matches_encoding() {
        let header = AsymmetricSecurityHeader {
            security_policy_uri: crate::protocol::BASIC256SHA256_URI.into(),
            sender_certificate: Some(vec![0x30; 870]),
            receiver_thumbprint: None,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.encoded_len());
        let mut src = &buf[..];
        assert_eq!(AsymmetricSecurityHeader::decode(&mut src).unwrap(), header);
    }

    #[test]
    fn oversized_thumbprint_is_rejected() {
        let header = AsymmetricSecurityHeader {
            security_policy_uri: "x".into(),
            sender_certificate: None,
            receiver_thumbprint: Some(vec![0; 32]),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut src = &buf[..];
        assert!(AsymmetricSecurityHeader::decode(&mut src).is_err());
    }
}
