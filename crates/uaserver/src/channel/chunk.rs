//! Protection of individual chunks.
//!
//! `OPN` chunks are protected with the long-term keys: signed with the
//! sender's private key and encrypted to the receiver's certificate. `MSG`
//! and `CLO` chunks use the channel's [`SessionKeys`] according to the
//! message security mode. Both directions are implemented so either side of a
//! channel can be driven from here.

use bytes::{BufMut, BytesMut};
use common::{
    protocol::{
        codec::read_u32,
        secure::SEQUENCE_HEADER_LEN,
        transport::HEADER_LEN,
        AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SequenceHeader,
    },
    MessageSecurityMode,
};

use super::ChannelError;
use crate::crypto::{
    session::{BLOCK_LEN, SIGNATURE_LEN},
    Certificate, SecurityPolicyInstance, SessionKeys,
};

/// Message header, channel id and token id.
const SYMMETRIC_PREFIX_LEN: usize = HEADER_LEN + 8;

/// A chunk with its protection removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedChunk {
    pub chunk_type: ChunkType,
    pub channel_id: u32,
    pub sequence: SequenceHeader,
    pub body: Vec<u8>,
}

/// The symmetric protection applied to `MSG`/`CLO` chunks of one channel.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricSecurity<'a> {
    pub channel_id: u32,
    pub token_id: u32,
    pub mode: MessageSecurityMode,
    pub keys: &'a SessionKeys,
}

/// Padding bytes for `len` bytes of content so the total is a multiple of
/// `block`. The layout is the padding size byte, that many copies of it, and
/// an extra high-order size byte when `extra` is set.
fn padding(len: usize, block: usize, extra: bool) -> Vec<u8> {
    let overhead = 1 + usize::from(extra);
    let size = (block - (len + overhead) % block) % block;
    let mut pad = vec![(size & 0xFF) as u8; size + 1];
    if extra {
        pad.push((size >> 8) as u8);
    }
    pad
}

/// Length of the content before the padding, given the decrypted bytes that
/// end with the padding.
fn strip_padding(content: &[u8], extra: bool) -> Result<usize, ChannelError> {
    let invalid = ChannelError::SecurityChecksFailed("invalid padding");
    let (size, trailer) = if extra {
        let [.., low, high] = content else { return Err(invalid) };
        (usize::from(*high) << 8 | usize::from(*low), 2)
    } else {
        let [.., low] = content else { return Err(invalid) };
        (usize::from(*low), 1)
    };
    let pad_len = size + trailer;
    if content.len() < pad_len + SEQUENCE_HEADER_LEN {
        return Err(invalid);
    }
    let body_end = content.len() - pad_len;
    let low = (size & 0xFF) as u8;
    if content[body_end..body_end + size + 1].iter().any(|b| *b != low) {
        return Err(invalid);
    }
    Ok(body_end)
}

/// Build a signed and encrypted `OPN` chunk from `local` to the holder of
/// `remote`.
pub fn seal_asymmetric(
    channel_id: u32,
    sequence: SequenceHeader,
    body: &[u8],
    local: &SecurityPolicyInstance,
    remote: &Certificate,
) -> Result<BytesMut, ChannelError> {
    let security_header = AsymmetricSecurityHeader {
        security_policy_uri: local.uri().to_owned(),
        sender_certificate: Some(local.certificate_der().to_vec()),
        receiver_thumbprint: Some(remote.thumbprint().to_vec()),
    };
    let plain_block = remote.plaintext_block_size();
    let signature_len = local.key_len();

    let content_len = SEQUENCE_HEADER_LEN + body.len();
    let pad = padding(content_len + signature_len, plain_block, plain_block > 256);
    let plaintext_len = content_len + pad.len() + signature_len;
    let encrypted_len = plaintext_len / plain_block * remote.key_len();

    let prefix_len = HEADER_LEN + 4 + security_header.encoded_len();
    let message_size = prefix_len + encrypted_len;

    let mut buf = BytesMut::with_capacity(prefix_len + plaintext_len);
    MessageHeader::new(MessageType::OpenSecureChannel, ChunkType::Final, message_size as u32)
        .encode(&mut buf);
    buf.put_u32_le(channel_id);
    security_header.encode(&mut buf);
    sequence.encode(&mut buf);
    buf.put_slice(body);
    buf.put_slice(&pad);
    let signature = local.sign(&buf)?;
    buf.put_slice(&signature);

    let ciphertext = local.encrypt_for(remote, &buf[prefix_len..])?;
    buf.truncate(prefix_len);
    buf.put_slice(&ciphertext);
    debug_assert_eq!(buf.len(), message_size);
    Ok(buf)
}

/// Check and remove the protection of an `OPN` chunk addressed to `local`.
///
/// Returns the opened chunk and the sender's certificate.
///
/// # Errors
///
/// - [`ChannelError::PolicyRejected`] for a policy URI other than `local`'s.
/// - [`ChannelError::CertificateInvalid`] for a missing or unparseable sender
///   certificate or a receiver thumbprint that is not `local`'s.
/// - [`ChannelError::SecurityChecksFailed`] if decryption, the signature or
///   the padding do not check out.
pub fn open_asymmetric(
    chunk: &[u8],
    local: &SecurityPolicyInstance,
) -> Result<(OpenedChunk, Certificate), ChannelError> {
    let header = MessageHeader::decode(chunk)?;
    let mut src = &chunk[HEADER_LEN..];
    let channel_id = read_u32(&mut src)?;
    let security_header = AsymmetricSecurityHeader::decode(&mut src)?;

    if security_header.security_policy_uri != local.uri() {
        return Err(ChannelError::PolicyRejected(security_header.security_policy_uri));
    }
    if security_header.receiver_thumbprint.as_deref() != Some(&local.thumbprint()[..]) {
        return Err(ChannelError::CertificateInvalid(
            "receiver thumbprint does not match the server certificate".into(),
        ));
    }
    let sender = security_header
        .sender_certificate
        .as_deref()
        .ok_or_else(|| ChannelError::CertificateInvalid("sender certificate missing".into()))?;
    let sender = Certificate::parse(sender).map_err(|e| ChannelError::CertificateInvalid(e.to_string()))?;

    let prefix_len = chunk.len() - src.len();
    let plaintext = local
        .decrypt(src)
        .map_err(|_| ChannelError::SecurityChecksFailed("decryption failed"))?;

    let signature_len = sender.key_len();
    if plaintext.len() < SEQUENCE_HEADER_LEN + 1 + signature_len {
        return Err(ChannelError::SecurityChecksFailed("chunk too short"));
    }
    let (content, signature) = plaintext.split_at(plaintext.len() - signature_len);
    let mut signed = Vec::with_capacity(prefix_len + content.len());
    signed.extend_from_slice(&chunk[..prefix_len]);
    signed.extend_from_slice(content);
    if !local.verify_with(&sender, &signed, signature) {
        return Err(ChannelError::SecurityChecksFailed("signature invalid"));
    }

    let body_end = strip_padding(content, local.plaintext_block_size() > 256)?;
    let sequence = SequenceHeader::decode(&mut &content[..SEQUENCE_HEADER_LEN])?;
    Ok((
        OpenedChunk {
            chunk_type: header.chunk_type,
            channel_id,
            sequence,
            body: content[SEQUENCE_HEADER_LEN..body_end].to_vec(),
        },
        sender,
    ))
}

/// Read the channel id and token id of a symmetric chunk without opening it.
pub fn peek_symmetric(chunk: &[u8]) -> Result<(u32, u32), ChannelError> {
    let mut src = chunk.get(HEADER_LEN..).unwrap_or_default();
    let channel_id = read_u32(&mut src)?;
    let token_id = read_u32(&mut src)?;
    Ok((channel_id, token_id))
}

/// Build a `MSG` or `CLO` chunk protected according to `security.mode`.
pub fn seal_symmetric(
    security: &SymmetricSecurity<'_>,
    message_type: MessageType,
    chunk_type: ChunkType,
    sequence: SequenceHeader,
    body: &[u8],
) -> Result<BytesMut, ChannelError> {
    let sign = security.mode.requires_signing();
    let encrypt = security.mode.requires_encryption();

    let content_len = SEQUENCE_HEADER_LEN + body.len();
    let signature_len = if sign { SIGNATURE_LEN } else { 0 };
    let pad = if encrypt {
        padding(content_len + signature_len, BLOCK_LEN, false)
    } else {
        Vec::new()
    };
    let message_size = SYMMETRIC_PREFIX_LEN + content_len + pad.len() + signature_len;

    let mut buf = BytesMut::with_capacity(message_size);
    MessageHeader::new(message_type, chunk_type, message_size as u32).encode(&mut buf);
    buf.put_u32_le(security.channel_id);
    buf.put_u32_le(security.token_id);
    sequence.encode(&mut buf);
    buf.put_slice(body);
    buf.put_slice(&pad);
    if sign {
        let signature = security.keys.sign(&buf);
        buf.put_slice(&signature);
    }
    if encrypt {
        security.keys.encrypt(&mut buf[SYMMETRIC_PREFIX_LEN..])?;
    }
    Ok(buf)
}

/// Check and remove the protection of a `MSG` or `CLO` chunk.
///
/// # Errors
///
/// - [`ChannelError::ChannelUnknown`] or [`ChannelError::TokenUnknown`] if
///   the chunk does not carry `security`'s ids.
/// - [`ChannelError::SecurityChecksFailed`] if decryption, the signature or
///   the padding do not check out.
pub fn open_symmetric(chunk: &[u8], security: &SymmetricSecurity<'_>) -> Result<OpenedChunk, ChannelError> {
    let header = MessageHeader::decode(chunk)?;
    let (channel_id, token_id) = peek_symmetric(chunk)?;
    if channel_id != security.channel_id {
        return Err(ChannelError::ChannelUnknown(channel_id));
    }
    if token_id != security.token_id {
        return Err(ChannelError::TokenUnknown(token_id));
    }

    let mut data = chunk.to_vec();
    if security.mode.requires_encryption() {
        security
            .keys
            .decrypt(&mut data[SYMMETRIC_PREFIX_LEN..])
            .map_err(|_| ChannelError::SecurityChecksFailed("decryption failed"))?;
    }

    let mut content_end = data.len();
    if security.mode.requires_signing() {
        if data.len() < SYMMETRIC_PREFIX_LEN + SEQUENCE_HEADER_LEN + SIGNATURE_LEN {
            return Err(ChannelError::SecurityChecksFailed("chunk too short"));
        }
        content_end -= SIGNATURE_LEN;
        if !security.keys.verify(&data[..content_end], &data[content_end..]) {
            return Err(ChannelError::SecurityChecksFailed("signature invalid"));
        }
    }

    let content = &data[SYMMETRIC_PREFIX_LEN..content_end];
    let body_end = if security.mode.requires_encryption() {
        strip_padding(content, false)?
    } else {
        content.len()
    };
    let mut src = content;
    let sequence = SequenceHeader::decode(&mut src)?;
    Ok(OpenedChunk {
        chunk_type: header.chunk_type,
        channel_id,
        sequence,
        body: content[SEQUENCE_HEADER_LEN..body_end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::policy::tests::{client_policy, server_policy};

    fn seq(n: u32) -> SequenceHeader {
        SequenceHeader {
            sequence_number: n,
            request_id: n + 100,
        }
    }

    fn keys() -> (SessionKeys, SessionKeys) {
        let server = SessionKeys::derive(&[1; 32], &[2; 32]).unwrap();
        let client = SessionKeys::derive(&[2; 32], &[1; 32]).unwrap();
        (server, client)
    }

    #[test]
    fn padding_fills_block() {
        for len in [0, 1, 15, 16, 200, 213, 214] {
            let pad = padding(len, 16, false);
            assert_eq!((len + pad.len()) % 16, 0, "len {len}");
            assert_eq!(strip_padding(&[vec![0; 8], vec![0; len], pad].concat(), false).unwrap(), 8 + len);
        }
        let pad = padding(10, 470, true);
        assert_eq!((10 + pad.len()) % 470, 0);
        assert_eq!(pad[pad.len() - 1], 1);
    }

    #[test]
    fn asymmetric_chunk_travels_both_ways() {
        let server = server_policy();
        let client = client_policy();

        let request = seal_asymmetric(0, seq(1), b"open request", &client, server.certificate()).unwrap();
        let header = MessageHeader::decode(&request).unwrap();
        assert_eq!(header.message_size as usize, request.len());

        let (opened, sender) = open_asymmetric(&request, &server).unwrap();
        assert_eq!(opened.body, b"open request");
        assert_eq!(opened.sequence, seq(1));
        assert_eq!(opened.chunk_type, ChunkType::Final);
        assert_eq!(sender.thumbprint(), client.thumbprint());

        let response = seal_asymmetric(7, seq(1), b"open response", &server, &sender).unwrap();
        let (opened, sender) = open_asymmetric(&response, &client).unwrap();
        assert_eq!(opened.channel_id, 7);
        assert_eq!(opened.body, b"open response");
        assert_eq!(sender.thumbprint(), server.thumbprint());
    }

    #[test]
    fn asymmetric_chunk_for_someone_else_is_rejected() {
        let server = server_policy();
        let client = client_policy();
        let chunk = seal_asymmetric(0, seq(1), b"x", &server, client.certificate()).unwrap();
        assert!(matches!(
            open_asymmetric(&chunk, &server),
            Err(ChannelError::CertificateInvalid(_))
        ));
    }

    #[test]
    fn tampered_asymmetric_chunk_fails_checks() {
        let server = server_policy();
        let client = client_policy();
        let mut chunk = seal_asymmetric(0, seq(1), b"x", &client, server.certificate()).unwrap();
        let last = chunk.len() - 1;
        chunk[last] ^= 0xFF;
        assert!(matches!(
            open_asymmetric(&chunk, &server),
            Err(ChannelError::SecurityChecksFailed(_))
        ));
    }

    #[test]
    fn asymmetric_chunk_with_other_policy_is_rejected() {
        let server = server_policy();
        let header = AsymmetricSecurityHeader {
            security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss".into(),
            sender_certificate: None,
            receiver_thumbprint: None,
        };
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        header.encode(&mut body);
        let chunk = common::protocol::transport::frame(MessageType::OpenSecureChannel, &body);
        assert!(matches!(
            open_asymmetric(&chunk, &server),
            Err(ChannelError::PolicyRejected(uri)) if uri.ends_with("Aes256_Sha256_RsaPss")
        ));
    }

    #[test]
    fn symmetric_chunks_in_every_mode() {
        let (server_keys, client_keys) = keys();
        for mode in [
            MessageSecurityMode::None,
            MessageSecurityMode::Sign,
            MessageSecurityMode::SignAndEncrypt,
        ] {
            let sending = SymmetricSecurity { channel_id: 3, token_id: 1, mode, keys: &client_keys };
            let receiving = SymmetricSecurity { channel_id: 3, token_id: 1, mode, keys: &server_keys };
            for body in [&b""[..], b"read request", &[0x5A; 333][..]] {
                let chunk = seal_symmetric(&sending, MessageType::Message, ChunkType::Intermediate, seq(9), body).unwrap();
                assert_eq!(MessageHeader::decode(&chunk).unwrap().message_size as usize, chunk.len());
                assert_eq!(peek_symmetric(&chunk).unwrap(), (3, 1));
                let opened = open_symmetric(&chunk, &receiving).unwrap();
                assert_eq!(opened.body, body, "mode {mode}");
                assert_eq!(opened.chunk_type, ChunkType::Intermediate);
                assert_eq!(opened.sequence, seq(9));
            }
        }
    }

    #[test]
    fn encrypted_body_is_not_visible() {
        let (server_keys, _) = keys();
        let security = SymmetricSecurity {
            channel_id: 1,
            token_id: 1,
            mode: MessageSecurityMode::SignAndEncrypt,
            keys: &server_keys,
        };
        let secret = b"the quick brown fox jumps over the lazy dog";
        let chunk = seal_symmetric(&security, MessageType::Message, ChunkType::Final, seq(1), secret).unwrap();
        assert!(!chunk.windows(secret.len()).any(|w| w == secret));
    }

    #[test]
    fn symmetric_chunk_with_wrong_ids_or_signature_is_rejected() {
        let (server_keys, client_keys) = keys();
        let sending = SymmetricSecurity {
            channel_id: 3,
            token_id: 1,
            mode: MessageSecurityMode::Sign,
            keys: &client_keys,
        };
        let chunk = seal_symmetric(&sending, MessageType::Message, ChunkType::Final, seq(1), b"x").unwrap();

        let wrong_channel = SymmetricSecurity { channel_id: 4, ..sending };
        assert!(matches!(open_symmetric(&chunk, &wrong_channel), Err(ChannelError::ChannelUnknown(3))));
        let wrong_token = SymmetricSecurity { token_id: 2, ..sending };
        assert!(matches!(open_symmetric(&chunk, &wrong_token), Err(ChannelError::TokenUnknown(1))));

        // Verified with the sender's own keys the signature is wrong.
        assert!(matches!(
            open_symmetric(&chunk, &sending),
            Err(ChannelError::SecurityChecksFailed(_))
        ));
        let receiving = SymmetricSecurity { keys: &server_keys, ..sending };
        assert!(open_symmetric(&chunk, &receiving).is_ok());
    }

    #[test]
    fn truncated_chunk_is_decoding_error() {
        let (server_keys, _) = keys();
        let security = SymmetricSecurity {
            channel_id: 1,
            token_id: 1,
            mode: MessageSecurityMode::None,
            keys: &server_keys,
        };
        let chunk = common::protocol::transport::frame(MessageType::Message, &[1, 0, 0, 0]);
        assert!(matches!(open_symmetric(&chunk, &security), Err(ChannelError::Codec(_))));
    }
}
