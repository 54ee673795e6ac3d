//! One client connection: transport negotiation, the secure channel, and
//! answering requests until the client closes or something goes wrong.

use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use common::{
    protocol::{
        codec::date_time_now,
        services::{
            peek_request, type_ids, OpenSecureChannelRequest, OpenSecureChannelResponse, ResponseHeader,
            SecurityTokenRequestType, ServiceFault,
        },
        transport::{HEADER_LEN, MIN_BUFFER_SIZE, PROTOCOL_VERSION},
        Acknowledge, ChunkType, CodecError, ErrorMessage, Hello, MessageHeader, MessageType, SequenceHeader,
    },
    StatusCode,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ConnectionError, TransportLimits};
use crate::channel::{
    open_asymmetric, open_symmetric, peek_symmetric, seal_asymmetric, seal_symmetric, ChannelError, OpenedChunk,
    SecureChannel,
};
use crate::crypto::{Certificate, NONCE_LEN};
use crate::endpoint::{Endpoint, EndpointUrl};

/// How long the closing `ERR` may take to write.
const ERROR_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// What every connection task needs from the server.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub endpoint: Endpoint,
    pub limits: TransportLimits,
    /// Source of secure channel ids, unique across the server's connections.
    pub channel_ids: Arc<AtomicU32>,
}

/// Serve one connection until the client leaves, an error ends it, or
/// `shutdown` is cancelled.
///
/// On error the client is sent an `ERR` carrying the status code before the
/// stream is closed. Being told to shut down is not an error.
pub(crate) async fn serve<S>(
    mut stream: S,
    ctx: ConnectionContext,
    shutdown: CancellationToken,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = Connection::new(ctx);
    let result = tokio::select! {
        _ = shutdown.cancelled() => Err(ConnectionError::ServerHalted),
        result = connection.run(&mut stream) => result,
    };

    if let Err(e) = &result {
        if !matches!(e, ConnectionError::Io(_)) {
            let message = ErrorMessage::new(e.status_code(), e.to_string()).encode();
            match time::timeout(ERROR_WRITE_TIMEOUT, stream.write_all(&message)).await {
                Ok(Ok(())) => {}
                Ok(Err(write_error)) => debug!(error = %write_error, "failed to send ERR"),
                Err(_) => debug!("timed out sending ERR"),
            }
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "failed to shut down stream");
    }

    match result {
        Err(ConnectionError::ServerHalted) => Ok(()),
        result => result,
    }
}

/// Limits agreed in `HEL`/`ACK`.
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    receive_buffer_size: u32,
    send_buffer_size: u32,
    /// 0 means no limit.
    peer_max_message_size: u32,
}

/// A request whose final chunk has not arrived yet.
#[derive(Debug)]
struct PartialMessage {
    request_id: u32,
    body: Vec<u8>,
    chunks: u32,
}

#[derive(Debug)]
struct Connection {
    ctx: ConnectionContext,
    negotiated: Option<Negotiated>,
    channel: Option<SecureChannel>,
    client_certificate: Option<Certificate>,
    partial: Option<PartialMessage>,
}

impl Connection {
    fn new(ctx: ConnectionContext) -> Self {
        Self {
            ctx,
            negotiated: None,
            channel: None,
            client_certificate: None,
            partial: None,
        }
    }

    async fn run<S>(&mut self, stream: &mut S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let Some((header, chunk)) = self.read_chunk(stream).await? else {
                debug!("peer closed the connection");
                return Ok(());
            };
            let reply = match (header.message_type, self.negotiated.is_some()) {
                (MessageType::Hello, false) => Some(self.on_hello(&chunk)?),
                (MessageType::OpenSecureChannel, true) => Some(self.on_open(header, &chunk)?),
                (MessageType::Message, true) => self.on_message(&chunk)?,
                (MessageType::CloseSecureChannel, true) => {
                    self.on_close(&chunk)?;
                    return Ok(());
                }
                (other, _) => return Err(ConnectionError::UnexpectedMessage(other)),
            };
            if let Some(reply) = reply {
                self.send(stream, &reply).await?;
            }
        }
    }

    /// Read one whole chunk. `None` when the peer closed between chunks.
    async fn read_chunk<S>(&self, stream: &mut S) -> Result<Option<(MessageHeader, BytesMut)>, ConnectionError>
    where
        S: AsyncRead + Unpin,
    {
        let mut head = [0u8; HEADER_LEN];
        match stream.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = MessageHeader::decode(&head)?;

        let limit = self
            .negotiated
            .map_or(self.ctx.limits.receive_buffer_size, |n| n.receive_buffer_size);
        if header.message_size > limit {
            return Err(ConnectionError::ChunkTooLarge {
                size: header.message_size,
                limit,
            });
        }

        let mut chunk = BytesMut::zeroed(header.message_size as usize);
        chunk[..HEADER_LEN].copy_from_slice(&head);
        stream.read_exact(&mut chunk[HEADER_LEN..]).await?;
        Ok(Some((header, chunk)))
    }

    async fn send<S>(&self, stream: &mut S, reply: &[u8]) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin,
    {
        if let Some(n) = self.negotiated {
            let limit = match n.peer_max_message_size {
                0 => n.send_buffer_size,
                max => max.min(n.send_buffer_size),
            };
            if reply.len() > limit as usize {
                return Err(ConnectionError::ResponseTooLarge {
                    size: reply.len(),
                    limit,
                });
            }
        }
        stream.write_all(reply).await?;
        Ok(())
    }

    fn on_hello(&mut self, chunk: &[u8]) -> Result<BytesMut, ConnectionError> {
        let hello = Hello::decode(&chunk[HEADER_LEN..])?;

        // Only the path selects the endpoint; the host is whatever the
        // client used to reach us.
        let served = match hello.endpoint_url.parse::<EndpointUrl>() {
            Ok(url) => url.path() == self.ctx.endpoint.url().path(),
            Err(_) => false,
        };
        if !served {
            return Err(ConnectionError::EndpointUrl(hello.endpoint_url));
        }
        for size in [hello.receive_buffer_size, hello.send_buffer_size] {
            if size < MIN_BUFFER_SIZE {
                return Err(ConnectionError::BufferTooSmall(size));
            }
        }

        let limits = self.ctx.limits;
        let negotiated = Negotiated {
            receive_buffer_size: limits.receive_buffer_size.min(hello.send_buffer_size),
            send_buffer_size: limits.send_buffer_size.min(hello.receive_buffer_size),
            peer_max_message_size: hello.max_message_size,
        };
        self.negotiated = Some(negotiated);
        debug!(
            endpoint_url = %hello.endpoint_url,
            receive_buffer_size = negotiated.receive_buffer_size,
            send_buffer_size = negotiated.send_buffer_size,
            "transport negotiated"
        );

        Ok(Acknowledge {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: negotiated.receive_buffer_size,
            send_buffer_size: negotiated.send_buffer_size,
            max_message_size: limits.max_message_size,
            max_chunk_count: limits.max_chunk_count,
        }
        .encode())
    }

    fn on_open(&mut self, header: MessageHeader, chunk: &[u8]) -> Result<BytesMut, ConnectionError> {
        if header.chunk_type != ChunkType::Final {
            return Err(ConnectionError::ChunkedOpen);
        }
        let policy = Arc::clone(self.ctx.endpoint.policy());
        let (opened, sender) = open_asymmetric(chunk, &policy)?;
        let request = OpenSecureChannelRequest::decode(&opened.body)?;

        let endpoint_mode = self.ctx.endpoint.security_mode();
        if request.security_mode != endpoint_mode {
            return Err(ConnectionError::SecurityModeRejected {
                requested: request.security_mode,
                endpoint: endpoint_mode,
            });
        }
        if request.client_nonce.len() != NONCE_LEN {
            return Err(ConnectionError::NonceInvalid(request.client_nonce.len()));
        }

        match request.request_type {
            SecurityTokenRequestType::Issue => {
                if self.channel.is_some() {
                    return Err(ConnectionError::RequestTypeInvalid(
                        "a secure channel is already open on this connection",
                    ));
                }
                let id = self.ctx.channel_ids.fetch_add(1, Ordering::Relaxed);
                self.channel = Some(SecureChannel::new(id, endpoint_mode));
            }
            SecurityTokenRequestType::Renew => {
                let channel = self.channel.as_ref().ok_or(ConnectionError::RequestTypeInvalid(
                    "renewal requested before a secure channel was issued",
                ))?;
                if opened.channel_id != channel.id() {
                    return Err(ChannelError::ChannelUnknown(opened.channel_id).into());
                }
                let same_client = self
                    .client_certificate
                    .as_ref()
                    .is_some_and(|c| c.thumbprint() == sender.thumbprint());
                if !same_client {
                    return Err(ChannelError::CertificateInvalid(
                        "renewal signed by a different certificate".into(),
                    )
                    .into());
                }
            }
        }
        let channel = self.channel.as_mut().ok_or(ConnectionError::RequestTypeInvalid(
            "no secure channel to issue a token for",
        ))?;
        channel.check_received_sequence(opened.sequence.sequence_number)?;

        let server_nonce = policy.generate_nonce();
        let keys = policy
            .derive_session_keys(&request.client_nonce, &server_nonce)
            .map_err(ChannelError::from)?;
        let token = channel.issue_token(keys, request.requested_lifetime);

        let response = OpenSecureChannelResponse {
            response_header: ResponseHeader {
                timestamp: date_time_now(),
                request_handle: request.request_header.request_handle,
                service_result: StatusCode::GOOD,
            },
            server_protocol_version: PROTOCOL_VERSION,
            security_token: token,
            server_nonce: server_nonce.to_vec(),
        };
        let mut body = BytesMut::new();
        response.encode(&mut body);
        let sequence = SequenceHeader {
            sequence_number: channel.next_send_sequence(),
            request_id: opened.sequence.request_id,
        };
        let reply = seal_asymmetric(channel.id(), sequence, &body, &policy, &sender)?;

        info!(
            channel_id = token.channel_id,
            token_id = token.token_id,
            request_type = ?request.request_type,
            lifetime_ms = token.revised_lifetime,
            mode = %endpoint_mode,
            "security token issued"
        );
        self.client_certificate = Some(sender);
        Ok(reply)
    }

    fn on_message(&mut self, chunk: &[u8]) -> Result<Option<BytesMut>, ConnectionError> {
        let (channel, opened, token_id) = open_on_channel(&mut self.channel, chunk)?;
        let request_id = opened.sequence.request_id;
        let Some(body) = reassemble(&mut self.partial, &self.ctx.limits, opened)? else {
            return Ok(None);
        };

        // No services are implemented; every request gets a fault.
        let (type_id, request_header) = peek_request(&body)?;
        debug!(
            channel_id = channel.id(),
            request_id,
            type_id = ?type_id,
            "service not supported"
        );
        let fault = ServiceFault {
            response_header: ResponseHeader {
                timestamp: date_time_now(),
                request_handle: request_header.request_handle,
                service_result: StatusCode::BAD_SERVICE_UNSUPPORTED,
            },
        };
        let mut body = BytesMut::new();
        fault.encode(&mut body);
        let sequence = SequenceHeader {
            sequence_number: channel.next_send_sequence(),
            request_id,
        };
        let reply = seal_symmetric(
            &channel.security(token_id)?,
            MessageType::Message,
            ChunkType::Final,
            sequence,
            &body,
        )?;
        Ok(Some(reply))
    }

    fn on_close(&mut self, chunk: &[u8]) -> Result<(), ConnectionError> {
        let (channel, opened, _) = open_on_channel(&mut self.channel, chunk)?;
        let (type_id, _) = peek_request(&opened.body)?;
        if type_id.as_ns0_numeric() != Some(type_ids::CLOSE_SECURE_CHANNEL_REQUEST) {
            return Err(CodecError::UnexpectedTypeId {
                expected: type_ids::CLOSE_SECURE_CHANNEL_REQUEST,
                found: type_id,
            }
            .into());
        }
        info!(channel_id = channel.id(), "secure channel closed by client");
        Ok(())
    }
}

/// Open a symmetric chunk on the connection's channel. Returns the channel,
/// the opened chunk and the token it was protected with.
fn open_on_channel<'a>(
    channel: &'a mut Option<SecureChannel>,
    chunk: &[u8],
) -> Result<(&'a mut SecureChannel, OpenedChunk, u32), ConnectionError> {
    let (channel_id, token_id) = peek_symmetric(chunk)?;
    let channel = match channel.as_mut() {
        Some(channel) if channel.id() == channel_id => channel,
        _ => return Err(ChannelError::ChannelUnknown(channel_id).into()),
    };
    let opened = open_symmetric(chunk, &channel.security(token_id)?)?;
    channel.check_received_sequence(opened.sequence.sequence_number)?;
    Ok((channel, opened, token_id))
}

/// Collect chunks of one request. Returns the body once the final chunk is in.
fn reassemble(
    partial: &mut Option<PartialMessage>,
    limits: &TransportLimits,
    chunk: OpenedChunk,
) -> Result<Option<Vec<u8>>, ConnectionError> {
    let request_id = chunk.sequence.request_id;
    if let Some(pending) = partial.as_ref() {
        if pending.request_id != request_id {
            return Err(ConnectionError::InterleavedChunks {
                expected: pending.request_id,
                found: request_id,
            });
        }
    }
    if chunk.chunk_type == ChunkType::Abort {
        debug!(request_id, "request aborted by client");
        *partial = None;
        return Ok(None);
    }

    let message = partial.get_or_insert_with(|| PartialMessage {
        request_id,
        body: Vec::new(),
        chunks: 0,
    });
    message.chunks += 1;
    message.body.extend_from_slice(&chunk.body);
    if limits.max_chunk_count != 0 && message.chunks > limits.max_chunk_count {
        return Err(ConnectionError::MessageTooLarge("chunk count"));
    }
    if limits.max_message_size != 0 && message.body.len() > limits.max_message_size as usize {
        return Err(ConnectionError::MessageTooLarge("message size"));
    }

    match chunk.chunk_type {
        ChunkType::Final => Ok(partial.take().map(|m| m.body)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::policy::tests::{client_policy, server_policy};
    use crate::crypto::{SecurityPolicyInstance, SessionKeys};
    use crate::channel::SymmetricSecurity;
    use crate::endpoint::EndpointRegistry;
    use common::protocol::{
        codec::write_node_id,
        services::RequestHeader,
        NodeId,
    };
    use common::MessageSecurityMode;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    const URL: &str = "opc.tcp://localhost:4840/ua/server";
    const READ_REQUEST: u32 = 631;

    fn context(mode: MessageSecurityMode, limits: TransportLimits) -> ConnectionContext {
        let mut registry = EndpointRegistry::new();
        let endpoint = registry
            .add_endpoint(URL, Arc::new(server_policy()), mode)
            .unwrap()
            .clone();
        ConnectionContext {
            endpoint,
            limits,
            channel_ids: Arc::new(AtomicU32::new(1)),
        }
    }

    fn hello(url: &str, receive: u32, send: u32) -> Hello {
        Hello {
            protocol_version: 0,
            receive_buffer_size: receive,
            send_buffer_size: send,
            max_message_size: 0,
            max_chunk_count: 0,
            endpoint_url: url.into(),
        }
    }

    fn service_request(handle: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        write_node_id(&mut body, &NodeId::numeric(READ_REQUEST));
        RequestHeader::new(handle, date_time_now()).encode(&mut body);
        body.to_vec()
    }

    struct OpenChannel {
        channel_id: u32,
        token_id: u32,
        keys: SessionKeys,
    }

    /// The client end of a connection.
    struct Client {
        io: DuplexStream,
        policy: SecurityPolicyInstance,
        server: Certificate,
        mode: MessageSecurityMode,
        sequence: u32,
        channel: Option<OpenChannel>,
        previous: Option<OpenChannel>,
    }

    impl Client {
        fn start(mode: MessageSecurityMode) -> (Self, JoinHandle<Result<(), ConnectionError>>, CancellationToken) {
            Self::start_with(mode, TransportLimits::default())
        }

        fn start_with(
            mode: MessageSecurityMode,
            limits: TransportLimits,
        ) -> (Self, JoinHandle<Result<(), ConnectionError>>, CancellationToken) {
            let ctx = context(mode, limits);
            let server = ctx.endpoint.policy().certificate().clone();
            let (client_io, server_io) = tokio::io::duplex(256 * 1024);
            let shutdown = CancellationToken::new();
            let task = tokio::spawn(serve(server_io, ctx, shutdown.clone()));
            let client = Self {
                io: client_io,
                policy: client_policy(),
                server,
                mode,
                sequence: 1,
                channel: None,
                previous: None,
            };
            (client, task, shutdown)
        }

        async fn write(&mut self, bytes: &[u8]) {
            self.io.write_all(bytes).await.unwrap();
        }

        async fn read(&mut self) -> (MessageHeader, Vec<u8>) {
            let mut head = [0u8; HEADER_LEN];
            self.io.read_exact(&mut head).await.unwrap();
            let header = MessageHeader::decode(&head).unwrap();
            let mut chunk = head.to_vec();
            chunk.resize(header.message_size as usize, 0);
            self.io.read_exact(&mut chunk[HEADER_LEN..]).await.unwrap();
            (header, chunk)
        }

        async fn read_error(&mut self) -> ErrorMessage {
            let (header, chunk) = self.read().await;
            assert_eq!(header.message_type, MessageType::Error);
            ErrorMessage::decode(&chunk[HEADER_LEN..]).unwrap()
        }

        async fn hello(&mut self) -> Acknowledge {
            self.write(&hello(URL, 65_535, 65_535).encode()).await;
            let (header, chunk) = self.read().await;
            assert_eq!(header.message_type, MessageType::Acknowledge);
            Acknowledge::decode(&chunk[HEADER_LEN..]).unwrap()
        }

        fn next_sequence(&mut self, request_id: u32) -> SequenceHeader {
            let sequence = SequenceHeader {
                sequence_number: self.sequence,
                request_id,
            };
            self.sequence += 1;
            sequence
        }

        async fn send_open(
            &mut self,
            request_type: SecurityTokenRequestType,
            mode: MessageSecurityMode,
            nonce: Vec<u8>,
        ) {
            let request = OpenSecureChannelRequest {
                request_header: RequestHeader::new(1, date_time_now()),
                client_protocol_version: 0,
                request_type,
                security_mode: mode,
                client_nonce: nonce,
                requested_lifetime: 600_000,
            };
            let mut body = BytesMut::new();
            request.encode(&mut body);
            let channel_id = self.channel.as_ref().map_or(0, |c| c.channel_id);
            let sequence = self.next_sequence(1);
            let chunk = seal_asymmetric(channel_id, sequence, &body, &self.policy, &self.server).unwrap();
            self.write(&chunk).await;
        }

        async fn open(&mut self, request_type: SecurityTokenRequestType) -> OpenSecureChannelResponse {
            let nonce = self.policy.generate_nonce();
            self.send_open(request_type, self.mode, nonce.to_vec()).await;
            let (header, chunk) = self.read().await;
            assert_eq!(header.message_type, MessageType::OpenSecureChannel);
            let (opened, sender) = open_asymmetric(&chunk, &self.policy).unwrap();
            assert_eq!(sender.thumbprint(), self.server.thumbprint());
            let response = OpenSecureChannelResponse::decode(&opened.body).unwrap();
            assert_eq!(response.response_header.service_result, StatusCode::GOOD);
            self.previous = self.channel.replace(OpenChannel {
                channel_id: response.security_token.channel_id,
                token_id: response.security_token.token_id,
                keys: SessionKeys::derive(&response.server_nonce, &nonce).unwrap(),
            });
            response
        }

        fn seal(
            &mut self,
            message_type: MessageType,
            chunk_type: ChunkType,
            request_id: u32,
            body: &[u8],
            token_id: Option<u32>,
        ) -> BytesMut {
            let sequence = self.next_sequence(request_id);
            let channel = self.channel.as_ref().unwrap();
            let security = SymmetricSecurity {
                channel_id: channel.channel_id,
                token_id: token_id.unwrap_or(channel.token_id),
                mode: self.mode,
                keys: &channel.keys,
            };
            seal_symmetric(&security, message_type, chunk_type, sequence, body).unwrap()
        }

        async fn read_fault(&mut self) -> (SequenceHeader, ServiceFault) {
            let (header, chunk) = self.read().await;
            assert_eq!(header.message_type, MessageType::Message);
            let channel = self.channel.as_ref().unwrap();
            let security = SymmetricSecurity {
                channel_id: channel.channel_id,
                token_id: channel.token_id,
                mode: self.mode,
                keys: &channel.keys,
            };
            let opened = open_symmetric(&chunk, &security).unwrap();
            (opened.sequence, ServiceFault::decode(&opened.body).unwrap())
        }

        async fn close(&mut self) {
            let mut body = BytesMut::new();
            write_node_id(&mut body, &NodeId::numeric(type_ids::CLOSE_SECURE_CHANNEL_REQUEST));
            RequestHeader::new(99, date_time_now()).encode(&mut body);
            let chunk = self.seal(MessageType::CloseSecureChannel, ChunkType::Final, 99, &body, None);
            self.write(&chunk).await;
        }

        async fn expect_eof(&mut self) {
            let mut rest = Vec::new();
            self.io.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        }
    }

    #[tokio::test]
    async fn hello_negotiates_buffer_sizes() {
        let (mut client, task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.write(&hello(URL, 16_384, 32_768).encode()).await;
        let (_, chunk) = client.read().await;
        let ack = Acknowledge::decode(&chunk[HEADER_LEN..]).unwrap();
        assert_eq!(ack.protocol_version, PROTOCOL_VERSION);
        assert_eq!(ack.receive_buffer_size, 32_768);
        assert_eq!(ack.send_buffer_size, 16_384);
        assert_eq!(ack.max_message_size, TransportLimits::default().max_message_size);

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn hello_host_is_not_compared() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client
            .write(&hello("opc.tcp://192.0.2.7:48010/ua/server/", 65_535, 65_535).encode())
            .await;
        let (header, _) = client.read().await;
        assert_eq!(header.message_type, MessageType::Acknowledge);
    }

    #[tokio::test]
    async fn hello_for_another_path_is_rejected() {
        let (mut client, task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.write(&hello("opc.tcp://localhost:4840/other", 65_535, 65_535).encode()).await;
        let err = client.read_error().await;
        assert_eq!(err.error, StatusCode::BAD_TCP_ENDPOINT_URL_INVALID);
        assert!(err.reason.contains("/other"));
        client.expect_eof().await;
        assert!(matches!(task.await.unwrap(), Err(ConnectionError::EndpointUrl(_))));
    }

    #[tokio::test]
    async fn hello_with_tiny_buffer_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.write(&hello(URL, 1024, 65_535).encode()).await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_COMMUNICATION_ERROR);
    }

    #[tokio::test]
    async fn unknown_message_type_is_rejected() {
        let (mut client, task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.write(b"XYZF\x10\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Codec(CodecError::UnknownMessageType(_)))
        ));
    }

    #[tokio::test]
    async fn open_before_hello_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client
            .send_open(SecurityTokenRequestType::Issue, MessageSecurityMode::SignAndEncrypt, vec![1; 32])
            .await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
    }

    #[tokio::test]
    async fn second_hello_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        client.write(&hello(URL, 65_535, 65_535).encode()).await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.write(&hello(URL, 65_535, 16_384).encode()).await;
        client.read().await;
        let mut chunk = Vec::new();
        MessageHeader::new(MessageType::Message, ChunkType::Final, 20_000).encode(&mut chunk);
        client.write(&chunk).await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
    }

    #[tokio::test]
    async fn full_session_in_every_secured_mode() {
        for mode in [MessageSecurityMode::Sign, MessageSecurityMode::SignAndEncrypt] {
            let (mut client, task, _shutdown) = Client::start(mode);
            client.hello().await;
            let response = client.open(SecurityTokenRequestType::Issue).await;
            assert_eq!(response.security_token.channel_id, 1);
            assert_eq!(response.security_token.token_id, 1);
            assert_eq!(response.security_token.revised_lifetime, 600_000);
            assert_eq!(response.server_nonce.len(), NONCE_LEN);
            assert_eq!(response.response_header.request_handle, 1);

            let chunk = client.seal(MessageType::Message, ChunkType::Final, 2, &service_request(42), None);
            client.write(&chunk).await;
            let (sequence, fault) = client.read_fault().await;
            assert_eq!(sequence.request_id, 2);
            assert_eq!(sequence.sequence_number, 2);
            assert_eq!(fault.response_header.service_result, StatusCode::BAD_SERVICE_UNSUPPORTED);
            assert_eq!(fault.response_header.request_handle, 42);

            client.close().await;
            client.expect_eof().await;
            assert!(task.await.unwrap().is_ok(), "mode {mode}");
        }
    }

    #[tokio::test]
    async fn multi_chunk_request_is_reassembled() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        client.open(SecurityTokenRequestType::Issue).await;

        let body = service_request(7);
        let (first, second) = body.split_at(10);
        let chunk = client.seal(MessageType::Message, ChunkType::Intermediate, 3, first, None);
        client.write(&chunk).await;
        let chunk = client.seal(MessageType::Message, ChunkType::Final, 3, second, None);
        client.write(&chunk).await;

        let (sequence, fault) = client.read_fault().await;
        assert_eq!(sequence.request_id, 3);
        assert_eq!(fault.response_header.request_handle, 7);
    }

    #[tokio::test]
    async fn aborted_request_gets_no_reply() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::Sign);
        client.hello().await;
        client.open(SecurityTokenRequestType::Issue).await;

        let chunk = client.seal(MessageType::Message, ChunkType::Intermediate, 3, b"partial", None);
        client.write(&chunk).await;
        let chunk = client.seal(MessageType::Message, ChunkType::Abort, 3, b"", None);
        client.write(&chunk).await;
        let chunk = client.seal(MessageType::Message, ChunkType::Final, 4, &service_request(8), None);
        client.write(&chunk).await;

        let (sequence, fault) = client.read_fault().await;
        assert_eq!(sequence.request_id, 4);
        assert_eq!(fault.response_header.request_handle, 8);
    }

    #[tokio::test]
    async fn too_many_chunks_are_rejected() {
        let limits = TransportLimits {
            max_chunk_count: 2,
            ..TransportLimits::default()
        };
        let (mut client, _task, _shutdown) = Client::start_with(MessageSecurityMode::Sign, limits);
        assert_eq!(client.hello().await.max_chunk_count, 2);
        client.open(SecurityTokenRequestType::Issue).await;
        for _ in 0..3 {
            let chunk = client.seal(MessageType::Message, ChunkType::Intermediate, 5, b"x", None);
            client.write(&chunk).await;
        }
        assert_eq!(client.read_error().await.error, StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
    }

    #[tokio::test]
    async fn renewal_issues_new_token_and_keeps_previous() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        client.open(SecurityTokenRequestType::Issue).await;

        let renewed = client.open(SecurityTokenRequestType::Renew).await;
        assert_eq!(renewed.security_token.channel_id, 1);
        assert_eq!(renewed.security_token.token_id, 2);

        let chunk = client.seal(MessageType::Message, ChunkType::Final, 6, &service_request(9), None);
        client.write(&chunk).await;
        let (_, fault) = client.read_fault().await;
        assert_eq!(fault.response_header.request_handle, 9);

        // Chunks protected with the first token are still accepted.
        std::mem::swap(&mut client.channel, &mut client.previous);
        assert_eq!(client.channel.as_ref().unwrap().token_id, 1);
        let chunk = client.seal(MessageType::Message, ChunkType::Final, 7, &service_request(10), None);
        client.write(&chunk).await;
        let (_, fault) = client.read_fault().await;
        assert_eq!(fault.response_header.request_handle, 10);
    }

    #[tokio::test]
    async fn renewal_without_channel_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        client
            .send_open(SecurityTokenRequestType::Renew, MessageSecurityMode::SignAndEncrypt, vec![1; 32])
            .await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_REQUEST_TYPE_INVALID);
    }

    #[tokio::test]
    async fn mismatched_security_mode_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        client
            .send_open(SecurityTokenRequestType::Issue, MessageSecurityMode::Sign, vec![1; 32])
            .await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_SECURITY_MODE_REJECTED);
    }

    #[tokio::test]
    async fn short_nonce_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        client
            .send_open(SecurityTokenRequestType::Issue, MessageSecurityMode::SignAndEncrypt, vec![1; 16])
            .await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_NONCE_INVALID);
    }

    #[tokio::test]
    async fn message_for_unknown_token_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::Sign);
        client.hello().await;
        client.open(SecurityTokenRequestType::Issue).await;
        let chunk = client.seal(MessageType::Message, ChunkType::Final, 2, &service_request(1), Some(77));
        client.write(&chunk).await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN);
    }

    #[tokio::test]
    async fn replayed_sequence_number_is_rejected() {
        let (mut client, _task, _shutdown) = Client::start(MessageSecurityMode::Sign);
        client.hello().await;
        client.open(SecurityTokenRequestType::Issue).await;
        let chunk = client.seal(MessageType::Message, ChunkType::Final, 2, &service_request(1), None);
        client.write(&chunk).await;
        client.read_fault().await;
        client.write(&chunk).await;
        assert_eq!(client.read_error().await.error, StatusCode::BAD_SEQUENCE_NUMBER_INVALID);
    }

    #[tokio::test]
    async fn shutdown_sends_server_halted() {
        let (mut client, task, shutdown) = Client::start(MessageSecurityMode::SignAndEncrypt);
        client.hello().await;
        shutdown.cancel();
        assert_eq!(client.read_error().await.error, StatusCode::BAD_SERVER_HALTED);
        client.expect_eof().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn reassembly_rejects_interleaved_requests() {
        let chunk = |request_id, chunk_type| OpenedChunk {
            chunk_type,
            channel_id: 1,
            sequence: SequenceHeader {
                sequence_number: request_id,
                request_id,
            },
            body: vec![request_id as u8; 4],
        };
        let limits = TransportLimits::default();
        let mut partial = None;
        assert_eq!(reassemble(&mut partial, &limits, chunk(1, ChunkType::Intermediate)).unwrap(), None);
        assert!(matches!(
            reassemble(&mut partial, &limits, chunk(2, ChunkType::Final)),
            Err(ConnectionError::InterleavedChunks { expected: 1, found: 2 })
        ));
        assert_eq!(
            reassemble(&mut partial, &limits, chunk(1, ChunkType::Final)).unwrap(),
            Some(vec![1; 8])
        );
        assert!(partial.is_none());
    }

    #[test]
    fn reassembly_enforces_message_size() {
        let limits = TransportLimits {
            max_message_size: 6,
            ..TransportLimits::default()
        };
        let chunk = OpenedChunk {
            chunk_type: ChunkType::Intermediate,
            channel_id: 1,
            sequence: SequenceHeader {
                sequence_number: 1,
                request_id: 1,
            },
            body: vec![0; 4],
        };
        let mut partial = None;
        reassemble(&mut partial, &limits, chunk.clone()).unwrap();
        assert!(matches!(
            reassemble(&mut partial, &limits, chunk),
            Err(ConnectionError::MessageTooLarge("message size"))
        ));
    }
}
