//! The server run loop.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --add_endpoint--> Configured --startup--> Running
//!     --termination token--> ShuttingDown --shutdown--> Stopped
//! ```
//!
//! The owner drives the loop by calling [`Server::run_iterate`] repeatedly.
//! Each call waits at most [`ServerOptions::iteration_interval`] for one
//! event (a new connection, a finished connection task, or termination) so
//! the termination token is observed promptly. Connections run as tasks of
//! their own and never take the loop down with them.

mod connection;
pub mod error;

use std::{
    io,
    net::SocketAddr,
    sync::{atomic::AtomicU32, Arc},
    time::Duration,
};

use common::{
    protocol::transport::MIN_BUFFER_SIZE, EndpointError, MessageSecurityMode,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::{JoinError, JoinSet},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::CertificateKeyPair;
use crate::crypto::SecurityPolicyInstance;
use crate::endpoint::{Endpoint, EndpointRegistry};
use connection::ConnectionContext;

pub use error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Configured,
    Running,
    ShuttingDown,
    Stopped,
}

/// Transport limits offered to clients in `ACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    /// Largest reassembled request accepted, 0 for no limit.
    pub max_message_size: u32,
    /// Most chunks per request, 0 for no limit.
    pub max_chunk_count: u32,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            receive_buffer_size: 65_535,
            send_buffer_size: 65_535,
            max_message_size: 2 * 1024 * 1024,
            max_chunk_count: 0,
        }
    }
}

impl TransportLimits {
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidConfiguration`] if a buffer is smaller
    /// than the protocol minimum.
    pub fn validate(&self) -> Result<(), EndpointError> {
        for (name, size) in [
            ("receive buffer", self.receive_buffer_size),
            ("send buffer", self.send_buffer_size),
        ] {
            if size < MIN_BUFFER_SIZE {
                return Err(EndpointError::InvalidConfiguration(format!(
                    "{name} size {size} is below the minimum of {MIN_BUFFER_SIZE}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Longest a single [`Server::run_iterate`] call waits.
    pub iteration_interval: Duration,
    /// How long [`Server::shutdown`] waits for connections before aborting them.
    pub shutdown_grace: Duration,
    pub limits: TransportLimits,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            iteration_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
            limits: TransportLimits::default(),
        }
    }
}

/// Outcome of waiting in one iteration.
enum LoopEvent {
    Terminate,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Finished(Result<(SocketAddr, Result<(), ConnectionError>), JoinError>),
    Idle,
}

pub struct Server {
    state: ServerState,
    application_uri: String,
    credentials: CertificateKeyPair,
    registry: EndpointRegistry,
    options: ServerOptions,
    listener: Option<TcpListener>,
    connections: JoinSet<(SocketAddr, Result<(), ConnectionError>)>,
    connection_shutdown: CancellationToken,
    channel_ids: Arc<AtomicU32>,
}

impl Server {
    /// A server that owns `credentials` until [`Server::shutdown`] clears them.
    pub fn new(
        application_uri: impl Into<String>,
        credentials: CertificateKeyPair,
        options: ServerOptions,
    ) -> Self {
        Self {
            state: ServerState::Uninitialized,
            application_uri: application_uri.into(),
            credentials,
            registry: EndpointRegistry::new(),
            options,
            listener: None,
            connections: JoinSet::new(),
            connection_shutdown: CancellationToken::new(),
            channel_ids: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn application_uri(&self) -> &str {
        &self.application_uri
    }

    pub fn credentials(&self) -> &CertificateKeyPair {
        &self.credentials
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.registry.endpoint()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Connection tasks not yet reaped.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidState`] once the server has started.
    pub fn set_application_uri(&mut self, uri: impl Into<String>) -> Result<(), EndpointError> {
        if !self.is_configurable() {
            return Err(EndpointError::InvalidState(format!(
                "application uri is immutable once the server is {:?}",
                self.state
            )));
        }
        self.application_uri = uri.into();
        Ok(())
    }

    /// Publish the endpoint. See [`EndpointRegistry::add_endpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidState`] once the server has started, or
    /// the registry's error.
    pub fn add_endpoint(
        &mut self,
        url: &str,
        policy: Arc<SecurityPolicyInstance>,
        mode: MessageSecurityMode,
    ) -> Result<&Endpoint, EndpointError> {
        if !self.is_configurable() {
            return Err(EndpointError::InvalidState(format!(
                "endpoints cannot be added once the server is {:?}",
                self.state
            )));
        }
        let endpoint = self.registry.add_endpoint(url, policy, mode)?;
        self.state = ServerState::Configured;
        Ok(endpoint)
    }

    fn is_configurable(&self) -> bool {
        matches!(self.state, ServerState::Uninitialized | ServerState::Configured)
    }

    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// - [`EndpointError::InvalidState`] unless the server is `Configured`.
    /// - [`EndpointError::Bind`] if the socket cannot be bound. The server
    ///   stays `Configured` and `startup` may be retried.
    pub async fn startup(&mut self, bind_addr: SocketAddr) -> Result<(), EndpointError> {
        if self.state != ServerState::Configured {
            return Err(EndpointError::InvalidState(format!(
                "startup requires a configured endpoint, server is {:?}",
                self.state
            )));
        }
        let endpoint = self
            .registry
            .endpoint()
            .ok_or_else(|| EndpointError::InvalidState("no endpoint registered".into()))?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| EndpointError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);

        match endpoint.policy().certificate().application_uri() {
            Some(uri) if uri == self.application_uri => {}
            certificate_uri => warn!(
                application_uri = %self.application_uri,
                certificate_uri = certificate_uri.unwrap_or("<none>"),
                "application uri does not match the certificate's subjectAltName"
            ),
        }
        info!(
            endpoint_url = %endpoint.url(),
            policy = endpoint.policy().uri(),
            mode = %endpoint.security_mode(),
            application_uri = %self.application_uri,
            addr = %local_addr,
            "server running"
        );

        self.listener = Some(listener);
        self.state = ServerState::Running;
        Ok(())
    }

    /// Wait for and handle at most one event.
    ///
    /// Returns after a connection is accepted or reaped, after
    /// [`ServerOptions::iteration_interval`] without events, or once
    /// `termination` is cancelled, in which case the server moves to
    /// `ShuttingDown` and the caller should call [`Server::shutdown`].
    ///
    /// # Errors
    ///
    /// - [`EndpointError::InvalidState`] if the server is not running.
    /// - [`EndpointError::Listener`] if accepting fails in a way that will
    ///   not recover. Per-connection failures never surface here.
    pub async fn run_iterate(&mut self, termination: &CancellationToken) -> Result<(), EndpointError> {
        match self.state {
            ServerState::Running => {}
            ServerState::ShuttingDown => return Ok(()),
            state => {
                return Err(EndpointError::InvalidState(format!(
                    "run_iterate requires a running server, server is {state:?}"
                )))
            }
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| EndpointError::InvalidState("listener is closed".into()))?;

        let event = tokio::select! {
            biased;
            _ = termination.cancelled() => LoopEvent::Terminate,
            accepted = listener.accept() => LoopEvent::Accepted(accepted),
            Some(joined) = self.connections.join_next() => LoopEvent::Finished(joined),
            _ = time::sleep(self.options.iteration_interval) => LoopEvent::Idle,
        };

        match event {
            LoopEvent::Terminate => {
                info!("termination requested");
                self.state = ServerState::ShuttingDown;
            }
            LoopEvent::Accepted(Ok((stream, peer))) => self.spawn_connection(stream, peer),
            LoopEvent::Accepted(Err(e)) if is_transient(&e) => {
                warn!(error = %e, "accept failed");
                // Out of descriptors fails again immediately; back off.
                time::sleep(self.options.iteration_interval).await;
            }
            LoopEvent::Accepted(Err(e)) => {
                error!(error = %e, "listener failed");
                return Err(EndpointError::Listener(e));
            }
            LoopEvent::Finished(joined) => log_finished(joined),
            LoopEvent::Idle => {}
        }
        Ok(())
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(endpoint) = self.registry.endpoint().cloned() else {
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to disable Nagle");
        }
        let ctx = ConnectionContext {
            endpoint,
            limits: self.options.limits,
            channel_ids: Arc::clone(&self.channel_ids),
        };
        let shutdown = self.connection_shutdown.clone();
        debug!(%peer, active = self.connections.len() + 1, "connection accepted");
        self.connections
            .spawn(async move { (peer, connection::serve(stream, ctx, shutdown).await) });
    }

    /// Close every connection, release the endpoint and clear the credentials.
    ///
    /// Connections get [`ServerOptions::shutdown_grace`] to finish before they
    /// are aborted. Idempotent: once `Stopped`, further calls only make sure
    /// the credentials are cleared.
    pub async fn shutdown(&mut self) {
        if self.state == ServerState::Stopped {
            self.credentials.clear();
            return;
        }
        self.state = ServerState::ShuttingDown;
        self.connection_shutdown.cancel();
        self.listener = None;

        if !self.connections.is_empty() {
            let connections = &mut self.connections;
            let drained = time::timeout(self.options.shutdown_grace, async {
                while let Some(joined) = connections.join_next().await {
                    log_finished(joined);
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = self.connections.len(),
                    "connections still open after the grace period; aborting"
                );
                self.connections.shutdown().await;
            }
        }

        self.registry.clear();
        self.credentials.clear();
        self.state = ServerState::Stopped;
        info!("server stopped");
    }
}

fn log_finished(joined: Result<(SocketAddr, Result<(), ConnectionError>), JoinError>) {
    match joined {
        Ok((peer, Ok(()))) => debug!(%peer, "connection closed"),
        Ok((peer, Err(e))) => {
            let e = EndpointError::from(e);
            warn!(%peer, status = %e.status_code(), error = %e, "connection closed with error");
        }
        Err(e) if e.is_cancelled() => debug!("connection task aborted"),
        Err(e) => error!(error = %e, "connection task panicked"),
    }
}

/// Accept errors that concern one connection attempt or a temporary resource
/// shortage, not the listener itself.
fn is_transient(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}
