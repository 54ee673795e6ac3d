//! Configuration loading and validation for the OPC UA server.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is present but invalid.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use common::{protocol::BASIC256SHA256_URI, MessageSecurityMode};
use serde::Deserialize;

use crate::endpoint::EndpointUrl;
use crate::server::{ServerOptions, TransportLimits};

/// Validated server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// DER-encoded application instance certificate.
    #[serde(default = "default_certificate_path")]
    pub certificate_path: String,

    /// PEM-encoded RSA private key (PKCS#1 or PKCS#8) matching the certificate.
    #[serde(default = "default_private_key_path")]
    pub private_key_path: String,

    /// The endpoint URL published to clients. Its port is the listening port.
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,

    #[serde(default = "default_security_policy_uri")]
    pub security_policy_uri: String,

    /// `None`, `Sign` or `SignAndEncrypt`.
    #[serde(default = "default_security_mode")]
    pub security_mode: MessageSecurityMode,

    /// Should match the URI in the certificate's subjectAltName.
    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    /// Address the listener binds to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Longest single wait of the run loop (milliseconds).
    #[serde(default = "default_iteration_interval")]
    pub iteration_interval_ms: u64,

    /// How long shutdown waits for open connections (milliseconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_buffer_size")]
    pub receive_buffer_size: u32,

    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: u32,

    /// 0 disables the limit.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,

    /// 0 disables the limit.
    #[serde(default)]
    pub max_chunk_count: u32,

    /// OTLP/gRPC collector. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_certificate_path() -> String {
    "server_cert.der".into()
}
fn default_private_key_path() -> String {
    "server_key.pem".into()
}
fn default_endpoint_url() -> String {
    "opc.tcp://localhost:4840".into()
}
fn default_security_policy_uri() -> String {
    BASIC256SHA256_URI.into()
}
fn default_security_mode() -> MessageSecurityMode {
    MessageSecurityMode::SignAndEncrypt
}
fn default_application_uri() -> String {
    "urn:my_custom_application_uri".into()
}
fn default_bind_host() -> String {
    "0.0.0.0".into()
}
fn default_iteration_interval() -> u64 {
    50
}
fn default_shutdown_grace() -> u64 {
    2000
}
fn default_buffer_size() -> u32 {
    65_535
}
fn default_max_message_size() -> u32 {
    2 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.certificate_path, "CERTIFICATE_PATH")?;
        ensure_non_empty(&self.private_key_path, "PRIVATE_KEY_PATH")?;
        ensure_non_empty(&self.security_policy_uri, "SECURITY_POLICY_URI")?;
        ensure_non_empty(&self.application_uri, "APPLICATION_URI")?;

        if self.iteration_interval_ms == 0 {
            anyhow::bail!("ITERATION_INTERVAL_MS must be > 0");
        }
        self.transport_limits()
            .validate()
            .context("RECEIVE_BUFFER_SIZE / SEND_BUFFER_SIZE")?;
        self.bind_addr()?;
        Ok(())
    }

    pub fn transport_limits(&self) -> TransportLimits {
        TransportLimits {
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            max_message_size: self.max_message_size,
            max_chunk_count: self.max_chunk_count,
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            iteration_interval: Duration::from_millis(self.iteration_interval_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            limits: self.transport_limits(),
        }
    }

    /// `BIND_HOST` combined with the port of `ENDPOINT_URL`.
    ///
    /// # Errors
    ///
    /// Returns an error if either value does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let url: EndpointUrl = self.endpoint_url.parse().context("ENDPOINT_URL")?;
        let host: IpAddr = self
            .bind_host
            .parse()
            .with_context(|| format!("BIND_HOST {:?} is not an IP address", self.bind_host))?;
        Ok(SocketAddr::new(host, url.port()))
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
