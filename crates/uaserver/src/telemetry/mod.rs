//! Tracing setup: structured JSON logs, plus OTLP span export when a
//! collector is configured.
//!
//! # Telemetry invariants
//!
//! - **No key material or nonces** may appear in any span attribute or log
//!   field. Certificates are identified by thumbprint only.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`); `RUST_LOG`
//!   takes precedence.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
