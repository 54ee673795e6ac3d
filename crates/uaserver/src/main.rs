//! `uaserver`: secured OPC UA endpoint entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP export).
//! 3. Load the certificate and private key.
//! 4. Create the `Basic256Sha256` security policy from them.
//! 5. Publish the endpoint.
//! 6. Bind the listener.
//! 7. Install the signal handler.
//! 8. Iterate the run loop until termination is requested.
//! 9. Shut down and release the credentials.
//!
//! Any failure before the run loop exits the process with a code derived from
//! the OPC UA status code of the error.

mod channel;
mod config;
mod credentials;
mod crypto;
mod endpoint;
mod server;
mod telemetry;

use std::{path::Path, process::ExitCode, sync::Arc};

use common::{EndpointError, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::Config;
use credentials::CertificateKeyPair;
use crypto::SecurityPolicyInstance;
use server::{Server, ServerState};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Telemetry is not yet up; write to stderr directly.
            eprintln!("ERROR: configuration invalid: {e:#}");
            return ExitCode::from(StatusCode::BAD_CONFIGURATION_ERROR.exit_code());
        }
    };

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    if let Err(e) = telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level) {
        eprintln!("ERROR: telemetry initialisation failed: {e:#}");
        return ExitCode::from(StatusCode::BAD_CONFIGURATION_ERROR.exit_code());
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint_url = %cfg.endpoint_url,
        "uaserver starting"
    );

    let code = match run(&cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(status = %e.status_code(), error = %e, "uaserver failed");
            ExitCode::from(e.status_code().exit_code())
        }
    };
    telemetry::shutdown_telemetry();
    code
}

async fn run(cfg: &Config) -> Result<(), EndpointError> {
    // -----------------------------------------------------------------------
    // 3. Credentials
    // -----------------------------------------------------------------------
    let credentials = CertificateKeyPair::load(
        Path::new(&cfg.certificate_path),
        Path::new(&cfg.private_key_path),
    )?;

    // -----------------------------------------------------------------------
    // 4. Security policy
    // -----------------------------------------------------------------------
    let policy = Arc::new(SecurityPolicyInstance::create(
        &cfg.security_policy_uri,
        &credentials,
    )?);

    // -----------------------------------------------------------------------
    // 5. Endpoint
    // -----------------------------------------------------------------------
    let mut server = Server::new(&cfg.application_uri, credentials, cfg.server_options());
    server.add_endpoint(&cfg.endpoint_url, policy, cfg.security_mode)?;

    // -----------------------------------------------------------------------
    // 6. Listener
    // -----------------------------------------------------------------------
    let bind_addr = cfg
        .bind_addr()
        .map_err(|e| EndpointError::InvalidConfiguration(format!("{e:#}")))?;
    server.startup(bind_addr).await?;

    // -----------------------------------------------------------------------
    // 7. Signals
    // -----------------------------------------------------------------------
    let termination = CancellationToken::new();
    tokio::spawn(cancel_on_signal(termination.clone()));

    // -----------------------------------------------------------------------
    // 8. Run loop
    // -----------------------------------------------------------------------
    let mut result = Ok(());
    while server.state() == ServerState::Running {
        if let Err(e) = server.run_iterate(&termination).await {
            result = Err(e);
            break;
        }
    }

    // -----------------------------------------------------------------------
    // 9. Shutdown
    // -----------------------------------------------------------------------
    server.shutdown().await;
    result
}

/// Cancel `termination` on SIGINT or SIGTERM. Does nothing else.
async fn cancel_on_signal(termination: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    termination.cancel();
}
