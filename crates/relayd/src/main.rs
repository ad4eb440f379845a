//! # relayd
//!
//! Hub server binary — resolves configuration from flags and environment,
//! wires the hub together, and runs until SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use relay_auth::TokenVerifier;
use relay_server::bridge::HandlerBridge;
use relay_server::config::{HandlerConfig, HubConfig};
use relay_server::hub::Hub;
use relay_server::server::HubServer;

/// Standalone real-time messaging hub.
///
/// Accepts long-lived WebSocket connections, organizes clients into named
/// channels, fans out events, and hands client-originated messages to an
/// external handler process. Flags take precedence over environment
/// variables.
#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Real-time messaging hub server")]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "SOCKET_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to run the server on.
    #[arg(short, long, env = "SOCKET_PORT", default_value_t = 8080)]
    port: u16,

    /// Shared secret for client token verification (required).
    #[arg(short = 't', long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Bearer token protecting the admin HTTP API (required).
    #[arg(long, env = "HTTP_TOKEN")]
    http_token: Option<String>,

    /// Working directory for handler invocations.
    #[arg(short = 'd', long, env = "HANDLER_PATH", default_value = ".")]
    handler_dir: PathBuf,

    /// Handler binary path.
    #[arg(long, env = "HANDLER_BINARY", default_value = "php")]
    handler_bin: String,

    /// Handler command name passed as the first argument.
    #[arg(long, env = "HANDLER_COMMAND", default_value = "socket:handle")]
    handler_command: String,

    /// Directory for handler payload files.
    #[arg(long, env = "SOCKET_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(long, env = "SOCKET_DEBUG")]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> HubConfig {
        let mut config = HubConfig {
            host: self.host,
            port: self.port,
            jwt_secret: self.jwt_secret.unwrap_or_default(),
            admin_token: self.http_token.unwrap_or_default(),
            handler: HandlerConfig {
                working_dir: self.handler_dir,
                binary: self.handler_bin,
                command: self.handler_command,
            },
            debug: self.debug,
            ..HubConfig::default()
        };
        if let Some(dir) = self.temp_dir {
            config.temp_dir = dir;
        }
        config
    }
}

fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init is a no-op if a subscriber is already set
    let _ = subscriber.try_init();
}

/// Show only a prefix of a secret in logs.
fn redact(secret: &str) -> String {
    if secret.len() > 10 {
        format!("{}...", &secret[..10])
    } else if secret.len() > 3 {
        format!("{}...", &secret[..3])
    } else {
        "***".to_string()
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config();
    init_logging(config.debug);

    // Refuse to start on invalid configuration, before anything binds.
    config.validate().context("configuration error")?;

    info!(
        host = %config.host,
        port = config.port,
        jwt_secret = %redact(&config.jwt_secret),
        handler_dir = %config.handler.working_dir.display(),
        handler_bin = %config.handler.binary,
        handler_command = %config.handler.command,
        temp_dir = %config.temp_dir.display(),
        "starting socket server"
    );

    let metrics_handle = relay_server::metrics::install_recorder();

    let bridge = Arc::new(HandlerBridge::new(&config));
    bridge
        .init_temp_dir()
        .context("failed to initialize temp directory")?;

    let hub = Arc::new(Hub::new(
        TokenVerifier::new(&config.jwt_secret),
        bridge.clone(),
        &config,
    ));
    let server = HubServer::new(config, hub, metrics_handle);

    // Payload sweep runs until shutdown.
    let sweep_cancel = server.shutdown().token();
    server.shutdown().register_task(tokio::spawn(async move {
        bridge.run_sweep(sweep_cancel).await;
    }));

    let (addr, server_handle) = server.listen().await.context("failed to bind listener")?;
    info!(%addr, "socket server listening");

    shutdown_signal().await;
    info!("shutdown signal received");

    server.shutdown().graceful_shutdown(None).await;
    let _ = server_handle.await;
    Ok(())
}
