//! lossy-pingpong: request/response latency under simulated unreliability
//!
//! One server, many clients, newline-delimited text over TCP:
//! - Clients send numbered `PING` probes at random intervals
//! - The server ignores some probes and delays its replies
//! - The server broadcasts a keepalive to every client on a fixed period
//! - Every participant journals its own view of each exchange
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod correlator;
mod error;
mod journal;
mod launcher;
mod policy;
mod protocol;
mod registry;
mod server;
mod transport;

use client::Client;
use config::{Config, Mode};
use journal::{client_log_name, Journal, SERVER_LOG};
use server::Server;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        log_dir = %config.log_dir.display(),
        "Starting lossy-pingpong"
    );

    match config.mode {
        Mode::Server => run_server(config).await,
        Mode::Client { client_id } => run_client(config, client_id).await,
        Mode::Launch => run_launch(config).await,
    }
}

/// Serve until Ctrl-C or SIGTERM
async fn run_server(config: Config) -> Result<(), BoxError> {
    let journal = Arc::new(Journal::open(config.log_dir.join(SERVER_LOG))?);
    info!(journal = %journal.path().display(), "Journal opened");
    info!(
        listen = %config.server.listen,
        drop_probability = config.server.impairment.drop_probability,
        keepalive_ms = config.server.keepalive_interval.as_millis() as u64,
        client_ids = ?config.server.client_ids,
        "Using server settings"
    );
    let server = Server::new(config.server, journal);

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => info!("Shutting down server"),
    }
    Ok(())
}

/// Run one session; pending probes are journaled on the way out
async fn run_client(config: Config, client_id: u64) -> Result<(), BoxError> {
    let journal = Arc::new(Journal::open(config.log_dir.join(client_log_name(client_id)))?);
    info!(client_id, journal = %journal.path().display(), "Journal opened");
    let mut client = Client::new(client_id, config.client, journal);

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                warn!(client_id, error = %e, "Session ended with error");
            }
        }
        _ = shutdown_signal() => info!(client_id, "Shutting down client"),
    }
    Ok(())
}

async fn run_launch(config: Config) -> Result<(), BoxError> {
    launcher::launch(&config, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
