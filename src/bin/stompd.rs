//! stompd – broker daemon.
//
//  $ stompd --config stompd.toml
//  $ STOMPD_PORT=61614 stompd
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use stompd::core::auth::Authenticator;
use stompd::logging::init_logging;
use stompd::{Config, MemoryQueueStorage, QueueStorage, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "stompd", version, about = "STOMP message broker daemon")]
struct Cli {
    /// Path to configuration file (TOML or YAML). `STOMPD_CONFIG` is used when absent.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let storage: Arc<dyn QueueStorage> =
        Arc::new(MemoryQueueStorage::with_max_depth(config.max_queue_depth));
    let authenticator = config
        .authenticator()
        .map(|auth| Arc::new(auth) as Arc<dyn Authenticator>);
    if authenticator.is_none() {
        warn!("no users configured; every connection is accepted");
    }

    let server = Arc::new(Server::new(
        ServerConfig::from(&config),
        storage,
        authenticator,
    ));

    let mut accept_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let finished = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested");
            server.stop();
            tokio::time::timeout(Duration::from_secs(5), &mut accept_loop).await.ok()
        }
        result = &mut accept_loop => Some(result),
    };

    match finished {
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(e))) => {
            error!("server error: {}", e);
            return Err(e).context("server failed");
        }
        Some(Err(e)) => error!("server task failed: {}", e),
        None => warn!("server did not stop within 5s"),
    }

    info!(active_sessions = server.active_sessions(), "stompd exiting");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
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
