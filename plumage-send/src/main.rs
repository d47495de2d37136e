//! plumage-send - Background daemon for scheduled posting
//!
//! Scans the scheduled post queue and publishes content to the network
//! at the chosen times, on behalf of every authorized user.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use libplumage::client::XrpcClient;
use libplumage::crypto::TokenCipher;
use libplumage::dispatcher::{Dispatcher, DispatcherConfig};
use libplumage::logging::LogOptions;
use libplumage::nonce::NonceCache;
use libplumage::oauth::OAuthClient;
use libplumage::post_service::{NetworkPublisher, PostingService};
use libplumage::rate_gate::RateGate;
use libplumage::token_store::TokenStore;
use libplumage::{Config, Database, Result};

#[derive(Parser, Debug)]
#[command(name = "plumage-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled posting")]
#[command(long_about = "\
plumage-send - Background daemon for scheduled posting

DESCRIPTION:
    plumage-send is a long-running daemon that scans the Plumage queue
    and publishes scheduled posts to the network when they come due.

    It polls the database at regular intervals, claims due posts,
    refreshes expiring OAuth tokens, respects the network's rate
    limits, and retries transient failures with backoff.

USAGE:
    # Run in foreground (logs to stderr)
    plumage-send

    # Run with custom poll interval
    plumage-send --poll-interval 30

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (drains the in-flight scan)

CONFIGURATION:
    All configuration comes from PLUMAGE_* environment variables.
    Required: PLUMAGE_DATABASE_URL, PLUMAGE_CLIENT_ID,
    PLUMAGE_ENCRYPTION_KEY (at least 32 bytes).

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides PLUMAGE_POLL_INTERVAL_SECS)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one scan and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LogOptions::from_env(cli.verbose).install();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli, config).await {
        error!("plumage-send failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, mut config: Config) -> Result<()> {
    if let Some(interval) = cli.poll_interval {
        config.poll_interval_secs = interval;
    }

    info!("plumage-send daemon starting");
    info!("Poll interval: {}s", config.poll_interval_secs);

    let db = Database::new(&config.database_url).await?;
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // Wire the engine: cipher under the configured secret, shared nonce
    // cache and rate gate, auth and network clients, then the
    // dispatcher over all of it
    let cipher = TokenCipher::new(&config.encryption_key)?;
    let store = TokenStore::new(db.clone(), cipher);
    let nonces = Arc::new(NonceCache::new());
    let gate = Arc::new(RateGate::new());
    let oauth = Arc::new(OAuthClient::new(
        config.clone(),
        db.clone(),
        store.clone(),
        nonces.clone(),
        gate.clone(),
        shutdown.clone(),
    ));
    let client = Arc::new(XrpcClient::new(
        config.clone(),
        store.clone(),
        oauth.clone(),
        gate,
        nonces,
    ));
    let publisher = Arc::new(NetworkPublisher::new(client, db.clone()));
    let service = PostingService::new(
        db.clone(),
        publisher,
        config.max_retries,
        config.post_langs.clone(),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        service,
        store,
        oauth,
        DispatcherConfig::from_config(&config),
    ));

    if cli.once {
        dispatcher.tick(&shutdown).await?;
        info!("plumage-send: processed one scan, exiting");
    } else {
        dispatcher.run(shutdown).await;
    }

    db.close().await;
    info!("plumage-send daemon stopped");
    Ok(())
}

/// Trip the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler installs");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("Received shutdown signal, stopping gracefully...");
        shutdown.cancel();
    });
}
