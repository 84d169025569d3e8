// relay: Accepts tunnel control connections and dispatches their commands.

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Tunnel control-plane relay")]
struct Args {
    /// Path to the relay TOML config; defaults to /etc/tun-relay/relay.toml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let config = match args.config {
        Some(path) => relay::load_config_from_path(&path),
        None => relay::load_config(),
    };
    let config = match config {
        Ok(config) => {
            info!(bind = %config.listen.bind, "config loaded");
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let bind = config.listen.bind.clone();
    let state = relay::build_state(config);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {}", bind, e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = relay::serve(listener, state, shutdown_rx).await {
        eprintln!("FATAL: relay terminated: {}", e);
        std::process::exit(1);
    }
}
