//! QDT gateway binary.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use qdt_core::logging;
use qdt_core::metrics::Metrics;
use qdt_core::server::{tls, Args, Server};

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider().install_default().ok();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_json)?;

    let token = tls::ensure_server_assets(&args.tls_cert, &args.tls_key, &args.token)?;
    let metrics = Arc::new(Metrics::new());
    let (server, tun_write_rx) = Server::new(args, token, metrics)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.serve(tun_write_rx, shutdown_rx).await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("Ctrl+C handler");
}
