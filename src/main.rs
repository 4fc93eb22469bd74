//! mtls-relay CLI - forwards plain HTTP requests to a fixed upstream over mutual TLS

use tracing_subscriber::EnvFilter;

use mtls_relay::{Config, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    mtls_relay::tls::install_crypto_provider();

    let config = Config::from_env();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Panics inside request tasks are logged, never fatal
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(location = %location, panic = %info, "Panic");
    }));

    tracing::debug!(config = ?config, "Loaded configuration");

    let server = RelayServer::new(config)?;

    // Handle Ctrl+C
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down...");
        let _ = shutdown_tx.send(());
    });

    server.run_until_shutdown(shutdown_rx).await?;
    Ok(())
}
