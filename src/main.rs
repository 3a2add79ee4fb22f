use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use relay_server::app::App;
use relay_server::config::load_config;
use relay_server::shutdown::Shutdown;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Off-chain relay server: admits signed relay requests, drives registration
/// on-chain, and keeps nonce-ordered transactions moving to confirmation.
#[derive(Debug, Parser)]
#[clap(rename_all = "kebab-case")]
struct Args {
    /// Path to a TOML config file; overridden by `RELAY__`-prefixed env vars.
    #[clap(long, env)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().from_env_lossy())
        .json()
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let shutdown = Arc::new(Shutdown::new());
    shutdown.watch_os_signals();

    let app = Arc::new(App::new(config).await?);
    app.spawn_reconciliation_ticker(shutdown.clone());

    info!("relay server starting");
    relay_server::server::run(app, shutdown).await?;

    info!("relay server stopped");
    Ok(())
}
