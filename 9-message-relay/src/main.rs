use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use message_relay::{cli::Cli, server::Relay};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let listen = cli.listen_addr();
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let relay = Relay::new(listener, cli.relay_config())?;
    let addr = relay.local_addr()?;
    info!("relay listening on {}", addr);
    info!(backend = %cli.backend_url, "forwarding events to backend");

    if let Err(err) = relay.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
