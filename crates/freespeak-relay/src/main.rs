use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use freespeak_relay::{Args, RelayConfig};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    freespeak_common::init_tracing_with_default(&args.log_level);

    let listener = TcpListener::bind(args.listen).await?;
    let bound_addr = listener.local_addr()?;
    info!("freespeak relay listening on {}", bound_addr);
    info!("websocket endpoint ws://{}/ws", bound_addr);

    freespeak_relay::serve(listener, RelayConfig::from(&args), shutdown_signal()).await
}
