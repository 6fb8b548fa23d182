use std::sync::Arc;

use cae_bastion::{init_logging, server, Bastion, BastionConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    init_logging();

    let config = match BastionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let ctx = match Bastion::from_config(config).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            signal.cancel();
        }
    });

    if let Err(e) = server::serve(ctx.clone(), shutdown).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
    ctx.sessions.stop_all();
}
