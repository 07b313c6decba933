use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use visara_gateway::{Gateway, GatewayConfig, Server};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("visara_gateway=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C; stopping now");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = GatewayConfig::load()?;
    let server = Server::bind(&config.listen_addr).await?;
    let gateway = Arc::new(Gateway::from_config(config)?);

    info!(
        address = %server.local_addr(),
        backend = %gateway.config().backend.url,
        "routes: /gateway/health, /gateway/stats, /gateway/metrics, everything else proxied"
    );

    gateway.start();

    let handler = Arc::clone(&gateway);
    server
        .run_with_shutdown(move |request| handler.handle(request), shutdown_signal())
        .await?;

    gateway.shutdown().await;
    Ok(())
}
