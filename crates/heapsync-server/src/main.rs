use anyhow::Result;
use heapsync_server::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting heapsync server"
    );

    let config = ServerConfig::from_env()?;
    let (server, outbox) = Server::new(config)?;

    server.run(outbox).await?;

    Ok(())
}
