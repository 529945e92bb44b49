/// Hushline chat server - Main entry point
use hushline_core::server::{ChatServer, Store};
use hushline_core::ServerConfig;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = ServerConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Store::open(&config.data_dir, &config)
        .map_err(|e| anyhow::anyhow!("Storage error: {}", e))?;

    let server = ChatServer::bind(config.listen_addr, store.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Bind error: {}", e))?;
    info!("🚀 Starting Hushline server");
    info!("   Listening: {}", server.local_addr()?);
    info!("   Data dir: {}", config.data_dir.display());

    tokio::select! {
        res = server.run() => {
            res.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, flushing store");
        }
    }

    store.flush()?;
    Ok(())
}
