use anyhow::Result;
use pacekeeper::config::Config;
use pacekeeper::runtime::Runtime;
use pacekeeper::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    format!("pacekeeper={},tower_http=debug", config.log_level).into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting pacekeeper");
    tracing::info!(
        "Configuration: bind_addr={}, persistent_tier={}, local_cache_dir={}",
        config.bind_addr,
        if config.uses_redis() { "redis" } else { "memory" },
        config.local_cache_dir.display()
    );

    let runtime = Runtime::from_config(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start runtime: {}", e))?;

    Server::new(&config, runtime)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
