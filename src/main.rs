//! CLI entry point running a single inpaint node operation.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = inpaint_nodes::config::CliArgs::parse();
    let config = inpaint_nodes::config::AppConfig::load(cli).await?;

    if let Err(error) = inpaint_nodes::run(config).await {
        tracing::error!(error = %error, "operation failed");
        return Err(error.into());
    }

    Ok(())
}
