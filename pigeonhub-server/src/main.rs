use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (PIGEONHUB_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("PIGEONHUB_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("pigeonhub_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = pigeonhub_server::config::ServerConfig::parse();
    tracing::info!("Starting signaling server on {}:{}", config.host, config.port);
    if config.is_hub {
        tracing::info!(
            namespace = %config.hub_mesh_namespace,
            bootstrap = config.bootstrap_hubs().len(),
            "Hub mode enabled"
        );
    }

    let server = pigeonhub_server::server::Server::new(config);
    server.run().await
}
