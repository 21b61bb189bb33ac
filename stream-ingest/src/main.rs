use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use serve_metrics::serve;
use stream_ingest::config::Config;
use stream_ingest::server::router;
use stream_ingest::service::IngestService;

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = router()?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, "Metrics server stopped");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout with a level configured by the RUST_LOG envvar (default=INFO)
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting stream ingest service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = IngestService::new(config).context("Failed to create stream ingest service")?;

    let result = service.run().await;

    server_handle.abort();

    result
}
