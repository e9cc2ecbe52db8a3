use anyhow::{Context, Result};
use library_service::{
    start_api_server, AppState, Config, InMemoryPersistence, InMemoryStorage, PersistenceGateway,
    PgPersistenceGateway, S3StorageGateway, StorageGateway,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        in_memory = config.service.in_memory,
        "Starting Panelingo library service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let (storage, persistence) = build_gateways(&config).await?;

    // Create the bucket up front; ingestion repeats this per submission
    if let Err(e) = storage
        .ensure_bucket(&config.storage.bucket, &config.storage.allowed_content_types)
        .await
    {
        warn!(bucket = %config.storage.bucket, error = %e, "Bucket setup failed at startup");
    }

    let state = AppState::new(storage, persistence, &config);

    info!("Library service started successfully");

    if let Err(e) = start_api_server(state, &config, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("Library service stopped");

    Ok(())
}

/// S3 and PostgreSQL gateways, or in-memory ones for local development
async fn build_gateways(
    config: &Config,
) -> Result<(Arc<dyn StorageGateway>, Arc<dyn PersistenceGateway>)> {
    if config.service.in_memory {
        warn!("Running with in-memory gateways, data is lost on restart");
        return Ok((
            Arc::new(InMemoryStorage::new()),
            Arc::new(InMemoryPersistence::new()),
        ));
    }

    let persistence = PgPersistenceGateway::new(&config.database)
        .await
        .context("Failed to initialize persistence gateway")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        persistence
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let storage = S3StorageGateway::new(&config.storage).await;

    Ok((Arc::new(storage), Arc::new(persistence)))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down library service");
}
