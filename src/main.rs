use anyhow::{Context, Result};
use gallery_service::api::{start_api_server, AppState};
use gallery_service::config::Config;
use gallery_service::image_store::ImageStore;
use gallery_service::object_store::ObjectStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    let env_name = config.service.environment;
    info!(
        service = %config.service.name,
        environment = %env_name,
        "Starting gallery service"
    );

    init_metrics(config.service.metrics_port)?;

    // Misconfiguration is fatal at startup, never retried
    let env = config.environments.get(env_name);
    let db_url = env.database_url(env_name)?.to_string();

    let store = Arc::new(
        ImageStore::connect(&db_url, &config.database)
            .await
            .context("Failed to initialize image store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects = Arc::new(
        ObjectStore::connect(env_name, env, &config.sync.bucket)
            .await
            .context("Failed to initialize object storage client")?,
    );

    let state = AppState {
        store: store.clone(),
        objects,
    };

    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Gallery service started successfully");

    shutdown_signal().await;

    info!("Shutting down gallery service");
    api_handle.abort();
    info!("Gallery service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
}
