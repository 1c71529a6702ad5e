//! VolSync Kubernetes Operator
//!
//! Main entry point for the operator. Parses configuration, sets up the
//! Kubernetes client, registers the replication controllers, and runs the
//! reconciliation loops.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use volsync_operator::{
    config::OperatorConfig,
    controllers::{self, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting VolSync operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::from_client(client.clone(), config));
    for builder in context.catalog.builders() {
        info!(mover = builder.name(), "{}", builder.version_info());
    }
    if context.catalog.builders().is_empty() {
        error!("No movers are enabled");
    }

    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let source_controller =
        controllers::run_replication_source_controller(client.clone(), context.clone());
    let destination_controller =
        controllers::run_replication_destination_controller(client.clone(), context.clone());

    tokio::select! {
        _ = source_controller => {
            error!("ReplicationSource controller exited unexpectedly");
        }
        _ = destination_controller => {
            error!("ReplicationDestination controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("VolSync operator stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
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
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
