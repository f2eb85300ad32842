//! Sweeper entry point: runs the reservation expiry loop against the
//! configured database. The library is the product; this binary keeps holds
//! from leaking in deployments where no embedding process runs the sweep.

use metering_service::config::MeteringConfig;
use metering_service::observability::init_tracing;
use metering_service::quota::{ReservationManager, Sweeper};
use metering_service::services::init_metrics;
use metering_service::store::PgStore;

use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = MeteringConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(&config.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        "Starting metering-sweeper"
    );

    init_metrics();

    tracing::info!(
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        sweep_interval_seconds = %config.quota.sweep_interval_seconds,
        reservation_ttl_seconds = %config.quota.reservation_ttl_seconds,
        "Configuration loaded"
    );

    let store = PgStore::new(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to connect to database");
        std::io::Error::other(format!("Database error: {}", e))
    })?;

    store.run_migrations().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to run migrations");
        std::io::Error::other(format!("Migration error: {}", e))
    })?;

    let reservations = Arc::new(ReservationManager::new(
        Arc::new(store),
        config.quota.clone(),
    ));
    let sweeper = Sweeper::new(reservations, config.quota.sweep_interval_seconds);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send(true).ok();
    sweeper_handle.await.ok();

    tracing::info!("Service shutdown complete");
    Ok(())
}
