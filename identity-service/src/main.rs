use identity_service::{
    build_router,
    config::IdentityConfig,
    db,
    services::{SessionCleaner, SystemClock},
    store::PostgresIdentityStore,
    AppState,
};
use service_core::error::AppError;
use service_core::observability::{init_metrics_recorder, init_tracing};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on invalid configuration
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;
    let metrics = init_metrics_recorder()?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;

    let store = Arc::new(PostgresIdentityStore::new(pool));
    let clock = Arc::new(SystemClock);

    let shutdown = CancellationToken::new();
    let cleaner = SessionCleaner::new(
        store.clone(),
        clock.clone(),
        config.session.cleanup_interval(),
        config.session.store_timeout(),
    )
    .spawn(shutdown.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    let grace = Duration::from_secs(config.common.shutdown_grace_seconds);

    let state = AppState::new(config, store, clock, Some(metrics));
    let app = build_router(state);

    tracing::info!(address = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if tokio::time::timeout(grace, cleaner).await.is_err() {
        tracing::warn!("Session cleaner did not stop within the shutdown grace period");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    shutdown.cancel();
}
