//! Standalone wiring binary.
//!
//! Connects Redis, builds the core over a process-local in-memory graph,
//! provisions the configured partitions and idles until SIGINT/SIGTERM. It
//! serves no requests; transports embed the library and its `AppState`.

use entitlements_service::{
    config::EntitlementsConfig,
    services::{InMemoryGraphRepository, RedisService, TracingAuditLogger},
    AppComponents, AppState,
};
use service_core::observability::init_tracing;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Fail fast on invalid configuration
    let config = EntitlementsConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        domain = %config.partition.domain,
        "Starting entitlements service"
    );

    let redis = Arc::new(RedisService::new(&config.redis).await?);
    redis.health_check().await?;
    tracing::info!("Redis service initialized");

    let components = AppComponents {
        repository: Arc::new(InMemoryGraphRepository::new()),
        cache_store: redis.clone(),
        lock: redis,
        flag_provider: Arc::new(config.feature_flag_provider()),
        flag_defaults: config.feature_flags.defaults.clone(),
        association_policy: config.association_policy(),
        audit: Arc::new(TracingAuditLogger::new()),
    };
    let state = AppState::build(
        components,
        config.membership_settings(),
        config.cache_settings(),
    );

    for partition_id in &config.bootstrap.partitions {
        let outcome = state
            .membership
            .provision_partition(&config.bootstrap.requester_id, partition_id)
            .await
            .map_err(service_core::error::AppError::from)?;
        tracing::info!(
            partition_id = %partition_id,
            created = outcome.applied,
            "Partition ready"
        );
    }

    tracing::info!("Entitlements service ready");
    shutdown_signal().await;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
}
