use core_config::tracing::{init_tracing, install_color_eyre};
use domain_notifications::{
    MessageRenderer, NotificationService, NotificationStores, PgChildRecordRepository,
    PgEventRepository, PgNotificationRepository, PgSuppressionRepository, ensure_schema,
    gateway_from_env,
};
use eyre::WrapErr;
use std::sync::Arc;
use tracing::{info, warn};

mod app;
mod config;
mod health;
mod openapi;
mod shutdown;

use config::{Config, StorageBackend};
use health::ReadyState;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Install color-eyre first for colored error output (before any fallible operations)
    install_color_eyre();

    let config = Config::from_env()?;
    init_tracing(&config.environment);

    let (stores, db) = match (config.storage, config.database.clone()) {
        (StorageBackend::Postgres, Some(database)) => {
            let db = database::postgres::connect_from_config_with_retry(
                database,
                Some(config.database_retry.clone()),
            )
            .await
            .wrap_err("PostgreSQL connection failed")?;
            ensure_schema(&db)
                .await
                .wrap_err("Failed to create notification tables")?;

            let stores = NotificationStores {
                notifications: Arc::new(PgNotificationRepository::new(db.clone())),
                events: Arc::new(PgEventRepository::new(db.clone())),
                children: Arc::new(PgChildRecordRepository::new(db.clone())),
                suppressions: Arc::new(PgSuppressionRepository::new(db.clone())),
            };
            (stores, Some(db))
        }
        (StorageBackend::Postgres, None) => {
            return Err(eyre::eyre!("postgres storage selected without DATABASE_URL"));
        }
        (StorageBackend::Memory, _) => {
            warn!("Using in-memory storage; data is lost on restart");
            (NotificationStores::in_memory(), None)
        }
    };

    let gateway = gateway_from_env(config.email.provider)?;
    let renderer = MessageRenderer::new(&config.email.base_url, &config.email.organisation_name)?;
    let service = NotificationService::new(stores, gateway.clone(), renderer, config.dispatch.clone());

    let router = app::build_router(
        service,
        ReadyState {
            db: db.clone(),
            gateway,
        },
        &config.cors_origins,
    )?;

    let listener = tokio::net::TcpListener::bind(config.server.address())
        .await
        .wrap_err_with(|| format!("Failed to bind {}", config.server.address()))?;
    info!(
        address = %listener.local_addr()?,
        storage = %config.storage,
        "CareBridge API listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
        .wrap_err("Server error")?;

    if let Some(db) = db {
        info!("Shutting down: closing database connections");
        match tokio::time::timeout(config.shutdown_timeout, db.close()).await {
            Ok(Ok(())) => info!("PostgreSQL connection closed successfully"),
            Ok(Err(e)) => tracing::error!("Error closing PostgreSQL: {}", e),
            Err(_) => warn!(timeout = ?config.shutdown_timeout, "Timed out closing PostgreSQL"),
        }
    }

    info!("CareBridge API shutdown complete");
    Ok(())
}
