use std::sync::Arc;

use embudo_core::config::{AppConfig, ConfigError, LoadOptions};
use embudo_db::{connect_with_settings, migrations, DbPool, SqlFunnelStore};
use embudo_engine::{notifier_from_config, EscalationScheduler, FunnelService, NotifierError};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<FunnelService>,
    pub scheduler: Option<Arc<EscalationScheduler>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("messaging notifier setup failed: {0}")]
    Notifier(#[from] NotifierError),
}

#[cfg_attr(not(test), allow(dead_code))]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let notifier = notifier_from_config(&config.messaging)?;
    let store = Arc::new(SqlFunnelStore::new(db_pool.clone()));
    let service = Arc::new(FunnelService::new(store).with_notifier(notifier));

    let scheduler = config.scheduler.enabled.then(|| {
        Arc::new(EscalationScheduler::from_config(Arc::clone(&service), &config.scheduler))
    });
    info!(
        event_name = "system.bootstrap.services_ready",
        correlation_id = "bootstrap",
        messaging_enabled = config.messaging.enabled,
        scheduler_enabled = scheduler.is_some(),
        "funnel services constructed"
    );

    Ok(Application { config, db_pool, service, scheduler })
}
