use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use repairhub_core::audit::AuditSink;
use repairhub_core::config::{AppConfig, ConfigError, LoadOptions};
use repairhub_core::notifications::{
    notification_channel, LogNotificationSink, NoopNotificationDispatcher, NotificationDispatcher,
};
use repairhub_core::RepairLifecycleService;
use repairhub_db::{audit_channel, connect_with_settings, migrations, DbPool, SqlRepairStore};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{api, health};

const AUDIT_QUEUE_CAPACITY: usize = 1024;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: RepairLifecycleService<SqlRepairStore>,
    notification_worker: Option<JoinHandle<u64>>,
    audit_worker: JoinHandle<u64>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

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

    let (notifications, notification_worker): (Arc<dyn NotificationDispatcher>, _) =
        if config.notifications.enabled {
            let (dispatcher, worker) = notification_channel(config.notifications.queue_capacity);
            let handle = tokio::spawn(worker.run(Arc::new(LogNotificationSink)));
            info!(
                event_name = "system.bootstrap.notifications_started",
                correlation_id = "bootstrap",
                queue_capacity = config.notifications.queue_capacity,
                "notification worker started"
            );
            (Arc::new(dispatcher), Some(handle))
        } else {
            info!(
                event_name = "system.bootstrap.notifications_disabled",
                correlation_id = "bootstrap",
                "notifications disabled; events will be discarded"
            );
            (Arc::new(NoopNotificationDispatcher), None)
        };

    let (audit_sink, audit_worker) = audit_channel(db_pool.clone(), AUDIT_QUEUE_CAPACITY);
    let audit_worker = tokio::spawn(audit_worker.run());
    let audit: Arc<dyn AuditSink> = Arc::new(audit_sink);
    let service =
        RepairLifecycleService::new(SqlRepairStore::new(db_pool.clone()), notifications, audit);

    Ok(Application { config, db_pool, service, notification_worker, audit_worker })
}

impl Application {
    /// API, health probe and request tracing in one router.
    pub fn router(&self) -> Router {
        let gateway_secret = self
            .config
            .server
            .gateway_secret
            .as_ref()
            .map(|secret| SecretString::from(secret.expose_secret().to_owned()));

        api::router(self.service.clone(), gateway_secret)
            .merge(health::router(self.db_pool.clone(), self.config.notifications.enabled))
            .layer(TraceLayer::new_for_http())
    }

    /// Stops accepting notifications and audit events, lets both workers drain within the
    /// grace period and closes the pool.
    pub async fn shutdown(self) {
        let Application { config, db_pool, service, notification_worker, audit_worker } = self;
        drop(service);

        let grace_secs = config.server.graceful_shutdown_secs;
        let deadline = Instant::now() + Duration::from_secs(grace_secs);
        if let Some(worker) = notification_worker {
            drain_worker("notifications", worker, deadline, grace_secs).await;
        }
        drain_worker("audit", audit_worker, deadline, grace_secs).await;

        db_pool.close().await;
    }
}

async fn drain_worker(
    worker: &'static str,
    handle: JoinHandle<u64>,
    deadline: Instant,
    grace_secs: u64,
) {
    match tokio::time::timeout_at(deadline, handle).await {
        Ok(Ok(processed)) => info!(
            event_name = "system.shutdown.worker_drained",
            correlation_id = "shutdown",
            worker,
            processed,
            "background worker drained"
        ),
        Ok(Err(error)) => warn!(
            event_name = "system.shutdown.worker_failed",
            correlation_id = "shutdown",
            worker,
            error = %error,
            "background worker ended abnormally"
        ),
        Err(_) => warn!(
            event_name = "system.shutdown.worker_timeout",
            correlation_id = "shutdown",
            worker,
            grace_secs,
            "background worker did not drain in time"
        ),
    }
}
