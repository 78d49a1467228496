use std::sync::Arc;

use prechat_agent::{AssistantRuntime, LlmError, ModelInvoker, ModelParams, OpenAiCompatibleClient};
use prechat_core::config::{AppConfig, ConfigError, LoadOptions};
use prechat_core::{AdmissionCoordinator, CharRatioEstimator, SystemClock, TokenEstimator};
use prechat_db::{connect_from_config, migrations, DbPool, SqlStateStore};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub coordinator: Arc<AdmissionCoordinator>,
    pub runtime: Arc<AssistantRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model client setup failed: {0}")]
    ModelClient(#[from] LlmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let model: Arc<dyn ModelInvoker> = Arc::new(OpenAiCompatibleClient::from_config(&config.llm)?);
    bootstrap_with_model(config, model).await
}

/// Wires storage, admission and the assistant around an already-built model client.
pub async fn bootstrap_with_model(
    config: AppConfig,
    model: Arc<dyn ModelInvoker>,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
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

    let estimator: Arc<dyn TokenEstimator> = Arc::new(CharRatioEstimator::default());
    let coordinator = Arc::new(
        AdmissionCoordinator::restore(
            &config,
            Arc::new(SystemClock),
            Arc::new(SqlStateStore::new(db_pool.clone())),
            Arc::clone(&estimator),
        )
        .await,
    );
    let runtime = Arc::new(
        AssistantRuntime::new(
            Arc::clone(&coordinator),
            model,
            estimator,
            ModelParams::from_config(&config.llm),
        )
        .with_model_classification(&config.classification),
    );

    Ok(Application { config, db_pool, coordinator, runtime })
}
