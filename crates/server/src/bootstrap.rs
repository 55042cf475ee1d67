use std::sync::Arc;

use axum::Router;
use deckhand_agent::context::ContextAssembler;
use deckhand_agent::generator::{GenerationSettings, ProposalGenerator};
use deckhand_agent::llm::ConfiguredProviderFactory;
use deckhand_agent::selector::ProviderSelector;
use deckhand_core::config::{AppConfig, ConfigError, LoadOptions};
use deckhand_core::generation_engine::{GenerationEngine, GenerationEngineConfig};
use deckhand_core::progress::ProgressPolicy;
use deckhand_db::repositories::{
    SqlGenerationJobRepository, SqlKnowledgeRepository, SqlOpportunityRepository,
    SqlOrganizationRepository, SqlProposalRepository,
};
use deckhand_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::api::{self, ApiState};
use crate::health::{self, HealthState};
use crate::queue::GenerationQueue;
use crate::worker::{GenerationWorker, WorkerSettings};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub selector: Arc<ProviderSelector>,
    pub queue: Arc<GenerationQueue>,
    pub worker: Arc<GenerationWorker>,
    api_state: ApiState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider HTTP client could not be built: {0}")]
    ProviderClient(String),
}

impl Application {
    /// API routes plus `/health`, with request tracing.
    pub fn router(&self) -> Router {
        api::router(self.api_state.clone())
            .merge(health::router(HealthState::new(
                self.db_pool.clone(),
                self.config.worker.enabled,
            )))
            .layer(TraceLayer::new_for_http())
    }
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

    let organizations = Arc::new(SqlOrganizationRepository::new(db_pool.clone()));
    let opportunities = Arc::new(SqlOpportunityRepository::new(db_pool.clone()));
    let knowledge = Arc::new(SqlKnowledgeRepository::new(db_pool.clone()));
    let proposals = Arc::new(SqlProposalRepository::new(db_pool.clone()));
    let jobs = Arc::new(SqlGenerationJobRepository::new(db_pool.clone()));

    let factory = ConfiguredProviderFactory::new(config.llm.clone())
        .map_err(|error| BootstrapError::ProviderClient(error.to_string()))?;
    info!(
        event_name = "system.bootstrap.providers",
        correlation_id = "bootstrap",
        anthropic_available = config.llm.anthropic.has_credentials(),
        bedrock_available = config.llm.bedrock.has_credentials(),
        premium_min_tier = config.llm.premium_min_tier.as_str(),
        "provider credentials resolved"
    );

    let selector = Arc::new(ProviderSelector::new(organizations, Arc::new(factory), &config.llm));
    let assembler = Arc::new(ContextAssembler::new(opportunities.clone(), knowledge));
    let generator =
        Arc::new(ProposalGenerator::new(GenerationSettings::from_config(&config.generation)));
    let engine = GenerationEngine::with_config(GenerationEngineConfig::from(&config.worker));
    let queue = Arc::new(GenerationQueue::new(engine, jobs, proposals.clone()));

    let worker = Arc::new(GenerationWorker::new(
        format!("deckhand-{}-{}", std::process::id(), Uuid::new_v4().simple()),
        queue.clone(),
        selector.clone(),
        assembler,
        generator,
        WorkerSettings::from(&config.worker),
    ));

    let api_state = ApiState {
        proposals,
        opportunities,
        queue: queue.clone(),
        selector: selector.clone(),
        progress: ProgressPolicy::from(&config.progress),
    };

    Ok(Application { config, db_pool, selector, queue, worker, api_state })
}
