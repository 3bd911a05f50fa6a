//! Application state wiring storage, providers and the orchestrator.
//!
//! The orchestrator is generic over its repository ports; `AppState` pins
//! it to the SQLite implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use chorus_core::agent::registry::ModelCatalog;
use chorus_core::analysis::SceneAnalyzer;
use chorus_core::llm::registry::ProviderRegistry;
use chorus_core::orchestrator::Orchestrator;
use chorus_infra::config::{is_unconfigured, load_config, seed_repository, starter_config};
use chorus_infra::llm::build_registry;
use chorus_infra::sqlite::pool::database_url;
use chorus_infra::sqlite::{DatabasePool, SqliteAgentRepository, SqliteConversationRepository};
use chorus_types::config::{AnalysisConfig, ChorusConfig};

pub type ConcreteOrchestrator = Orchestrator<SqliteConversationRepository, SqliteAgentRepository>;

/// Shared state for CLI commands and HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ConcreteOrchestrator,
    pub conversations: Arc<SqliteConversationRepository>,
    pub agents: Arc<SqliteAgentRepository>,
    pub config: Arc<ChorusConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load config, open the database, seed agents and flows, build providers.
    pub async fn init(data_dir: PathBuf, offline: bool) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

        let mut config = load_config(&data_dir).await;
        if is_unconfigured(&config) {
            tracing::info!("no providers, models or agents configured; using starter personas");
            config = ChorusConfig {
                orchestrator: config.orchestrator,
                ..starter_config()
            };
        }

        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let pool = DatabasePool::new(&db_url)
            .await
            .context("cannot open database")?;

        let conversations = Arc::new(SqliteConversationRepository::new(pool.clone()));
        let agents = Arc::new(SqliteAgentRepository::new(pool));
        seed_repository(agents.as_ref(), &config)
            .await
            .context("cannot seed agents and flows")?;

        let providers = build_registry(&config.providers, offline);
        let models = ModelCatalog::new(config.models.clone());
        let analyzer = build_analyzer(&config.orchestrator.analysis, &models, &providers);

        let orchestrator = Orchestrator::new(
            conversations.clone(),
            agents.clone(),
            providers,
            models,
            analyzer,
            config.orchestrator.clone(),
        );

        Ok(Self {
            orchestrator,
            conversations,
            agents,
            config: Arc::new(config),
            data_dir,
        })
    }
}

/// Model-backed analyzer when the configured binding resolves, keyword-only otherwise.
fn build_analyzer(
    config: &AnalysisConfig,
    models: &ModelCatalog,
    providers: &ProviderRegistry,
) -> SceneAnalyzer {
    if !config.enabled {
        return SceneAnalyzer::keyword_only(config.clone());
    }
    let Some(model_id) = config.model.as_deref() else {
        return SceneAnalyzer::keyword_only(config.clone());
    };
    let resolved = models
        .get(model_id)
        .and_then(|binding| providers.get(&binding.provider).map(|p| (p, binding.clone())));
    match resolved {
        Some((provider, binding)) => SceneAnalyzer::with_model(provider, binding, config.clone()),
        None => {
            tracing::warn!(model = model_id, "analysis model unavailable, using keyword analysis");
            SceneAnalyzer::keyword_only(config.clone())
        }
    }
}
