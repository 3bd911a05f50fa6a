//! Configuration loader for Chorus.
//!
//! Reads `chorus.toml` from the data directory (`~/.chorus/` by default) and
//! deserializes it into [`ChorusConfig`]. Falls back to defaults when the
//! file is missing or malformed. Agents and flows declared in the file are
//! seeded into persistence when absent.

use std::path::{Path, PathBuf};

use chorus_core::repository::AgentRepository;
use chorus_types::agent::AgentDefinition;
use chorus_types::config::ChorusConfig;
use chorus_types::conversation::ConversationMode;
use chorus_types::error::RepositoryError;
use chorus_types::llm::{ModelBinding, ProviderCapabilities, ProviderConfig, ProviderType};
use chorus_types::plan::{AggregationStrategy, ExecutionMode, Flow, FlowStage};

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "chorus.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CHORUS_DATA_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no home directory; pass --data-dir or set {DATA_DIR_ENV}")]
    NoDataDir,

    #[error("model '{model}' refers to unknown provider '{provider}'")]
    UnknownProvider { model: String, provider: String },

    #[error("agent '{agent}' refers to unknown model '{model}'")]
    UnknownModel { agent: String, model: String },
}

/// Pick the data directory: explicit path, then `CHORUS_DATA_DIR`, then `~/.chorus`.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".chorus"))
        .ok_or(ConfigError::NoDataDir)
}

/// Read and parse `{data_dir}/chorus.toml`.
pub async fn read_config(data_dir: &Path) -> Result<ChorusConfig, ConfigError> {
    let path = data_dir.join(CONFIG_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
    toml::from_str::<ChorusConfig>(&content).map_err(|source| ConfigError::Parse { path, source })
}

/// Load configuration, falling back to [`ChorusConfig::default()`].
///
/// A missing file is expected on first run and only logged at debug.
pub async fn load_config(data_dir: &Path) -> ChorusConfig {
    match read_config(data_dir).await {
        Ok(config) => {
            for problem in check_references(&config) {
                tracing::warn!("{problem}");
            }
            config
        }
        Err(ConfigError::Io { path, source }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no config file at {}, using defaults", path.display());
            ChorusConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            ChorusConfig::default()
        }
    }
}

/// Dangling model and provider references. Non-fatal: the affected agents
/// fail at call time.
pub fn check_references(config: &ChorusConfig) -> Vec<ConfigError> {
    let mut problems = Vec::new();
    for model in &config.models {
        if !config.providers.iter().any(|p| p.name == model.provider) {
            problems.push(ConfigError::UnknownProvider {
                model: model.id.clone(),
                provider: model.provider.clone(),
            });
        }
    }
    for agent in &config.agents {
        if !config.models.iter().any(|m| m.id == agent.model) {
            problems.push(ConfigError::UnknownModel {
                agent: agent.role.clone(),
                model: agent.model.clone(),
            });
        }
    }
    problems
}

/// Whether `config` declares nothing to talk to.
pub fn is_unconfigured(config: &ChorusConfig) -> bool {
    config.providers.is_empty() && config.models.is_empty() && config.agents.is_empty()
}

/// Three personas on the in-process scripted provider, plus a fixed-mode
/// flow. Used on first run so `chorus chat --offline` works without a
/// config file.
pub fn starter_config() -> ChorusConfig {
    let persona = |role: &str, name: &str, prompt: &str, priority: u32, order: u32, caps: &[&str]| {
        AgentDefinition {
            role: role.into(),
            display_name: name.into(),
            system_prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 400,
            model: "local".into(),
            enabled: true,
            priority,
            order,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
        }
    };

    ChorusConfig {
        providers: vec![ProviderConfig {
            name: "local".into(),
            provider_type: ProviderType::Scripted,
            base_url: None,
            api_key_env: None,
            enabled: true,
        }],
        models: vec![ModelBinding {
            id: "local".into(),
            provider: "local".into(),
            model: "local".into(),
            context_length: 8_192,
            capabilities: ProviderCapabilities::default(),
            pricing: Default::default(),
        }],
        agents: vec![
            persona(
                "empathy",
                "Warm Listener",
                "You are {name}. The user seems {emotion}. Acknowledge how they feel before anything else.",
                1,
                0,
                &["emotional_support", "casual_chat", "relationships"],
            ),
            persona(
                "practical",
                "Fixer",
                "You are {name}. Offer concrete next steps for this {scene} conversation about {topics}.",
                1,
                1,
                &["problem_solving", "information", "work"],
            ),
            persona(
                "encouragement",
                "Cheerleader",
                "You are {name}. Close with genuine encouragement.",
                2,
                2,
                &["celebration", "emotional_support"],
            ),
        ],
        flows: vec![Flow {
            name: "listen-then-help".into(),
            mode: ConversationMode::Fixed,
            stages: vec![
                FlowStage {
                    name: "listen".into(),
                    execution: ExecutionMode::Parallel,
                    roles: vec!["empathy".into(), "encouragement".into()],
                    strategy: AggregationStrategy::MergeConcat,
                    required_markers: Vec::new(),
                },
                FlowStage {
                    name: "help".into(),
                    execution: ExecutionMode::Sequential,
                    roles: vec!["practical".into()],
                    strategy: AggregationStrategy::FirstSuccess,
                    required_markers: Vec::new(),
                },
            ],
        }],
        ..ChorusConfig::default()
    }
}

/// What [`seed_repository`] wrote.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub agents: usize,
    pub flows: usize,
}

/// Write configured agents and flows that persistence does not have yet.
///
/// Existing rows are left untouched, so edits made through the store
/// survive restarts.
pub async fn seed_repository<A: AgentRepository>(
    repo: &A,
    config: &ChorusConfig,
) -> Result<SeedReport, RepositoryError> {
    let mut report = SeedReport::default();

    let existing = repo.list_agents(false).await?;
    for agent in &config.agents {
        if existing.iter().any(|a| a.role == agent.role) {
            continue;
        }
        repo.save_agent(agent).await?;
        report.agents += 1;
    }

    for flow in &config.flows {
        match repo.get_flow(flow.mode).await? {
            Some(stored) if stored.name == flow.name => continue,
            _ => {
                repo.save_flow(flow).await?;
                report.flows += 1;
            }
        }
    }

    if report != SeedReport::default() {
        tracing::info!(agents = report.agents, flows = report.flows, "seeded persistence from config");
    }
    Ok(report)
}
