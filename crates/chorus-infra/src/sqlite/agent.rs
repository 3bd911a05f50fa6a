//! SQLite agent and flow repository implementation.
//!
//! Capabilities and flow stages are stored as JSON text columns.

use sqlx::Row;

use chorus_core::repository::AgentRepository;
use chorus_types::agent::AgentDefinition;
use chorus_types::conversation::ConversationMode;
use chorus_types::error::RepositoryError;
use chorus_types::plan::{Flow, FlowStage};

use super::pool::DatabasePool;
use super::query_error;

/// SQLite implementation of [`AgentRepository`].
pub struct SqliteAgentRepository {
    pool: DatabasePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct AgentRow {
    role: String,
    display_name: String,
    system_prompt: String,
    temperature: f64,
    max_tokens: i64,
    model: String,
    enabled: bool,
    priority: i64,
    sort_order: i64,
    capabilities: String,
}

impl AgentRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            role: row.try_get("role")?,
            display_name: row.try_get("display_name")?,
            system_prompt: row.try_get("system_prompt")?,
            temperature: row.try_get("temperature")?,
            max_tokens: row.try_get("max_tokens")?,
            model: row.try_get("model")?,
            enabled: row.try_get("enabled")?,
            priority: row.try_get("priority")?,
            sort_order: row.try_get("sort_order")?,
            capabilities: row.try_get("capabilities")?,
        })
    }

    fn into_domain(self) -> Result<AgentDefinition, RepositoryError> {
        let capabilities: Vec<String> = serde_json::from_str(&self.capabilities)
            .map_err(|e| RepositoryError::Query(format!("invalid capabilities: {e}")))?;
        let int = |v: i64, field: &str| {
            u32::try_from(v).map_err(|_| RepositoryError::Query(format!("invalid {field}: {v}")))
        };

        Ok(AgentDefinition {
            max_tokens: int(self.max_tokens, "max_tokens")?,
            priority: int(self.priority, "priority")?,
            order: int(self.sort_order, "sort_order")?,
            role: self.role,
            display_name: self.display_name,
            system_prompt: self.system_prompt,
            temperature: self.temperature,
            model: self.model,
            enabled: self.enabled,
            capabilities,
        })
    }
}

struct FlowRow {
    name: String,
    mode: String,
    stages: String,
}

impl FlowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get("name")?,
            mode: row.try_get("mode")?,
            stages: row.try_get("stages")?,
        })
    }

    fn into_domain(self) -> Result<Flow, RepositoryError> {
        let mode = self
            .mode
            .parse::<ConversationMode>()
            .map_err(RepositoryError::Query)?;
        let stages: Vec<FlowStage> = serde_json::from_str(&self.stages)
            .map_err(|e| RepositoryError::Query(format!("invalid flow stages: {e}")))?;
        Ok(Flow {
            name: self.name,
            mode,
            stages,
        })
    }
}

impl AgentRepository for SqliteAgentRepository {
    async fn list_agents(&self, enabled_only: bool) -> Result<Vec<AgentDefinition>, RepositoryError> {
        let sql = if enabled_only {
            "SELECT * FROM agents WHERE enabled = 1 ORDER BY priority ASC, sort_order ASC, role ASC"
        } else {
            "SELECT * FROM agents ORDER BY priority ASC, sort_order ASC, role ASC"
        };
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| AgentRow::from_row(row).map_err(query_error)?.into_domain())
            .collect()
    }

    async fn save_agent(&self, agent: &AgentDefinition) -> Result<(), RepositoryError> {
        let capabilities = serde_json::to_string(&agent.capabilities)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            "INSERT INTO agents (role, display_name, system_prompt, temperature, max_tokens,
                                 model, enabled, priority, sort_order, capabilities)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(role) DO UPDATE SET
                 display_name = excluded.display_name,
                 system_prompt = excluded.system_prompt,
                 temperature = excluded.temperature,
                 max_tokens = excluded.max_tokens,
                 model = excluded.model,
                 enabled = excluded.enabled,
                 priority = excluded.priority,
                 sort_order = excluded.sort_order,
                 capabilities = excluded.capabilities",
        )
        .bind(&agent.role)
        .bind(&agent.display_name)
        .bind(&agent.system_prompt)
        .bind(agent.temperature)
        .bind(i64::from(agent.max_tokens))
        .bind(&agent.model)
        .bind(agent.enabled)
        .bind(i64::from(agent.priority))
        .bind(i64::from(agent.order))
        .bind(&capabilities)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_flow(&self, mode: ConversationMode) -> Result<Option<Flow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM flows WHERE mode = ? ORDER BY name ASC LIMIT 1")
            .bind(mode.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(FlowRow::from_row(&row).map_err(query_error)?.into_domain()?)),
            None => Ok(None),
        }
    }

    async fn save_flow(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let stages =
            serde_json::to_string(&flow.stages).map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            "INSERT INTO flows (name, mode, stages) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET mode = excluded.mode, stages = excluded.stages",
        )
        .bind(&flow.name)
        .bind(flow.mode.to_string())
        .bind(&stages)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }
}
