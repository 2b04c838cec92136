use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info};

use super::{
    Character, CharacterDeath, Choice, Consequence, Session, Storage, StoreBatch, StoreOp,
    StoryNode, StoryPath,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::memory::{MemoryRecord, MemoryRecorder};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory instance (single connection, for tests)
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_choices(&self, node_id: &str) -> StorageResult<Vec<Choice>> {
        let rows: Vec<ChoiceRow> = sqlx::query_as(
            r#"
            SELECT id, node_id, text, display_order, consequences, next_prompt
            FROM choices
            WHERE node_id = ?
            ORDER BY display_order ASC, id ASC
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Choice::try_from).collect()
    }

    async fn with_choices(&self, row: Option<NodeRow>) -> StorageResult<Option<StoryNode>> {
        match row {
            Some(row) => {
                let choices = self.load_choices(&row.id).await?;
                Ok(Some(row.into_node(choices)))
            }
            None => Ok(None),
        }
    }

    async fn fetch_paths(&self, sql: &str, binds: &[&str]) -> StorageResult<Vec<StoryPath>> {
        let mut query = sqlx::query_as::<_, PathRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(StoryPath::from).collect())
    }

    async fn fetch_consequences(
        &self,
        sql: &str,
        binds: &[String],
    ) -> StorageResult<Vec<Consequence>> {
        let mut query = sqlx::query_as::<_, ConsequenceRow>(sql);
        for value in binds {
            query = query.bind(value.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Consequence::try_from).collect()
    }
}

// ============================================================================
// Write helpers (run inside the batch transaction)
// ============================================================================

async fn upsert_session(conn: &mut SqliteConnection, session: &Session) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (
            id, character_id, active, current_node_id, danger_level, pending_consequences,
            permadeath_enabled, difficulty, significant_decisions, quests_completed,
            near_death_count, death_reason, created_at, updated_at, ended_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            active = excluded.active,
            current_node_id = excluded.current_node_id,
            danger_level = excluded.danger_level,
            pending_consequences = excluded.pending_consequences,
            permadeath_enabled = excluded.permadeath_enabled,
            difficulty = excluded.difficulty,
            significant_decisions = excluded.significant_decisions,
            quests_completed = excluded.quests_completed,
            near_death_count = excluded.near_death_count,
            death_reason = excluded.death_reason,
            updated_at = excluded.updated_at,
            ended_at = excluded.ended_at
        "#,
    )
    .bind(&session.id)
    .bind(&session.character_id)
    .bind(session.active)
    .bind(&session.current_node_id)
    .bind(i64::from(session.danger_level))
    .bind(to_json(&session.pending_consequences)?)
    .bind(session.permadeath_enabled)
    .bind(session.difficulty.to_string())
    .bind(i64::from(session.significant_decisions))
    .bind(i64::from(session.quests_completed))
    .bind(i64::from(session.near_death_count))
    .bind(&session.death_reason)
    .bind(fmt_ts(&session.created_at))
    .bind(fmt_ts(&session.updated_at))
    .bind(session.ended_at.as_ref().map(fmt_ts))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn upsert_character(conn: &mut SqliteConnection, character: &Character) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO characters (
            id, name, level, strength, mana, health, inventory, special_abilities,
            permanent_effects, is_alive, death_date, near_death_experiences, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            level = excluded.level,
            strength = excluded.strength,
            mana = excluded.mana,
            health = excluded.health,
            inventory = excluded.inventory,
            special_abilities = excluded.special_abilities,
            permanent_effects = excluded.permanent_effects,
            is_alive = excluded.is_alive,
            death_date = excluded.death_date,
            near_death_experiences = excluded.near_death_experiences,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&character.id)
    .bind(&character.name)
    .bind(i64::from(character.level))
    .bind(i64::from(character.strength))
    .bind(i64::from(character.mana))
    .bind(i64::from(character.health))
    .bind(to_json(&character.inventory)?)
    .bind(to_json(&character.special_abilities)?)
    .bind(to_json(&character.permanent_effects)?)
    .bind(character.is_alive)
    .bind(character.death_date.as_ref().map(fmt_ts))
    .bind(i64::from(character.near_death_experiences))
    .bind(fmt_ts(&character.created_at))
    .bind(fmt_ts(&character.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_node(conn: &mut SqliteConnection, node: &StoryNode) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO story_nodes (
            id, session_id, content, parent_node_id, choice_id_from_parent, depth,
            is_visited, selected_choice_id, selected_choice_text, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&node.id)
    .bind(&node.session_id)
    .bind(&node.content)
    .bind(&node.parent_node_id)
    .bind(&node.choice_id_from_parent)
    .bind(i64::from(node.depth))
    .bind(node.is_visited)
    .bind(&node.selected_choice_id)
    .bind(&node.selected_choice_text)
    .bind(fmt_ts(&node.created_at))
    .execute(&mut *conn)
    .await?;

    for choice in &node.choices {
        sqlx::query(
            r#"
            INSERT INTO choices (id, node_id, text, display_order, consequences, next_prompt)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&choice.id)
        .bind(&node.id)
        .bind(&choice.text)
        .bind(i64::from(choice.order))
        .bind(to_json(&choice.consequences)?)
        .bind(&choice.next_prompt)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn update_node(conn: &mut SqliteConnection, node: &StoryNode) -> StorageResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE story_nodes
        SET content = ?, is_visited = ?, selected_choice_id = ?, selected_choice_text = ?
        WHERE id = ?
        "#,
    )
    .bind(&node.content)
    .bind(node.is_visited)
    .bind(&node.selected_choice_id)
    .bind(&node.selected_choice_text)
    .bind(&node.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::Query {
            message: format!("Story node not found: {}", node.id),
        });
    }

    Ok(())
}

async fn upsert_path(conn: &mut SqliteConnection, path: &StoryPath) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO story_paths (
            id, session_id, node_id, choice_id, step_order, is_active, branch_id,
            parent_path_id, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            is_active = excluded.is_active,
            branch_id = excluded.branch_id
        "#,
    )
    .bind(&path.id)
    .bind(&path.session_id)
    .bind(&path.node_id)
    .bind(&path.choice_id)
    .bind(i64::from(path.step_order))
    .bind(path.is_active)
    .bind(&path.branch_id)
    .bind(&path.parent_path_id)
    .bind(fmt_ts(&path.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_consequence(
    conn: &mut SqliteConnection,
    consequence: &Consequence,
) -> StorageResult<()> {
    let metadata = match &consequence.metadata {
        Some(value) => Some(to_json(value)?),
        None => None,
    };

    sqlx::query(
        r#"
        INSERT INTO consequences (
            id, session_id, description, severity, time_to_trigger, trigger_time,
            is_permanent, is_triggered, triggered_at, affected_entities, source_action_id,
            metadata, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&consequence.id)
    .bind(&consequence.session_id)
    .bind(&consequence.description)
    .bind(consequence.severity.to_string())
    .bind(consequence.time_to_trigger.to_string())
    .bind(fmt_ts(&consequence.trigger_time))
    .bind(consequence.is_permanent)
    .bind(consequence.is_triggered)
    .bind(consequence.triggered_at.as_ref().map(fmt_ts))
    .bind(to_json(&consequence.affected_entities)?)
    .bind(&consequence.source_action_id)
    .bind(metadata)
    .bind(fmt_ts(&consequence.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn mark_triggered(
    conn: &mut SqliteConnection,
    consequence_id: &str,
    triggered_at: &DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE consequences
        SET is_triggered = 1, triggered_at = ?
        WHERE id = ? AND is_triggered = 0
        "#,
    )
    .bind(fmt_ts(triggered_at))
    .bind(consequence_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_death(conn: &mut SqliteConnection, death: &CharacterDeath) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO character_deaths (
            id, session_id, character_id, cause, last_node_id, last_decision, last_words,
            level, days_survived, quests_completed, significant_decisions, epitaph, died_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&death.id)
    .bind(&death.session_id)
    .bind(&death.character_id)
    .bind(&death.cause)
    .bind(&death.last_node_id)
    .bind(&death.last_decision)
    .bind(to_json(&death.last_words)?)
    .bind(i64::from(death.level))
    .bind(death.days_survived)
    .bind(i64::from(death.quests_completed))
    .bind(i64::from(death.significant_decisions))
    .bind(&death.epitaph)
    .bind(fmt_ts(&death.died_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn apply(&self, batch: StoreBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let op_count = batch.len();
        let mut tx = self.pool.begin().await?;

        for op in batch.into_ops() {
            match op {
                StoreOp::UpsertSession(session) => upsert_session(&mut tx, &session).await?,
                StoreOp::UpsertCharacter(character) => {
                    upsert_character(&mut tx, &character).await?
                }
                StoreOp::InsertNode(node) => insert_node(&mut tx, &node).await?,
                StoreOp::UpdateNode(node) => update_node(&mut tx, &node).await?,
                StoreOp::UpsertPath(path) => upsert_path(&mut tx, &path).await?,
                StoreOp::InsertConsequence(consequence) => {
                    insert_consequence(&mut tx, &consequence).await?
                }
                StoreOp::MarkTriggered {
                    consequence_id,
                    triggered_at,
                } => mark_triggered(&mut tx, &consequence_id, &triggered_at).await?,
                StoreOp::InsertDeath(death) => insert_death(&mut tx, &death).await?,
            }
        }

        tx.commit().await?;

        debug!(
            ops = op_count,
            latency_ms = start.elapsed().as_millis(),
            "Store batch committed"
        );

        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, character_id, active, current_node_id, danger_level, pending_consequences,
                   permadeath_enabled, difficulty, significant_decisions, quests_completed,
                   near_death_count, death_reason, created_at, updated_at, ended_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn get_character(&self, id: &str) -> StorageResult<Option<Character>> {
        let row: Option<CharacterRow> = sqlx::query_as(
            r#"
            SELECT id, name, level, strength, mana, health, inventory, special_abilities,
                   permanent_effects, is_alive, death_date, near_death_experiences,
                   created_at, updated_at
            FROM characters
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Character::try_from).transpose()
    }

    async fn get_node(&self, id: &str) -> StorageResult<Option<StoryNode>> {
        let row: Option<NodeRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, content, parent_node_id, choice_id_from_parent, depth,
                   is_visited, selected_choice_id, selected_choice_text, created_at
            FROM story_nodes
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        self.with_choices(row).await
    }

    async fn get_child_node(
        &self,
        parent_node_id: &str,
        choice_id: &str,
    ) -> StorageResult<Option<StoryNode>> {
        let row: Option<NodeRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, content, parent_node_id, choice_id_from_parent, depth,
                   is_visited, selected_choice_id, selected_choice_text, created_at
            FROM story_nodes
            WHERE parent_node_id = ? AND choice_id_from_parent = ?
            "#,
        )
        .bind(parent_node_id)
        .bind(choice_id)
        .fetch_optional(&self.pool)
        .await?;

        self.with_choices(row).await
    }

    async fn get_session_nodes(&self, session_id: &str) -> StorageResult<Vec<StoryNode>> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, content, parent_node_id, choice_id_from_parent, depth,
                   is_visited, selected_choice_id, selected_choice_text, created_at
            FROM story_nodes
            WHERE session_id = ?
            ORDER BY depth ASC, created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let choice_rows: Vec<ChoiceRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.node_id, c.text, c.display_order, c.consequences, c.next_prompt
            FROM choices c
            JOIN story_nodes n ON n.id = c.node_id
            WHERE n.session_id = ?
            ORDER BY c.node_id ASC, c.display_order ASC, c.id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut choices_by_node: HashMap<String, Vec<Choice>> = HashMap::new();
        for row in choice_rows {
            let choice = Choice::try_from(row)?;
            choices_by_node
                .entry(choice.node_id.clone())
                .or_default()
                .push(choice);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let choices = choices_by_node.remove(&row.id).unwrap_or_default();
                row.into_node(choices)
            })
            .collect())
    }

    async fn get_choice(&self, id: &str) -> StorageResult<Option<Choice>> {
        let row: Option<ChoiceRow> = sqlx::query_as(
            r#"
            SELECT id, node_id, text, display_order, consequences, next_prompt
            FROM choices
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Choice::try_from).transpose()
    }

    async fn get_session_paths(&self, session_id: &str) -> StorageResult<Vec<StoryPath>> {
        self.fetch_paths(
            r#"
            SELECT id, session_id, node_id, choice_id, step_order, is_active, branch_id,
                   parent_path_id, created_at
            FROM story_paths
            WHERE session_id = ?
            ORDER BY step_order ASC, id ASC
            "#,
            &[session_id],
        )
        .await
    }

    async fn get_active_paths(&self, session_id: &str) -> StorageResult<Vec<StoryPath>> {
        self.fetch_paths(
            r#"
            SELECT id, session_id, node_id, choice_id, step_order, is_active, branch_id,
                   parent_path_id, created_at
            FROM story_paths
            WHERE session_id = ? AND is_active = 1
            ORDER BY step_order ASC, id ASC
            "#,
            &[session_id],
        )
        .await
    }

    async fn get_branch_paths(
        &self,
        session_id: &str,
        branch_id: &str,
    ) -> StorageResult<Vec<StoryPath>> {
        self.fetch_paths(
            r#"
            SELECT id, session_id, node_id, choice_id, step_order, is_active, branch_id,
                   parent_path_id, created_at
            FROM story_paths
            WHERE session_id = ? AND branch_id = ?
            ORDER BY step_order ASC, id ASC
            "#,
            &[session_id, branch_id],
        )
        .await
    }

    async fn get_consequence(&self, id: &str) -> StorageResult<Option<Consequence>> {
        let mut rows = self
            .fetch_consequences(
                r#"
                SELECT id, session_id, description, severity, time_to_trigger, trigger_time,
                       is_permanent, is_triggered, triggered_at, affected_entities,
                       source_action_id, metadata, created_at
                FROM consequences
                WHERE id = ?
                "#,
                &[id.to_string()],
            )
            .await?;

        Ok(rows.pop())
    }

    async fn get_session_consequences(&self, session_id: &str) -> StorageResult<Vec<Consequence>> {
        self.fetch_consequences(
            r#"
            SELECT id, session_id, description, severity, time_to_trigger, trigger_time,
                   is_permanent, is_triggered, triggered_at, affected_entities,
                   source_action_id, metadata, created_at
            FROM consequences
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
            &[session_id.to_string()],
        )
        .await
    }

    async fn get_untriggered_consequences(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<Consequence>> {
        self.fetch_consequences(
            r#"
            SELECT id, session_id, description, severity, time_to_trigger, trigger_time,
                   is_permanent, is_triggered, triggered_at, affected_entities,
                   source_action_id, metadata, created_at
            FROM consequences
            WHERE session_id = ? AND is_triggered = 0
            ORDER BY trigger_time ASC, id ASC
            "#,
            &[session_id.to_string()],
        )
        .await
    }

    async fn get_due_consequences(&self, now: DateTime<Utc>) -> StorageResult<Vec<Consequence>> {
        self.fetch_consequences(
            r#"
            SELECT id, session_id, description, severity, time_to_trigger, trigger_time,
                   is_permanent, is_triggered, triggered_at, affected_entities,
                   source_action_id, metadata, created_at
            FROM consequences
            WHERE is_triggered = 0 AND trigger_time <= ?
            ORDER BY session_id ASC, trigger_time ASC, id ASC
            "#,
            &[fmt_ts(&now)],
        )
        .await
    }

    async fn get_character_death(
        &self,
        session_id: &str,
    ) -> StorageResult<Option<CharacterDeath>> {
        let row: Option<DeathRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, character_id, cause, last_node_id, last_decision, last_words,
                   level, days_survived, quests_completed, significant_decisions, epitaph, died_at
            FROM character_deaths
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CharacterDeath::try_from).transpose()
    }

    async fn get_session_memories(&self, session_id: &str) -> StorageResult<Vec<MemoryRecord>> {
        let rows: Vec<MemoryRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, character_id, title, content, kind, importance, created_at
            FROM memories
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MemoryRecord::try_from).collect()
    }
}

#[async_trait]
impl MemoryRecorder for SqliteStorage {
    async fn record_memory(&self, memory: &MemoryRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO memories (id, session_id, character_id, title, content, kind, importance, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&memory.id)
        .bind(&memory.session_id)
        .bind(&memory.character_id)
        .bind(&memory.title)
        .bind(&memory.content)
        .bind(memory.kind.to_string())
        .bind(memory.importance)
        .bind(fmt_ts(&memory.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Fixed-width RFC 3339 so stored timestamps order lexicographically.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("Invalid timestamp '{}': {}", value, e),
        })
}

fn parse_opt_ts(value: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(value: &str) -> StorageResult<T> {
    serde_json::from_str(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> StorageResult<T> {
    value
        .parse()
        .map_err(|message| StorageError::Serialization { message })
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn to_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

// ============================================================================
// Row types for SQLx mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    character_id: String,
    active: bool,
    current_node_id: Option<String>,
    danger_level: i64,
    pending_consequences: String,
    permadeath_enabled: bool,
    difficulty: String,
    significant_decisions: i64,
    quests_completed: i64,
    near_death_count: i64,
    death_reason: Option<String>,
    created_at: String,
    updated_at: String,
    ended_at: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            character_id: row.character_id,
            active: row.active,
            current_node_id: row.current_node_id,
            danger_level: row.danger_level.clamp(0, 10) as u8,
            pending_consequences: from_json(&row.pending_consequences)?,
            permadeath_enabled: row.permadeath_enabled,
            difficulty: parse_enum(&row.difficulty)?,
            significant_decisions: to_u32(row.significant_decisions),
            quests_completed: to_u32(row.quests_completed),
            near_death_count: to_u32(row.near_death_count),
            death_reason: row.death_reason,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            ended_at: parse_opt_ts(row.ended_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CharacterRow {
    id: String,
    name: String,
    level: i64,
    strength: i64,
    mana: i64,
    health: i64,
    inventory: String,
    special_abilities: String,
    permanent_effects: String,
    is_alive: bool,
    death_date: Option<String>,
    near_death_experiences: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<CharacterRow> for Character {
    type Error = StorageError;

    fn try_from(row: CharacterRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            level: to_u32(row.level),
            strength: to_i32(row.strength),
            mana: to_i32(row.mana),
            health: to_i32(row.health),
            inventory: from_json(&row.inventory)?,
            special_abilities: from_json(&row.special_abilities)?,
            permanent_effects: from_json(&row.permanent_effects)?,
            is_alive: row.is_alive,
            death_date: parse_opt_ts(row.death_date)?,
            near_death_experiences: to_u32(row.near_death_experiences),
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    session_id: String,
    content: String,
    parent_node_id: Option<String>,
    choice_id_from_parent: Option<String>,
    depth: i64,
    is_visited: bool,
    selected_choice_id: Option<String>,
    selected_choice_text: Option<String>,
    created_at: String,
}

impl NodeRow {
    fn into_node(self, choices: Vec<Choice>) -> StoryNode {
        StoryNode {
            created_at: parse_ts(&self.created_at).unwrap_or_else(|_| Utc::now()),
            id: self.id,
            session_id: self.session_id,
            content: self.content,
            parent_node_id: self.parent_node_id,
            choice_id_from_parent: self.choice_id_from_parent,
            depth: to_u32(self.depth),
            is_visited: self.is_visited,
            selected_choice_id: self.selected_choice_id,
            selected_choice_text: self.selected_choice_text,
            choices,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChoiceRow {
    id: String,
    node_id: String,
    text: String,
    display_order: i64,
    consequences: String,
    next_prompt: Option<String>,
}

impl TryFrom<ChoiceRow> for Choice {
    type Error = StorageError;

    fn try_from(row: ChoiceRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            node_id: row.node_id,
            text: row.text,
            order: to_u32(row.display_order),
            consequences: from_json(&row.consequences)?,
            next_prompt: row.next_prompt,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PathRow {
    id: String,
    session_id: String,
    node_id: String,
    choice_id: String,
    step_order: i64,
    is_active: bool,
    branch_id: String,
    parent_path_id: Option<String>,
    created_at: String,
}

impl From<PathRow> for StoryPath {
    fn from(row: PathRow) -> Self {
        Self {
            created_at: parse_ts(&row.created_at).unwrap_or_else(|_| Utc::now()),
            id: row.id,
            session_id: row.session_id,
            node_id: row.node_id,
            choice_id: row.choice_id,
            step_order: to_u32(row.step_order),
            is_active: row.is_active,
            branch_id: row.branch_id,
            parent_path_id: row.parent_path_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConsequenceRow {
    id: String,
    session_id: String,
    description: String,
    severity: String,
    time_to_trigger: String,
    trigger_time: String,
    is_permanent: bool,
    is_triggered: bool,
    triggered_at: Option<String>,
    affected_entities: String,
    source_action_id: String,
    metadata: Option<String>,
    created_at: String,
}

impl TryFrom<ConsequenceRow> for Consequence {
    type Error = StorageError;

    fn try_from(row: ConsequenceRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            description: row.description,
            severity: parse_enum(&row.severity)?,
            time_to_trigger: parse_enum(&row.time_to_trigger)?,
            trigger_time: parse_ts(&row.trigger_time)?,
            is_permanent: row.is_permanent,
            is_triggered: row.is_triggered,
            triggered_at: parse_opt_ts(row.triggered_at)?,
            affected_entities: from_json(&row.affected_entities)?,
            source_action_id: row.source_action_id,
            metadata: row.metadata.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeathRow {
    id: String,
    session_id: String,
    character_id: String,
    cause: String,
    last_node_id: Option<String>,
    last_decision: String,
    last_words: String,
    level: i64,
    days_survived: i64,
    quests_completed: i64,
    significant_decisions: i64,
    epitaph: String,
    died_at: String,
}

impl TryFrom<DeathRow> for CharacterDeath {
    type Error = StorageError;

    fn try_from(row: DeathRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            character_id: row.character_id,
            cause: row.cause,
            last_node_id: row.last_node_id,
            last_decision: row.last_decision,
            last_words: from_json(&row.last_words)?,
            level: to_u32(row.level),
            days_survived: row.days_survived,
            quests_completed: to_u32(row.quests_completed),
            significant_decisions: to_u32(row.significant_decisions),
            epitaph: row.epitaph,
            died_at: parse_ts(&row.died_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MemoryRow {
    id: String,
    session_id: String,
    character_id: String,
    title: String,
    content: String,
    kind: String,
    importance: f64,
    created_at: String,
}

impl TryFrom<MemoryRow> for MemoryRecord {
    type Error = StorageError;

    fn try_from(row: MemoryRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            character_id: row.character_id,
            title: row.title,
            content: row.content,
            kind: parse_enum(&row.kind)?,
            importance: row.importance,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}
