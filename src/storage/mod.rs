//! Storage layer for narrative session persistence.
//!
//! This module provides the session aggregate and its child records (story
//! nodes, choices, path rows, consequences, deaths) together with the
//! [`Storage`] trait and its SQLite implementation. All writes go through
//! [`Storage::apply`], which commits a [`StoreBatch`] atomically.

mod sqlite;


pub use sqlite::SqliteStorage;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::memory::MemoryRecord;

/// Branch id given to the live timeline when a session has no active path rows.
pub const MAIN_BRANCH_ID: &str = "main";

/// Maximum number of entries kept in [`Session::pending_consequences`].
pub const PENDING_CACHE_LIMIT: usize = 50;

// ============================================================================
// Enums
// ============================================================================

/// Session difficulty, which drives the permadeath threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
    Hardcore,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Difficulty::Easy => write!(f, "easy"),
            Difficulty::Normal => write!(f, "normal"),
            Difficulty::Hard => write!(f, "hard"),
            Difficulty::Hardcore => write!(f, "hardcore"),
        }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "normal" => Ok(Difficulty::Normal),
            "hard" => Ok(Difficulty::Hard),
            "hardcore" => Ok(Difficulty::Hardcore),
            _ => Err(format!("Unknown difficulty: {}", s)),
        }
    }
}

/// How severe a consequence is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Major,
    Critical,
}

impl Severity {
    /// Ordering weight used when evicting pending cache entries (critical = 4).
    pub fn weight(&self) -> u8 {
        match self {
            Severity::Minor => 1,
            Severity::Moderate => 2,
            Severity::Major => 3,
            Severity::Critical => 4,
        }
    }

    /// Importance of the memory written when a consequence of this severity fires.
    pub fn memory_importance(&self) -> f64 {
        match self {
            Severity::Minor => 0.3,
            Severity::Moderate => 0.5,
            Severity::Major => 0.7,
            Severity::Critical => 0.9,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Minor => write!(f, "minor"),
            Severity::Moderate => write!(f, "moderate"),
            Severity::Major => write!(f, "major"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minor" => Ok(Severity::Minor),
            "moderate" => Ok(Severity::Moderate),
            "major" => Ok(Severity::Major),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Delay class of a consequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeToTrigger {
    /// Fires as soon as it is persisted.
    Immediate,
    /// 1 to 3 hours later.
    Short,
    /// 6 to 24 hours later.
    Medium,
    /// 2 to 7 days later.
    Long,
}

impl std::fmt::Display for TimeToTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeToTrigger::Immediate => write!(f, "immediate"),
            TimeToTrigger::Short => write!(f, "short"),
            TimeToTrigger::Medium => write!(f, "medium"),
            TimeToTrigger::Long => write!(f, "long"),
        }
    }
}

impl std::str::FromStr for TimeToTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(TimeToTrigger::Immediate),
            "short" => Ok(TimeToTrigger::Short),
            "medium" => Ok(TimeToTrigger::Medium),
            "long" => Ok(TimeToTrigger::Long),
            _ => Err(format!("Unknown time to trigger: {}", s)),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A play session: the aggregate every engine operation mutates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// The character playing this session.
    pub character_id: String,
    /// False once the session has ended; never flips back.
    pub active: bool,
    /// Node the player is currently looking at.
    pub current_node_id: Option<String>,
    /// Last assessed danger level (0-10).
    pub danger_level: u8,
    /// Bounded, priority-ordered cache of consequences that have not fired yet.
    pub pending_consequences: Vec<PendingConsequence>,
    /// Whether lethal judgements may end the session.
    pub permadeath_enabled: bool,
    pub difficulty: Difficulty,
    /// Decisions that went through consequence evaluation.
    pub significant_decisions: u32,
    pub quests_completed: u32,
    pub near_death_count: u32,
    /// Why the session ended, if it ended by death.
    pub death_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Compact summary of a not-yet-fired consequence, stored on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConsequence {
    pub id: String,
    pub title: String,
    pub trigger_time: DateTime<Utc>,
    pub severity: Severity,
    pub description: String,
}

/// An item carried by a character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    /// Free-form effect flags, e.g. `{"preventDeath": true}`.
    #[serde(default)]
    pub effects: HashMap<String, serde_json::Value>,
}

/// A named special ability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialAbility {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The fields of a player character this engine reads or writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub strength: i32,
    pub mana: i32,
    pub health: i32,
    pub inventory: Vec<Item>,
    pub special_abilities: Vec<SpecialAbility>,
    /// Descriptions of permanent consequences applied to this character.
    pub permanent_effects: Vec<String>,
    pub is_alive: bool,
    pub death_date: Option<DateTime<Utc>>,
    pub near_death_experiences: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attribute, item, currency, flag and location deltas attached to a choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChoiceConsequences {
    pub attribute_changes: HashMap<String, i32>,
    pub items_gained: Vec<String>,
    pub items_lost: Vec<String>,
    pub currency_change: i64,
    pub flags_set: HashMap<String, bool>,
    pub location_change: Option<String>,
}

/// An option offered to the player at a story node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    /// Node this choice belongs to.
    pub node_id: String,
    pub text: String,
    pub order: u32,
    pub consequences: ChoiceConsequences,
    /// Hint forwarded to the generator when this choice is taken.
    pub next_prompt: Option<String>,
}

/// A node in the session's story tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryNode {
    pub id: String,
    pub session_id: String,
    pub content: String,
    /// `None` for the tree root.
    pub parent_node_id: Option<String>,
    /// Choice on the parent that leads here; unique together with `parent_node_id`.
    pub choice_id_from_parent: Option<String>,
    pub depth: u32,
    pub is_visited: bool,
    pub selected_choice_id: Option<String>,
    pub selected_choice_text: Option<String>,
    pub choices: Vec<Choice>,
    pub created_at: DateTime<Utc>,
}

/// One taken step on some timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPath {
    pub id: String,
    pub session_id: String,
    /// Node reached by this step.
    pub node_id: String,
    /// Choice taken to reach `node_id`.
    pub choice_id: String,
    pub step_order: u32,
    pub is_active: bool,
    pub branch_id: String,
    pub parent_path_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A scheduled or immediate effect of a player action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consequence {
    pub id: String,
    pub session_id: String,
    pub description: String,
    pub severity: Severity,
    pub time_to_trigger: TimeToTrigger,
    pub trigger_time: DateTime<Utc>,
    pub is_permanent: bool,
    /// Flips false -> true exactly once.
    pub is_triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub affected_entities: Vec<String>,
    pub source_action_id: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Immutable snapshot written when a character dies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDeath {
    pub id: String,
    pub session_id: String,
    pub character_id: String,
    pub cause: String,
    pub last_node_id: Option<String>,
    pub last_decision: String,
    pub last_words: Vec<String>,
    pub level: u32,
    pub days_survived: i64,
    pub quests_completed: u32,
    pub significant_decisions: u32,
    pub epitaph: String,
    pub died_at: DateTime<Utc>,
}

// ============================================================================
// Constructors and builders
// ============================================================================

impl Session {
    /// Create a new active session for a character.
    pub fn new(character_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            character_id: character_id.into(),
            active: true,
            current_node_id: None,
            danger_level: 0,
            pending_consequences: Vec::new(),
            permadeath_enabled: false,
            difficulty: Difficulty::default(),
            significant_decisions: 0,
            quests_completed: 0,
            near_death_count: 0,
            death_reason: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Set the difficulty
    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Enable or disable permadeath
    pub fn with_permadeath(mut self, enabled: bool) -> Self {
        self.permadeath_enabled = enabled;
        self
    }
}

impl Character {
    /// Create a level 1 character with default stats.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            level: 1,
            strength: 10,
            mana: 50,
            health: 100,
            inventory: Vec::new(),
            special_abilities: Vec::new(),
            permanent_effects: Vec::new(),
            is_alive: true,
            death_date: None,
            near_death_experiences: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the level
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Add an item without effects
    pub fn with_item(mut self, name: impl Into<String>) -> Self {
        self.inventory.push(Item {
            name: name.into(),
            effects: HashMap::new(),
        });
        self
    }

    /// Add an item with effect flags
    pub fn with_item_effects(
        mut self,
        name: impl Into<String>,
        effects: HashMap<String, serde_json::Value>,
    ) -> Self {
        self.inventory.push(Item {
            name: name.into(),
            effects,
        });
        self
    }

    /// Add a special ability
    pub fn with_ability(mut self, name: impl Into<String>) -> Self {
        self.special_abilities.push(SpecialAbility {
            name: name.into(),
            description: None,
        });
        self
    }
}

impl Choice {
    /// Create a new choice on a node
    pub fn new(node_id: impl Into<String>, text: impl Into<String>, order: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            text: text.into(),
            order,
            consequences: ChoiceConsequences::default(),
            next_prompt: None,
        }
    }

    /// Set the generator hint
    pub fn with_next_prompt(mut self, next_prompt: impl Into<String>) -> Self {
        self.next_prompt = Some(next_prompt.into());
        self
    }

    /// Set the attached deltas
    pub fn with_consequences(mut self, consequences: ChoiceConsequences) -> Self {
        self.consequences = consequences;
        self
    }
}

impl StoryNode {
    /// Create a root node (depth 0, no parent).
    pub fn root(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            parent_node_id: None,
            choice_id_from_parent: None,
            depth: 0,
            is_visited: false,
            selected_choice_id: None,
            selected_choice_text: None,
            choices: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Create the child reached from `parent` through `choice`.
    pub fn child(parent: &StoryNode, choice: &Choice, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: parent.session_id.clone(),
            content: content.into(),
            parent_node_id: Some(parent.id.clone()),
            choice_id_from_parent: Some(choice.id.clone()),
            depth: parent.depth + 1,
            is_visited: false,
            selected_choice_id: None,
            selected_choice_text: None,
            choices: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append a choice with the given text, ordered after existing choices.
    pub fn with_choice(mut self, text: impl Into<String>) -> Self {
        let order = self.choices.len() as u32;
        self.choices.push(Choice::new(&self.id, text, order));
        self
    }

    /// Look up one of this node's choices.
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.id == choice_id)
    }

    /// True for the tree root.
    pub fn is_root(&self) -> bool {
        self.parent_node_id.is_none()
    }
}

impl StoryPath {
    /// Create a new active path row.
    pub fn new(
        session_id: impl Into<String>,
        node_id: impl Into<String>,
        choice_id: impl Into<String>,
        step_order: u32,
        branch_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            node_id: node_id.into(),
            choice_id: choice_id.into(),
            step_order,
            is_active: true,
            branch_id: branch_id.into(),
            parent_path_id: None,
            created_at: Utc::now(),
        }
    }

    /// Set the parent path row
    pub fn with_parent(mut self, parent_path_id: impl Into<String>) -> Self {
        self.parent_path_id = Some(parent_path_id.into());
        self
    }
}

impl Consequence {
    /// Create a new untriggered consequence.
    pub fn new(
        session_id: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        time_to_trigger: TimeToTrigger,
        trigger_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            description: description.into(),
            severity,
            time_to_trigger,
            trigger_time,
            is_permanent: false,
            is_triggered: false,
            triggered_at: None,
            affected_entities: Vec::new(),
            source_action_id: String::new(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Mark as permanent
    pub fn with_permanent(mut self, is_permanent: bool) -> Self {
        self.is_permanent = is_permanent;
        self
    }

    /// Set the originating action
    pub fn with_source_action(mut self, source_action_id: impl Into<String>) -> Self {
        self.source_action_id = source_action_id.into();
        self
    }

    /// Set affected entities
    pub fn with_affected_entities(mut self, entities: Vec<String>) -> Self {
        self.affected_entities = entities;
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ============================================================================
// Unit of work
// ============================================================================

/// A single write inside a [`StoreBatch`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    UpsertSession(Session),
    UpsertCharacter(Character),
    /// Insert a node together with its choices.
    InsertNode(StoryNode),
    /// Update a node's visited/selected-choice fields.
    UpdateNode(StoryNode),
    UpsertPath(StoryPath),
    InsertConsequence(Consequence),
    MarkTriggered {
        consequence_id: String,
        triggered_at: DateTime<Utc>,
    },
    InsertDeath(CharacterDeath),
}

/// Ordered set of writes committed in one transaction by [`Storage::apply`].
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    ops: Vec<StoreOp>,
}

impl StoreBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary operation
    pub fn push(&mut self, op: StoreOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn upsert_session(&mut self, session: Session) -> &mut Self {
        self.push(StoreOp::UpsertSession(session))
    }

    pub fn upsert_character(&mut self, character: Character) -> &mut Self {
        self.push(StoreOp::UpsertCharacter(character))
    }

    pub fn insert_node(&mut self, node: StoryNode) -> &mut Self {
        self.push(StoreOp::InsertNode(node))
    }

    pub fn update_node(&mut self, node: StoryNode) -> &mut Self {
        self.push(StoreOp::UpdateNode(node))
    }

    pub fn upsert_path(&mut self, path: StoryPath) -> &mut Self {
        self.push(StoreOp::UpsertPath(path))
    }

    pub fn insert_consequence(&mut self, consequence: Consequence) -> &mut Self {
        self.push(StoreOp::InsertConsequence(consequence))
    }

    pub fn mark_triggered(
        &mut self,
        consequence_id: impl Into<String>,
        triggered_at: DateTime<Utc>,
    ) -> &mut Self {
        self.push(StoreOp::MarkTriggered {
            consequence_id: consequence_id.into(),
            triggered_at,
        })
    }

    pub fn insert_death(&mut self, death: CharacterDeath) -> &mut Self {
        self.push(StoreOp::InsertDeath(death))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Transactional repository for sessions and their child records.
///
/// Reads are plain lookups; every write goes through [`Storage::apply`] so a
/// multi-row change either lands completely or not at all.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Commit all operations of the batch in one transaction.
    async fn apply(&self, batch: StoreBatch) -> StorageResult<()>;

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;

    async fn get_character(&self, id: &str) -> StorageResult<Option<Character>>;

    /// Get a node with its choices.
    async fn get_node(&self, id: &str) -> StorageResult<Option<StoryNode>>;
    /// Get the child reached from `parent_node_id` through `choice_id`, if one exists.
    async fn get_child_node(
        &self,
        parent_node_id: &str,
        choice_id: &str,
    ) -> StorageResult<Option<StoryNode>>;
    async fn get_session_nodes(&self, session_id: &str) -> StorageResult<Vec<StoryNode>>;
    async fn get_choice(&self, id: &str) -> StorageResult<Option<Choice>>;

    /// All path rows of a session ordered by step order, then id.
    async fn get_session_paths(&self, session_id: &str) -> StorageResult<Vec<StoryPath>>;
    /// Active path rows ordered by step order, then id.
    async fn get_active_paths(&self, session_id: &str) -> StorageResult<Vec<StoryPath>>;
    async fn get_branch_paths(
        &self,
        session_id: &str,
        branch_id: &str,
    ) -> StorageResult<Vec<StoryPath>>;

    async fn get_consequence(&self, id: &str) -> StorageResult<Option<Consequence>>;
    async fn get_session_consequences(&self, session_id: &str) -> StorageResult<Vec<Consequence>>;
    async fn get_untriggered_consequences(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<Consequence>>;
    /// Untriggered consequences across all sessions with `trigger_time <= now`.
    async fn get_due_consequences(&self, now: DateTime<Utc>) -> StorageResult<Vec<Consequence>>;

    async fn get_character_death(&self, session_id: &str)
        -> StorageResult<Option<CharacterDeath>>;

    async fn get_session_memories(&self, session_id: &str) -> StorageResult<Vec<MemoryRecord>>;
}
